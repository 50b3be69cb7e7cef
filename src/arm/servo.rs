// Joint angles <-> PWM duty-cycle ticks
//
// Every servo on the controller shares one pulse range (ChannelRange) over one
// angle range; each joint then restricts itself to its own mechanical limits.

use std::fmt;
use std::str::FromStr;

use crate::config::ConfigError;

use super::pwm::{Channel, MAX_TICK};

/// The four joints of the arm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JointId {
    Grip,
    Base,
    Elbow,
    Shoulder,
}

impl JointId {
    pub const ALL: [JointId; 4] = [
        JointId::Grip,
        JointId::Base,
        JointId::Elbow,
        JointId::Shoulder,
    ];

    pub const fn index(self) -> usize {
        match self {
            JointId::Grip => 0,
            JointId::Base => 1,
            JointId::Elbow => 2,
            JointId::Shoulder => 3,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            JointId::Grip => "grip",
            JointId::Base => "base",
            JointId::Elbow => "elbow",
            JointId::Shoulder => "shoulder",
        }
    }
}

impl fmt::Display for JointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Unknown joint '{0}'")]
pub struct UnknownJoint(pub String);

impl FromStr for JointId {
    type Err = UnknownJoint;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JointId::ALL
            .into_iter()
            .find(|id| id.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownJoint(s.to_string()))
    }
}

/// Duty-cycle bounds (OFF tick) shared by every servo on one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelRange {
    pub min_tick: u16,
    pub max_tick: u16,
}

impl ChannelRange {
    pub const fn new(min_tick: u16, max_tick: u16) -> Self {
        Self { min_tick, max_tick }
    }
}

/// Linear map from logical angle to duty-cycle tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AngleMapper {
    min_angle: i32,
    max_angle: i32,
    range: ChannelRange,
}

impl AngleMapper {
    /// Fails if either range is empty or the ticks exceed the 12-bit counter
    pub fn new(min_angle: i32, max_angle: i32, range: ChannelRange) -> Result<Self, ConfigError> {
        if max_angle <= min_angle {
            return Err(ConfigError::EmptyAngleRange {
                name: "servo".to_string(),
                min: min_angle,
                max: max_angle,
            });
        }
        if range.max_tick <= range.min_tick || range.max_tick > MAX_TICK {
            return Err(ConfigError::InvalidTickRange {
                min: range.min_tick,
                max: range.max_tick,
            });
        }
        Ok(Self {
            min_angle,
            max_angle,
            range,
        })
    }

    /// OFF tick for an angle; angles outside the range are clamped first
    pub fn to_tick(&self, angle: i32) -> u16 {
        // i64 so wide configured angle ranges cannot overflow
        let angle = i64::from(angle.clamp(self.min_angle, self.max_angle));
        let min_angle = i64::from(self.min_angle);
        let span_ticks = i64::from(self.range.max_tick - self.range.min_tick);
        let span_angle = i64::from(self.max_angle) - min_angle;
        let tick = (angle - min_angle) * span_ticks / span_angle + i64::from(self.range.min_tick);
        tick as u16
    }

    pub fn angle_range(&self) -> (i32, i32) {
        (self.min_angle, self.max_angle)
    }

    pub fn channel_range(&self) -> ChannelRange {
        self.range
    }
}

/// Channel and mechanical limits of one joint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JointLimits {
    pub channel: Channel,
    pub min_angle: i32,
    pub max_angle: i32,
}

impl JointLimits {
    pub fn new(
        joint: JointId,
        channel: Channel,
        min_angle: i32,
        max_angle: i32,
    ) -> Result<Self, ConfigError> {
        if max_angle <= min_angle {
            return Err(ConfigError::EmptyAngleRange {
                name: joint.to_string(),
                min: min_angle,
                max: max_angle,
            });
        }
        Ok(Self {
            channel,
            min_angle,
            max_angle,
        })
    }

    pub fn clamp(&self, angle: i32) -> i32 {
        angle.clamp(self.min_angle, self.max_angle)
    }
}

/// One servo: where it is wired, how far it may move, where it is going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Joint {
    id: JointId,
    limits: JointLimits,
    // Angle reported to callers
    angle: i32,
    // Last commanded angle (equals `angle` under optimistic updates)
    target: i32,
}

impl Joint {
    /// Starts at 0 degrees, pulled into the joint's limits
    pub fn new(id: JointId, limits: JointLimits) -> Self {
        let angle = limits.clamp(0);
        Self {
            id,
            limits,
            angle,
            target: angle,
        }
    }

    pub fn id(&self) -> JointId {
        self.id
    }

    pub fn limits(&self) -> &JointLimits {
        &self.limits
    }

    pub fn channel(&self) -> Channel {
        self.limits.channel
    }

    pub fn angle(&self) -> i32 {
        self.angle
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub(crate) fn set_target(&mut self, target: i32) {
        self.target = self.limits.clamp(target);
    }

    pub(crate) fn set_angle(&mut self, angle: i32) {
        self.angle = self.limits.clamp(angle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper() -> AngleMapper {
        AngleMapper::new(0, 180, ChannelRange::new(50, 650)).unwrap()
    }

    fn limits(min: i32, max: i32) -> JointLimits {
        JointLimits::new(JointId::Elbow, Channel::new(2).unwrap(), min, max).unwrap()
    }

    #[test]
    fn test_mapping_endpoints() {
        let m = mapper();
        assert_eq!(m.to_tick(0), 50);
        assert_eq!(m.to_tick(180), 650);
        assert_eq!(m.to_tick(90), 350);
    }

    #[test]
    fn test_mapping_strictly_monotonic() {
        let m = mapper();
        for a in 0..180 {
            assert!(
                m.to_tick(a) < m.to_tick(a + 1),
                "tick({}) = {} not below tick({}) = {}",
                a,
                m.to_tick(a),
                a + 1,
                m.to_tick(a + 1)
            );
        }
    }

    #[test]
    fn test_mapping_clamps_outside_range() {
        let m = mapper();
        assert_eq!(m.to_tick(-30), 50);
        assert_eq!(m.to_tick(400), 650);
    }

    #[test]
    fn test_mapping_offset_angle_range() {
        let m = AngleMapper::new(-90, 90, ChannelRange::new(100, 500)).unwrap();
        assert_eq!(m.to_tick(-90), 100);
        assert_eq!(m.to_tick(0), 300);
        assert_eq!(m.to_tick(90), 500);
    }

    #[test]
    fn test_mapping_wide_angle_range() {
        let m = AngleMapper::new(0, 2_000_000_000, ChannelRange::new(50, 650)).unwrap();
        assert_eq!(m.to_tick(0), 50);
        assert_eq!(m.to_tick(1_000_000_000), 350);
        assert_eq!(m.to_tick(2_000_000_000), 650);

        let m = AngleMapper::new(i32::MIN, i32::MAX, ChannelRange::new(0, 4095)).unwrap();
        assert_eq!(m.to_tick(i32::MIN), 0);
        assert_eq!(m.to_tick(i32::MAX), 4095);
    }

    #[test]
    fn test_degenerate_ranges_rejected() {
        assert!(AngleMapper::new(90, 90, ChannelRange::new(50, 650)).is_err());
        assert!(AngleMapper::new(0, 180, ChannelRange::new(650, 50)).is_err());
        assert!(AngleMapper::new(0, 180, ChannelRange::new(50, 5000)).is_err());
        assert!(JointLimits::new(JointId::Base, Channel::new(1).unwrap(), 10, 10).is_err());
    }

    #[test]
    fn test_joint_clamp_law() {
        let l = limits(50, 110);
        assert_eq!(l.clamp(10), 50);
        assert_eq!(l.clamp(200), 110);
        assert_eq!(l.clamp(75), 75);
    }

    #[test]
    fn test_joint_starts_inside_limits() {
        let joint = Joint::new(JointId::Elbow, limits(50, 110));
        assert_eq!(joint.angle(), 50);
        assert_eq!(joint.target(), 50);

        let base = Joint::new(JointId::Base, limits(0, 180));
        assert_eq!(base.angle(), 0);
    }

    #[test]
    fn test_joint_id_parse() {
        assert_eq!("elbow".parse::<JointId>().unwrap(), JointId::Elbow);
        assert_eq!("SHOULDER".parse::<JointId>().unwrap(), JointId::Shoulder);
        assert_eq!(
            "wrist".parse::<JointId>(),
            Err(UnknownJoint("wrist".to_string()))
        );
    }
}
