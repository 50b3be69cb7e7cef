// Topics, PWM device settings, joint limits, motion timing
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::arm::motion::{MotionProfile, StateUpdate};
use crate::arm::pwm::{self, Channel};
use crate::arm::servo::{AngleMapper, ChannelRange, JointId, JointLimits};

// I2C bus the PWM controller hangs off (Raspberry Pi header pins 3/5)
pub const DEFAULT_I2C_BUS: &str = "/dev/i2c-1";

// Servo pulse range shared by every channel: 0..180 degrees -> 50..650 ticks
pub const SERVO_MIN_ANGLE: i32 = 0;
pub const SERVO_MAX_ANGLE: i32 = 180;
pub const SERVO_MIN_TICK: u16 = 50;
pub const SERVO_MAX_TICK: u16 = 650;

// Joint wiring and mechanical limits of the arm
pub const GRIP: JointConfig = JointConfig::new(0, 15, 120);
pub const BASE: JointConfig = JointConfig::new(1, 0, 180);
pub const ELBOW: JointConfig = JointConfig::new(2, 50, 110);
pub const SHOULDER: JointConfig = JointConfig::new(3, 60, 140);

// Grip endpoints: closing drives open -> closed, opening the reverse
pub const GRIP_OPEN_ANGLE: i32 = 15;
pub const GRIP_CLOSED_ANGLE: i32 = 120;

// Pose driven by ArmController::initialize
pub const NEUTRAL_ANGLE: i32 = 90;

// Bus fault handling inside motion workers
pub const WRITE_RETRIES: u32 = 2;
pub const ESCALATE_AFTER: u32 = 5;

// Runtime loop frequency (state/health publishing)
pub const LOOP_HZ: u64 = 10;

// Republish the arm state at least this often even if nothing changed
pub const STATE_HEARTBEAT: Duration = Duration::from_secs(1);

// Health stays at bus_fault this long after the last reported fault
pub const FAULT_HOLD: Duration = Duration::from_secs(2);

// Zenoh topics
pub const TOPIC_CMD_CONFIG: &str = "mearm/cmd/config"; // remote key/value commands
pub const TOPIC_ARM_REQUEST: &str = "mearm/arm/request"; // local request/reply
pub const TOPIC_STATE_ARM: &str = "mearm/state/arm"; // arm snapshot
pub const TOPIC_HEALTH: &str = "mearm/state/health"; // health status

/// Error types for configuration loading and validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },

    #[error("{name}: angle range {min}..{max} is empty")]
    EmptyAngleRange { name: String, min: i32, max: i32 },

    #[error("Tick range {min}..{max} is empty or exceeds 0..=4095")]
    InvalidTickRange { min: u16, max: u16 },

    #[error("{joint}: {source}")]
    InvalidChannel { joint: JointId, source: pwm::BusError },

    #[error("Channel {channel} is assigned to both {first} and {second}")]
    DuplicateChannel {
        channel: u8,
        first: JointId,
        second: JointId,
    },

    #[error("{joint}: limits {min}..{max} fall outside the servo range {servo_min}..{servo_max}")]
    JointOutsideServoRange {
        joint: JointId,
        min: i32,
        max: i32,
        servo_min: i32,
        servo_max: i32,
    },

    #[error("Grip angle {angle} is outside the grip limits {min}..{max}")]
    GripAngleOutOfBounds { angle: i32, min: i32, max: i32 },

    #[error("Invalid PWM frequency: {0}")]
    Frequency(pwm::BusError),

    #[error("Invalid motion settings: {0}")]
    Motion(String),
}

/// Channel and mechanical limits of one joint
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct JointConfig {
    pub channel: u8,
    pub min_angle: i32,
    pub max_angle: i32,
}

impl JointConfig {
    pub const fn new(channel: u8, min_angle: i32, max_angle: i32) -> Self {
        Self {
            channel,
            min_angle,
            max_angle,
        }
    }
}

/// Angle range and duty-cycle range common to every servo on the device
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServoRangeConfig {
    pub min_angle: i32,
    pub max_angle: i32,
    pub min_tick: u16,
    pub max_tick: u16,
}

impl Default for ServoRangeConfig {
    fn default() -> Self {
        Self {
            min_angle: SERVO_MIN_ANGLE,
            max_angle: SERVO_MAX_ANGLE,
            min_tick: SERVO_MIN_TICK,
            max_tick: SERVO_MAX_TICK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct NeutralPose {
    pub base: i32,
    pub shoulder: i32,
    pub elbow: i32,
}

impl Default for NeutralPose {
    fn default() -> Self {
        Self {
            base: NEUTRAL_ANGLE,
            shoulder: NEUTRAL_ANGLE,
            elbow: NEUTRAL_ANGLE,
        }
    }
}

/// Complete arm configuration.
///
/// Every field has a default, so a JSON file only needs to list what it
/// overrides:
///
/// ```json
/// { "elbow": { "channel": 2, "min_angle": 40, "max_angle": 120 },
///   "state_update": "on_completion" }
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArmConfig {
    pub address: u8,
    pub frequency_hz: f32,
    pub servo: ServoRangeConfig,
    pub grip: JointConfig,
    pub base: JointConfig,
    pub elbow: JointConfig,
    pub shoulder: JointConfig,
    pub grip_open_angle: i32,
    pub grip_closed_angle: i32,
    pub neutral: NeutralPose,
    pub motion: MotionProfile,
    pub state_update: StateUpdate,
    pub write_retries: u32,
    pub escalate_after: u32,
}

impl Default for ArmConfig {
    fn default() -> Self {
        Self {
            address: pwm::DEFAULT_ADDRESS,
            frequency_hz: pwm::DEFAULT_FREQUENCY_HZ,
            servo: ServoRangeConfig::default(),
            grip: GRIP,
            base: BASE,
            elbow: ELBOW,
            shoulder: SHOULDER,
            grip_open_angle: GRIP_OPEN_ANGLE,
            grip_closed_angle: GRIP_CLOSED_ANGLE,
            neutral: NeutralPose::default(),
            motion: MotionProfile::default(),
            state_update: StateUpdate::default(),
            write_retries: WRITE_RETRIES,
            escalate_after: ESCALATE_AFTER,
        }
    }
}

impl ArmConfig {
    /// Load overrides from a JSON file and validate the result
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn joint(&self, id: JointId) -> &JointConfig {
        match id {
            JointId::Grip => &self.grip,
            JointId::Base => &self.base,
            JointId::Elbow => &self.elbow,
            JointId::Shoulder => &self.shoulder,
        }
    }

    /// Angle mapper for the shared servo range
    pub fn mapper(&self) -> Result<AngleMapper, ConfigError> {
        AngleMapper::new(
            self.servo.min_angle,
            self.servo.max_angle,
            ChannelRange::new(self.servo.min_tick, self.servo.max_tick),
        )
    }

    /// Validated limits for one joint
    pub fn joint_limits(&self, id: JointId) -> Result<JointLimits, ConfigError> {
        let joint = self.joint(id);
        let channel = Channel::new(joint.channel)
            .map_err(|source| ConfigError::InvalidChannel { joint: id, source })?;
        let limits = JointLimits::new(id, channel, joint.min_angle, joint.max_angle)?;

        if joint.min_angle < self.servo.min_angle || joint.max_angle > self.servo.max_angle {
            return Err(ConfigError::JointOutsideServoRange {
                joint: id,
                min: joint.min_angle,
                max: joint.max_angle,
                servo_min: self.servo.min_angle,
                servo_max: self.servo.max_angle,
            });
        }
        Ok(limits)
    }

    /// Reject any setting that would fail at runtime
    pub fn validate(&self) -> Result<(), ConfigError> {
        pwm::prescale_for(self.frequency_hz).map_err(ConfigError::Frequency)?;
        self.mapper()?;

        for (i, &id) in JointId::ALL.iter().enumerate() {
            self.joint_limits(id)?;
            for &other in &JointId::ALL[i + 1..] {
                if self.joint(id).channel == self.joint(other).channel {
                    return Err(ConfigError::DuplicateChannel {
                        channel: self.joint(id).channel,
                        first: id,
                        second: other,
                    });
                }
            }
        }

        for angle in [self.grip_open_angle, self.grip_closed_angle] {
            if angle < self.grip.min_angle || angle > self.grip.max_angle {
                return Err(ConfigError::GripAngleOutOfBounds {
                    angle,
                    min: self.grip.min_angle,
                    max: self.grip.max_angle,
                });
            }
        }

        if self.grip_open_angle == self.grip_closed_angle {
            return Err(ConfigError::EmptyAngleRange {
                name: "grip endpoints".to_string(),
                min: self.grip_open_angle,
                max: self.grip_closed_angle,
            });
        }

        self.motion.validate().map_err(ConfigError::Motion)?;
        if self.escalate_after == 0 {
            return Err(ConfigError::Motion(
                "escalate_after must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
