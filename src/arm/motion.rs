// Eased joint motion
//
// Each joint gets one long-lived worker task that owns its PWM channel. The
// controller stamps every command with a per-joint generation; a worker drops
// its current trajectory as soon as it sees a newer generation and moves on
// to the newest queued command from wherever the servo currently is.

use std::f64::consts::PI;
use std::sync::PoisonError;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use super::pwm::{BusError, Channel, SharedPwm};
use super::servo::{AngleMapper, JointId, JointLimits};
use super::state::{self, SharedState};

/// Samples per motion (53 * 15ms ~ 0.8s regardless of distance)
pub const DEFAULT_STEPS: u32 = 53;
pub const DEFAULT_INTERVAL_MS: u64 = 15;

/// Trajectory timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MotionProfile {
    pub steps: u32,
    pub interval_ms: u64,
}

impl Default for MotionProfile {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            interval_ms: DEFAULT_INTERVAL_MS,
        }
    }
}

impl MotionProfile {
    pub const fn new(steps: u32, interval_ms: u64) -> Self {
        Self { steps, interval_ms }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Wall time of one full trajectory
    pub fn duration(&self) -> Duration {
        self.interval() * self.steps
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.steps == 0 {
            return Err("motion steps must be at least 1".to_string());
        }
        if self.interval_ms == 0 {
            return Err("motion interval must be at least 1ms".to_string());
        }
        Ok(())
    }
}

/// When the reported joint angle follows a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateUpdate {
    /// As soon as the command is accepted (reports the last commanded target)
    #[default]
    Optimistic,
    /// Once the worker has written the final sample
    OnCompletion,
}

/// Ease-in-out sine (Penner): value at time `t` of a move from `start` by
/// `change` over `duration`
pub fn ease_in_out_sine(t: f64, start: f64, change: f64, duration: f64) -> f64 {
    -change / 2.0 * ((PI * t / duration).cos() - 1.0) + start
}

/// Integer angles written for a move from `start` to `target`.
///
/// Samples `t = 0..steps` are rounded up. Descending moves stop just short
/// of the target because of the rounding, so the target is appended when the
/// last sample misses it. Empty when there is nothing to do.
pub fn trajectory(start: i32, target: i32, steps: u32) -> Vec<i32> {
    if start == target || steps == 0 {
        return Vec::new();
    }

    let change = f64::from(target) - f64::from(start);
    let mut path: Vec<i32> = (0..steps)
        .map(|t| {
            ease_in_out_sine(f64::from(t), f64::from(start), change, f64::from(steps)).ceil() as i32
        })
        .collect();

    if path.last() != Some(&target) {
        path.push(target);
    }
    path
}

/// One accepted command, queued to the joint's worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionCommand {
    pub joint: JointId,
    pub start: i32,
    pub target: i32,
    pub generation: u64,
}

/// A step whose channel write failed (after retries)
#[derive(Debug, Clone, PartialEq)]
pub struct MotionFault {
    pub joint: JointId,
    pub channel: Channel,
    pub generation: u64,
    pub step: usize,
    pub error: BusError,
    /// Too many consecutive failures: the trajectory was abandoned
    pub escalated: bool,
}

/// Worker knobs shared by every joint
#[derive(Debug, Clone, Copy)]
pub struct MotionSettings {
    pub profile: MotionProfile,
    pub state_update: StateUpdate,
    pub write_retries: u32,
    pub escalate_after: u32,
}

/// Sole writer of one joint's PWM channel
pub struct MotionWorker {
    joint: JointId,
    limits: JointLimits,
    mapper: AngleMapper,
    settings: MotionSettings,
    device: SharedPwm,
    state: SharedState,
    commands: UnboundedReceiver<MotionCommand>,
    faults: UnboundedSender<MotionFault>,
    // Last angle written to the servo; before the first write, the start of
    // the first command received
    position: Option<i32>,
}

impl MotionWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        joint: JointId,
        limits: JointLimits,
        mapper: AngleMapper,
        settings: MotionSettings,
        device: SharedPwm,
        state: SharedState,
        commands: UnboundedReceiver<MotionCommand>,
        faults: UnboundedSender<MotionFault>,
    ) -> Self {
        Self {
            joint,
            limits,
            mapper,
            settings,
            device,
            state,
            commands,
            faults,
            position: None,
        }
    }

    /// Process commands until every sender is gone
    pub async fn run(mut self) {
        debug!(
            "Motion worker for {} started on channel {}",
            self.joint, self.limits.channel
        );

        while let Some(first) = self.commands.recv().await {
            // A drained command's start is the target of the one it superseded
            self.position.get_or_insert(first.start);

            // Only the newest queued command matters
            let mut command = first;
            while let Ok(newer) = self.commands.try_recv() {
                command = newer;
            }
            self.execute(command).await;
        }

        debug!("Motion worker for {} stopped", self.joint);
    }

    async fn execute(&mut self, command: MotionCommand) {
        let start = self.position.unwrap_or(command.start);
        let path = trajectory(start, command.target, self.settings.profile.steps);
        debug!(
            "{}: moving {} -> {} in {} steps (gen {})",
            self.joint,
            start,
            command.target,
            path.len(),
            command.generation
        );

        let mut tick = interval(self.settings.profile.interval());
        // After a stall, resume the easing instead of bursting the missed steps
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut consecutive_failures = 0;

        for (step, angle) in path.into_iter().enumerate() {
            tick.tick().await;

            if self.is_superseded(command.generation) {
                debug!(
                    "{}: gen {} superseded at step {}",
                    self.joint, command.generation, step
                );
                return;
            }

            match self.write_angle(angle) {
                Ok(()) => {
                    self.position = Some(angle);
                    consecutive_failures = 0;
                }
                Err(e) => {
                    consecutive_failures += 1;
                    let escalated = consecutive_failures >= self.settings.escalate_after;
                    if escalated {
                        error!(
                            "{}: {} consecutive write failures, abandoning move to {}: {}",
                            self.joint, consecutive_failures, command.target, e
                        );
                    } else {
                        warn!("{}: write failed at step {}: {}", self.joint, step, e);
                    }

                    // Nobody listening is fine; the log above still has it
                    let _ = self.faults.send(MotionFault {
                        joint: self.joint,
                        channel: self.limits.channel,
                        generation: command.generation,
                        step,
                        error: e,
                        escalated,
                    });

                    if escalated {
                        self.abandon(&command);
                        return;
                    }
                }
            }
        }

        self.complete(&command);
    }

    fn is_superseded(&self, generation: u64) -> bool {
        state::lock(&self.state).generation(self.joint) != generation
    }

    /// Write one sample, retrying transient bus errors
    fn write_angle(&self, angle: i32) -> Result<(), BusError> {
        let tick = self.mapper.to_tick(self.limits.clamp(angle));
        let mut attempt = 0;
        loop {
            let result = self
                .device
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .set_channel(self.limits.channel, 0, tick);

            match result {
                Err(e) if e.is_transient() && attempt < self.settings.write_retries => {
                    attempt += 1;
                    debug!("{}: retrying write ({}): {}", self.joint, attempt, e);
                }
                other => return other,
            }
        }
    }

    /// Let the same command be issued again after giving up on it
    fn abandon(&self, command: &MotionCommand) {
        let mut state = state::lock(&self.state);
        if state.generation(self.joint) == command.generation {
            state.mark_abandoned(self.joint);
        }
    }

    fn complete(&self, command: &MotionCommand) {
        if self.settings.state_update == StateUpdate::OnCompletion {
            let mut state = state::lock(&self.state);
            if state.generation(self.joint) == command.generation {
                state.joint_mut(self.joint).set_angle(command.target);
            }
        }
        debug!(
            "{}: reached {} (gen {})",
            self.joint, command.target, command.generation
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trajectory_boundaries_ascending() {
        let path = trajectory(90, 120, DEFAULT_STEPS);
        assert_eq!(path.first(), Some(&90));
        assert_eq!(path.last(), Some(&120));
        assert_eq!(path.len(), DEFAULT_STEPS as usize);
        assert!(path.windows(2).all(|w| w[0] <= w[1]), "{:?}", path);
    }

    #[test]
    fn test_trajectory_boundaries_descending() {
        let path = trajectory(120, 15, DEFAULT_STEPS);
        assert_eq!(path.first(), Some(&120));
        assert_eq!(path.last(), Some(&15));
        assert!(path.windows(2).all(|w| w[0] >= w[1]), "{:?}", path);
    }

    #[test]
    fn test_trajectory_eases_in_and_out() {
        let path = trajectory(0, 180, DEFAULT_STEPS);
        let first_step = path[1] - path[0];
        let middle = path.len() / 2;
        let middle_step = path[middle + 1] - path[middle];
        // Slow at the ends, fast in the middle
        assert!(first_step < middle_step);
        assert!(path[path.len() - 1] - path[path.len() - 2] < middle_step);
    }

    #[test]
    fn test_trajectory_noop() {
        assert!(trajectory(45, 45, DEFAULT_STEPS).is_empty());
    }

    #[test]
    fn test_ease_in_out_sine_midpoint() {
        let mid = ease_in_out_sine(26.5, 0.0, 100.0, 53.0);
        assert!((mid - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_profile_duration() {
        let profile = MotionProfile::default();
        assert_eq!(profile.duration(), Duration::from_millis(795));
        assert!(MotionProfile::new(0, 15).validate().is_err());
        assert!(MotionProfile::new(10, 0).validate().is_err());
    }
}
