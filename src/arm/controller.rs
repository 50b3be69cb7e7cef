// Arm command surface
//
// Commands are cheap and non-blocking: they clamp, update the logical state,
// stamp a generation and enqueue to the joint's motion worker, all under the
// state lock. Any number of callers (local requests, remote messages) can
// share one controller through an Arc.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::motion::{MotionCommand, MotionFault, MotionSettings, MotionWorker, StateUpdate};
use super::pwm::{BusError, SharedPwm};
use super::servo::{Joint, JointId};
use super::state::{self, ArmState, GripState, SharedState};
use crate::config::{ArmConfig, ConfigError, NeutralPose};
use crate::messages::{ArmCommand, ArmSnapshot};

/// Error types for arm commands
#[derive(Debug, thiserror::Error)]
pub enum ArmError {
    #[error("PWM bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Motion worker for {0} has stopped")]
    WorkerStopped(JointId),
}

pub type Result<T> = std::result::Result<T, ArmError>;

/// High-level controller for the four-joint arm
pub struct ArmController {
    state: SharedState,
    device: SharedPwm,
    queues: [UnboundedSender<MotionCommand>; 4],
    workers: Mutex<Vec<JoinHandle<()>>>,
    neutral: NeutralPose,
    grip_open_angle: i32,
    grip_closed_angle: i32,
    state_update: StateUpdate,
}

impl ArmController {
    /// Validate the configuration and spawn one motion worker per joint.
    ///
    /// Must be called inside a tokio runtime. Bus faults from the workers
    /// arrive on the returned receiver.
    pub fn new(
        config: &ArmConfig,
        device: SharedPwm,
    ) -> Result<(Self, UnboundedReceiver<MotionFault>)> {
        config.validate()?;
        let mapper = config.mapper()?;

        let joint = |id: JointId| -> Result<Joint> { Ok(Joint::new(id, config.joint_limits(id)?)) };
        let state: SharedState = Arc::new(Mutex::new(ArmState::new([
            joint(JointId::Grip)?,
            joint(JointId::Base)?,
            joint(JointId::Elbow)?,
            joint(JointId::Shoulder)?,
        ])));

        let settings = MotionSettings {
            profile: config.motion,
            state_update: config.state_update,
            write_retries: config.write_retries,
            escalate_after: config.escalate_after,
        };

        let (fault_tx, fault_rx) = mpsc::unbounded_channel();
        let mut workers = Vec::with_capacity(JointId::ALL.len());
        let queues = JointId::ALL.map(|id| {
            let (tx, rx) = mpsc::unbounded_channel();
            let limits = *state::lock(&state).joint(id).limits();
            let worker = MotionWorker::new(
                id,
                limits,
                mapper,
                settings,
                device.clone(),
                state.clone(),
                rx,
                fault_tx.clone(),
            );
            workers.push(tokio::spawn(worker.run()));
            tx
        });

        info!(
            "Arm controller ready ({} steps x {}ms per move, {:?} state updates)",
            config.motion.steps, config.motion.interval_ms, config.state_update
        );

        let controller = Self {
            state,
            device,
            queues,
            workers: Mutex::new(workers),
            neutral: config.neutral,
            grip_open_angle: config.grip_open_angle,
            grip_closed_angle: config.grip_closed_angle,
            state_update: config.state_update,
        };
        Ok((controller, fault_rx))
    }

    /// Drive base/shoulder/elbow to the neutral pose and close the grip
    pub fn initialize(&self) -> Result<()> {
        info!(
            "Moving arm to neutral pose (base={}, shoulder={}, elbow={})",
            self.neutral.base, self.neutral.shoulder, self.neutral.elbow
        );
        self.set_arm(self.neutral.base, self.neutral.shoulder, self.neutral.elbow)?;
        self.close_grip()?;
        Ok(())
    }

    /// Move a joint to an absolute angle (clamped to its limits).
    ///
    /// Returns whether a motion was started; commanding the current target
    /// is a no-op.
    pub fn set_joint(&self, joint: JointId, angle: i32) -> Result<bool> {
        let mut state = state::lock(&self.state);
        let target = state.joint(joint).limits().clamp(angle);
        self.command(&mut state, joint, None, target)
    }

    /// Move a joint relative to its last commanded angle
    pub fn move_joint(&self, joint: JointId, delta: i32) -> Result<bool> {
        let mut state = state::lock(&self.state);
        let current = state.joint(joint).target();
        let target = state
            .joint(joint)
            .limits()
            .clamp(current.saturating_add(delta));
        self.command(&mut state, joint, None, target)
    }

    /// Move base, shoulder and elbow together; each joint travels on its own
    pub fn set_arm(&self, base: i32, shoulder: i32, elbow: i32) -> Result<()> {
        self.set_joint(JointId::Base, base)?;
        self.set_joint(JointId::Shoulder, shoulder)?;
        self.set_joint(JointId::Elbow, elbow)?;
        Ok(())
    }

    pub fn open_grip(&self) -> Result<bool> {
        self.drive_grip(GripState::Open)
    }

    pub fn close_grip(&self) -> Result<bool> {
        self.drive_grip(GripState::Closed)
    }

    pub fn set_base(&self, angle: i32) -> Result<bool> {
        self.set_joint(JointId::Base, angle)
    }

    pub fn move_base(&self, delta: i32) -> Result<bool> {
        self.move_joint(JointId::Base, delta)
    }

    pub fn set_shoulder(&self, angle: i32) -> Result<bool> {
        self.set_joint(JointId::Shoulder, angle)
    }

    pub fn move_shoulder(&self, delta: i32) -> Result<bool> {
        self.move_joint(JointId::Shoulder, delta)
    }

    pub fn set_elbow(&self, angle: i32) -> Result<bool> {
        self.set_joint(JointId::Elbow, angle)
    }

    pub fn move_elbow(&self, delta: i32) -> Result<bool> {
        self.move_joint(JointId::Elbow, delta)
    }

    /// Dispatch a parsed adapter command
    pub fn apply(&self, command: ArmCommand) -> Result<bool> {
        match command {
            ArmCommand::SetJoint(joint, angle) => self.set_joint(joint, angle),
            ArmCommand::MoveJoint(joint, delta) => self.move_joint(joint, delta),
            ArmCommand::OpenGrip => self.open_grip(),
            ArmCommand::CloseGrip => self.close_grip(),
        }
    }

    /// Current logical state
    pub fn snapshot(&self) -> ArmSnapshot {
        state::lock(&self.state).snapshot()
    }

    /// Generation of the newest accepted command for a joint
    pub fn generation(&self, joint: JointId) -> u64 {
        state::lock(&self.state).generation(joint)
    }

    /// Stop the motion workers and switch every output off
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down arm controller");
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            worker.abort();
            if let Err(e) = worker.await {
                if !e.is_cancelled() {
                    warn!("Motion worker ended abnormally: {}", e);
                }
            }
        }

        self.device
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .set_all_channels(0, 0)?;
        info!("All PWM outputs off");
        Ok(())
    }

    fn drive_grip(&self, wanted: GripState) -> Result<bool> {
        let mut state = state::lock(&self.state);
        if state.grip() == wanted && !state.is_abandoned(JointId::Grip) {
            debug!("Grip already {:?}", wanted);
            return Ok(false);
        }

        let (start, target) = match wanted {
            GripState::Closed => (self.grip_open_angle, self.grip_closed_angle),
            GripState::Open => (self.grip_closed_angle, self.grip_open_angle),
        };
        state.set_grip(wanted);
        self.command(&mut state, JointId::Grip, Some(start), target)
    }

    /// Record a new target and hand it to the joint's worker.
    ///
    /// `start` overrides the logical start angle (the grip always travels
    /// between its two endpoints).
    fn command(
        &self,
        state: &mut ArmState,
        joint: JointId,
        start: Option<i32>,
        target: i32,
    ) -> Result<bool> {
        let current = state.joint(joint).target();
        let start = start.unwrap_or(current);
        let retry = state.is_abandoned(joint);
        if start == target && current == target && !retry {
            debug!("{} already at {}", joint, target);
            return Ok(false);
        }

        state.clear_abandoned(joint);
        let entry = state.joint_mut(joint);
        entry.set_target(target);
        if self.state_update == StateUpdate::Optimistic {
            entry.set_angle(target);
        }
        let generation = state.next_generation(joint);

        debug!("{}: {} -> {} (gen {})", joint, start, target, generation);
        self.queues[joint.index()]
            .send(MotionCommand {
                joint,
                start,
                target,
                generation,
            })
            .map_err(|_| ArmError::WorkerStopped(joint))?;
        Ok(true)
    }
}
