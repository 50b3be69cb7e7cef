// Logical arm state shared by the controller and the motion workers.
//
// One mutex guards everything: commands, generation counters and (under
// on-completion updates) worker commits all go through it, so readers never
// see a half-applied command.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use super::servo::{Joint, JointId};
use crate::messages::ArmSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GripState {
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ArmState {
    joints: [Joint; 4],
    generations: [u64; 4],
    // Joints whose newest command was abandoned after repeated bus faults
    abandoned: [bool; 4],
    grip: GripState,
}

pub type SharedState = Arc<Mutex<ArmState>>;

impl ArmState {
    /// `joints` must be ordered by [`JointId::index`]
    pub fn new(joints: [Joint; 4]) -> Self {
        debug_assert!(
            joints
                .iter()
                .enumerate()
                .all(|(i, joint)| joint.id().index() == i)
        );
        Self {
            joints,
            generations: [0; 4],
            abandoned: [false; 4],
            // The arm powers up open; initialize() closes it
            grip: GripState::Open,
        }
    }

    pub fn joint(&self, id: JointId) -> &Joint {
        &self.joints[id.index()]
    }

    pub(crate) fn joint_mut(&mut self, id: JointId) -> &mut Joint {
        &mut self.joints[id.index()]
    }

    /// Generation of the newest accepted command for a joint (0 = none yet)
    pub fn generation(&self, id: JointId) -> u64 {
        self.generations[id.index()]
    }

    pub(crate) fn next_generation(&mut self, id: JointId) -> u64 {
        let generation = &mut self.generations[id.index()];
        *generation += 1;
        *generation
    }

    /// Whether the newest command for a joint was given up on
    pub fn is_abandoned(&self, id: JointId) -> bool {
        self.abandoned[id.index()]
    }

    pub(crate) fn mark_abandoned(&mut self, id: JointId) {
        self.abandoned[id.index()] = true;
    }

    pub(crate) fn clear_abandoned(&mut self, id: JointId) {
        self.abandoned[id.index()] = false;
    }

    pub fn grip(&self) -> GripState {
        self.grip
    }

    pub(crate) fn set_grip(&mut self, grip: GripState) {
        self.grip = grip;
    }

    pub fn snapshot(&self) -> ArmSnapshot {
        ArmSnapshot {
            grip: self.grip,
            elbow: self.joint(JointId::Elbow).angle(),
            shoulder: self.joint(JointId::Shoulder).angle(),
            base: self.joint(JointId::Base).angle(),
        }
    }
}

/// Lock the shared state, ignoring poisoning (every mutation is a plain store)
pub(crate) fn lock(state: &Mutex<ArmState>) -> MutexGuard<'_, ArmState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
