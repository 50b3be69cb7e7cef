// Four-joint servo arm on a PCA9685 PWM controller
//
// pwm        - register-level driver and the PwmOutput seam
// servo      - joints, limits and the angle to duty-cycle mapping
// state      - logical arm state shared by commands and workers
// motion     - eased trajectories and per-joint motion workers
// controller - command surface used by the runtime adapters

mod controller;
pub mod motion;
pub mod pwm;
pub mod servo;
pub mod state;

pub use controller::{ArmController, ArmError};
pub use motion::{MotionFault, MotionProfile, StateUpdate};
pub use pwm::{BusError, Channel, PwmOutput, SharedPwm};
pub use servo::{JointId, JointLimits};
pub use state::GripState;
