// Servo sweep: drives every joint through its full range once
//
// WARNING: the arm WILL move. Keep it clear of obstacles.
//
// Usage: cargo run --example servo_sweep -- [--simulate] [i2c-bus]

use std::time::Duration;

use mearm_zenoh_runtime::arm::pwm::{self, SharedPwm, SimulatedPwm};
use mearm_zenoh_runtime::arm::{ArmController, JointId};
use mearm_zenoh_runtime::config::{ArmConfig, DEFAULT_I2C_BUS};
use tracing::{info, warn};

fn open(simulate: bool, bus_path: &str, config: &ArmConfig) -> Result<SharedPwm, pwm::BusError> {
    if simulate {
        return Ok(pwm::share(SimulatedPwm::new()));
    }

    #[cfg(target_os = "linux")]
    {
        let mut device = pwm::LinuxPca9685::open(bus_path, config.address, config.frequency_hz)?;
        device.initialize()?;
        Ok(pwm::share(device))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = config;
        Err(pwm::BusError::Open {
            path: bus_path.to_string(),
            reason: "use --simulate off Linux".to_string(),
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("debug").init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let simulate = args.iter().any(|a| a == "--simulate");
    let bus_path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .cloned()
        .unwrap_or_else(|| DEFAULT_I2C_BUS.to_string());

    let config = ArmConfig::default();
    let settle = config.motion.duration() + Duration::from_millis(200);

    let device = open(simulate, &bus_path, &config)?;
    let (arm, mut faults) = ArmController::new(&config, device)?;
    tokio::spawn(async move {
        while let Some(fault) = faults.recv().await {
            warn!("Fault on {}: {}", fault.joint, fault.error);
        }
    });

    info!("Moving to neutral pose");
    arm.initialize()?;
    tokio::time::sleep(settle).await;

    for joint in [JointId::Base, JointId::Shoulder, JointId::Elbow] {
        let joint_config = config.joint(joint);
        for angle in [joint_config.min_angle, joint_config.max_angle, 90] {
            info!("{} -> {}", joint, angle);
            arm.set_joint(joint, angle)?;
            tokio::time::sleep(settle).await;
        }
    }

    info!("Grip open / close");
    arm.open_grip()?;
    tokio::time::sleep(settle).await;
    arm.close_grip()?;
    tokio::time::sleep(settle).await;

    info!("Final state: {:?}", arm.snapshot());
    arm.shutdown().await?;
    Ok(())
}
