// Zenoh front end for the arm
//
// Two command sources feed one shared ArmController:
// - remote key/value messages on TOPIC_CMD_CONFIG (fire and forget)
// - local requests on the TOPIC_ARM_REQUEST queryable (reply with the new state)
// Bus faults from the motion workers drive the published health, with a hold
// time so a burst of failures is visible to subscribers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::interval;
use tracing::{error, info, warn};

use crate::arm::pwm::{self, BusError, SharedPwm, SimulatedPwm};
use crate::arm::{ArmController, MotionFault};
use crate::config::{
    ArmConfig, FAULT_HOLD, LOOP_HZ, STATE_HEARTBEAT, TOPIC_ARM_REQUEST, TOPIC_CMD_CONFIG,
    TOPIC_HEALTH, TOPIC_STATE_ARM,
};
use crate::messages::{parse_remote, parse_request, ArmSnapshot, RequestError, RequestReply, RuntimeHealth};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// How to reach the hardware
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub config: ArmConfig,
    pub i2c_bus: String,
    /// Use an in-memory PWM output instead of the I2C controller
    pub simulate: bool,
}

pub struct Runtime {
    arm: Arc<ArmController>,
    health: RuntimeHealth,
    last_fault_at: Option<Instant>,
    last_published: Option<ArmSnapshot>,
    published_at: Instant,
}

impl Runtime {
    pub fn new(arm: Arc<ArmController>) -> Self {
        Self {
            arm,
            health: RuntimeHealth::Ok,
            last_fault_at: None,
            last_published: None,
            published_at: Instant::now(),
        }
    }

    /// Apply a remote key/value payload; returns how many commands it held
    pub fn on_remote_command(&self, payload: &[u8]) -> usize {
        let fields = match serde_json::from_slice::<Map<String, Value>>(payload) {
            Ok(fields) => fields,
            Err(e) => {
                warn!("Failed to parse remote command: {}", e);
                return 0;
            }
        };

        let commands = parse_remote(&fields);
        info!("Received remote commands: {:?}", commands);
        for &command in &commands {
            if let Err(e) = self.arm.apply(command) {
                warn!("Remote command {:?} failed: {}", command, e);
            }
        }
        commands.len()
    }

    /// Validate and apply a local request, answering with the new state
    pub fn on_request(&self, payload: Option<&[u8]>) -> RequestReply {
        let command = match parse_request(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!("Rejected request: {}", e);
                return RequestReply::error(e);
            }
        };

        info!("Received request: {:?}", command);
        match self.arm.apply(command) {
            Ok(_) => RequestReply::ok(self.arm.snapshot()),
            Err(e) => RequestReply::error(RequestError::Arm(e.to_string())),
        }
    }

    pub fn on_fault(&mut self, fault: &MotionFault) {
        if fault.escalated {
            error!(
                "{} (channel {}) gave up on gen {}: {}",
                fault.joint, fault.channel, fault.generation, fault.error
            );
        }
        self.last_fault_at = Some(Instant::now());
    }

    /// Health based on how recently a bus fault was reported
    pub fn compute_health(&mut self) -> RuntimeHealth {
        let faulted = self
            .last_fault_at
            .is_some_and(|at| at.elapsed() < FAULT_HOLD);

        let health = if faulted {
            RuntimeHealth::BusFault
        } else {
            RuntimeHealth::Ok
        };
        if health != self.health {
            match health {
                RuntimeHealth::BusFault => warn!("PWM bus faults reported, health degraded"),
                RuntimeHealth::Ok => info!("No bus faults for {:?}, health ok", FAULT_HOLD),
            }
        }
        self.health = health;
        health
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Snapshot to publish now: on change, or when the heartbeat is due
    fn state_to_publish(&mut self) -> Option<ArmSnapshot> {
        let snapshot = self.arm.snapshot();
        let changed = self.last_published != Some(snapshot);
        if changed || self.published_at.elapsed() >= STATE_HEARTBEAT {
            self.last_published = Some(snapshot);
            self.published_at = Instant::now();
            Some(snapshot)
        } else {
            None
        }
    }
}

/// Open and bring up the PWM device (fatal on failure)
fn open_device(options: &RuntimeOptions) -> Result<SharedPwm, BusError> {
    if options.simulate {
        warn!("Using simulated PWM output, no hardware will move");
        return Ok(pwm::share(SimulatedPwm::new()));
    }

    #[cfg(target_os = "linux")]
    {
        let mut device = pwm::LinuxPca9685::open(
            &options.i2c_bus,
            options.config.address,
            options.config.frequency_hz,
        )?;
        device.initialize()?;
        Ok(pwm::share(device))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(BusError::Open {
            path: options.i2c_bus.clone(),
            reason: "i2c-dev is only available on Linux, use --simulate".to_string(),
        })
    }
}

pub async fn run(options: RuntimeOptions) -> Result<(), Error> {
    let device = open_device(&options)?;
    let (arm, faults) = ArmController::new(&options.config, device)?;
    let arm = Arc::new(arm);
    arm.initialize()?;

    let outcome = serve(Runtime::new(arm.clone()), faults).await;

    arm.shutdown().await?;
    outcome
}

async fn serve(mut runtime: Runtime, mut faults: UnboundedReceiver<MotionFault>) -> Result<(), Error> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD_CONFIG).await?;
    let queryable = session.declare_queryable(TOPIC_ARM_REQUEST).await?;
    let pub_state = session.declare_publisher(TOPIC_STATE_ARM).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));

    info!("Runtime started: {}Hz publish loop", LOOP_HZ);
    info!("Subscribed to: {}", TOPIC_CMD_CONFIG);
    info!("Answering requests on: {}", TOPIC_ARM_REQUEST);
    info!("Publishing to: {}, {}", TOPIC_STATE_ARM, TOPIC_HEALTH);

    loop {
        tokio::select! {
            sample = subscriber.recv_async() => {
                let sample = sample?;
                runtime.on_remote_command(&sample.payload().to_bytes());
            }

            query = queryable.recv_async() => {
                let query = query?;
                let payload = query.payload().map(|p| p.to_bytes());
                let reply = runtime.on_request(payload.as_deref());
                query
                    .reply(query.key_expr().clone(), serde_json::to_string(&reply)?)
                    .await?;
            }

            Some(fault) = faults.recv() => {
                runtime.on_fault(&fault);
            }

            _ = tick.tick() => {
                if let Some(snapshot) = runtime.state_to_publish() {
                    pub_state.put(serde_json::to_string(&snapshot)?).await?;
                }
                let health = runtime.compute_health();
                pub_health.put(serde_json::to_string(&health)?).await?;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, stopping");
                return Ok(());
            }
        }
    }
}
