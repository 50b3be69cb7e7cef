// Keyboard teleop: A/D base, W/S shoulder, I/K elbow, O/C grip, R/F step, Q quit
//
// Publishes remote key/value commands; run the runtime alongside
// (cargo run -- --simulate works without hardware).
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind},
    terminal::{disable_raw_mode, enable_raw_mode},
};
use mearm_zenoh_runtime::config::{TOPIC_CMD_CONFIG, TOPIC_STATE_ARM};
use serde_json::json;
use std::time::Duration;
use tracing::info;

const STEPS: [i32; 3] = [2, 5, 15]; // degrees per key press

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;
    let publisher = session.declare_publisher(TOPIC_CMD_CONFIG).await?;

    // Echo the arm state published by the runtime
    let _state = session
        .declare_subscriber(TOPIC_STATE_ARM)
        .callback(|sample| {
            if let Ok(text) = sample.payload().try_to_string() {
                info!("State: {}", text);
            }
        })
        .await?;

    info!("Controls: A/D=base, W/S=shoulder, I/K=elbow, O/C=grip, R/F=step, Q=quit");
    info!("Step: {} deg", STEPS[0]);

    enable_raw_mode()?;
    let result = run_teleop(&publisher).await;
    disable_raw_mode()?;

    result
}

async fn run_teleop(
    publisher: &zenoh::pubsub::Publisher<'_>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut step_idx: usize = 0;

    loop {
        if !event::poll(Duration::from_millis(20))? {
            continue;
        }
        let Event::Key(KeyEvent { code, kind, .. }) = event::read()? else {
            continue;
        };
        if kind != KeyEventKind::Press && kind != KeyEventKind::Repeat {
            continue;
        }

        let step = STEPS[step_idx];
        let cmd = match code {
            KeyCode::Char('a') => json!({ "movebase": step.to_string() }),
            KeyCode::Char('d') => json!({ "movebase": (-step).to_string() }),
            KeyCode::Char('w') => json!({ "moveshoulder": step.to_string() }),
            KeyCode::Char('s') => json!({ "moveshoulder": (-step).to_string() }),
            KeyCode::Char('i') => json!({ "moveelbow": step.to_string() }),
            KeyCode::Char('k') => json!({ "moveelbow": (-step).to_string() }),
            KeyCode::Char('o') => json!({ "grip": "open" }),
            KeyCode::Char('c') => json!({ "grip": "close" }),

            KeyCode::Char('r') => {
                step_idx = (step_idx + 1).min(STEPS.len() - 1);
                info!("Step: {} deg", STEPS[step_idx]);
                continue;
            }
            KeyCode::Char('f') => {
                step_idx = step_idx.saturating_sub(1);
                info!("Step: {} deg", STEPS[step_idx]);
                continue;
            }

            KeyCode::Char('q') | KeyCode::Esc => break,
            _ => continue,
        };

        publisher.put(cmd.to_string()).await?;
    }

    Ok(())
}
