use std::path::PathBuf;

use clap::Parser;
use mearm_zenoh_runtime::arm::StateUpdate;
use mearm_zenoh_runtime::config::{ArmConfig, DEFAULT_I2C_BUS};
use mearm_zenoh_runtime::runtime::{self, RuntimeOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mearm-zenoh-runtime", about = "Servo arm runtime over Zenoh")]
struct Args {
    /// I2C bus device of the PWM controller
    #[arg(long, default_value = DEFAULT_I2C_BUS)]
    i2c_bus: String,

    /// PWM controller address, e.g. 0x40
    #[arg(long, value_parser = parse_address)]
    address: Option<u8>,

    /// PWM frequency in Hz
    #[arg(long)]
    frequency: Option<f32>,

    /// JSON file overriding joint limits and motion settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run without hardware
    #[arg(long)]
    simulate: bool,

    /// Report joint angles only once a motion has finished
    #[arg(long)]
    on_completion: bool,
}

fn parse_address(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", text, e))
}

impl Args {
    fn into_options(self) -> Result<RuntimeOptions, mearm_zenoh_runtime::config::ConfigError> {
        let mut config = match &self.config {
            Some(path) => ArmConfig::load(path)?,
            None => ArmConfig::default(),
        };
        if let Some(address) = self.address {
            config.address = address;
        }
        if let Some(hz) = self.frequency {
            config.frequency_hz = hz;
        }
        if self.on_completion {
            config.state_update = StateUpdate::OnCompletion;
        }
        config.validate()?;

        Ok(RuntimeOptions {
            config,
            i2c_bus: self.i2c_bus,
            simulate: self.simulate,
        })
    }
}

#[tokio::main]
async fn main() {
    // Setup logging (set RUST_LOG=info or debug)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = match Args::parse().into_options() {
        Ok(options) => options,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(2);
        }
    };
    info!(
        "PWM controller 0x{:02x} on {} at {}Hz",
        options.config.address, options.i2c_bus, options.config.frequency_hz
    );

    if let Err(e) = runtime::run(options).await {
        eprintln!("Runtime error: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x40"), Ok(0x40));
        assert_eq!(parse_address("0X41"), Ok(0x41));
        assert_eq!(parse_address("64"), Ok(64));
        assert!(parse_address("0x400").is_err());
        assert!(parse_address("pca").is_err());
    }

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from(["mearm", "--address", "0x41", "--simulate", "--on-completion"]);
        let options = args.into_options().unwrap();
        assert_eq!(options.config.address, 0x41);
        assert_eq!(options.config.state_update, StateUpdate::OnCompletion);
        assert!(options.simulate);
        assert_eq!(options.i2c_bus, DEFAULT_I2C_BUS);
    }
}
