// PWM diagnostic: READ-ONLY check of the PCA9685 connection
//
// Reads MODE1, MODE2, PRESCALE and the channel registers of every joint.
// Nothing is written, so the servos do not move.
//
// Usage: cargo run --example pwm_diagnostic -- [i2c-bus] [address]
// Example: cargo run --example pwm_diagnostic -- /dev/i2c-1 0x40

#[cfg(target_os = "linux")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use mearm_zenoh_runtime::arm::JointId;
    use mearm_zenoh_runtime::arm::pwm::{
        self, Channel, LinuxPca9685, MODE1_ALLCALL, MODE1_RESTART, MODE1_SLEEP, MODE2_OUTDRV,
        Register,
    };
    use mearm_zenoh_runtime::config::{ArmConfig, DEFAULT_I2C_BUS};

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let bus_path = args.next().unwrap_or_else(|| DEFAULT_I2C_BUS.to_string());
    let address = match args.next() {
        Some(text) => u8::from_str_radix(text.trim_start_matches("0x"), 16)?,
        None => pwm::DEFAULT_ADDRESS,
    };

    println!("PWM Diagnostic (READ-ONLY)");
    println!("I2C bus: {}  address: 0x{:02X}", bus_path, address);
    println!();

    println!("Step 1: Opening I2C bus...");
    let mut device = match LinuxPca9685::open(&bus_path, address, pwm::DEFAULT_FREQUENCY_HZ) {
        Ok(device) => {
            println!("  OK");
            device
        }
        Err(e) => {
            println!("  FAILED: {}", e);
            println!();
            println!("Troubleshooting:");
            println!("  - Enable I2C (raspi-config > Interface Options)");
            println!("  - Check the user is in the i2c group");
            return Err(e.into());
        }
    };
    println!();

    println!("Step 2: Reading mode registers...");
    let mode1 = device.read_register(Register::Mode1)?;
    let mode2 = device.read_register(Register::Mode2)?;
    let prescale = device.read_register(Register::Prescale)?;

    let flag = |set: bool| if set { "set" } else { "clear" };
    println!("  MODE1    0x{:02X}", mode1);
    println!("    RESTART  {}", flag(mode1 & MODE1_RESTART != 0));
    println!("    SLEEP    {}", flag(mode1 & MODE1_SLEEP != 0));
    println!("    ALLCALL  {}", flag(mode1 & MODE1_ALLCALL != 0));
    println!("  MODE2    0x{:02X} (OUTDRV {})", mode2, flag(mode2 & MODE2_OUTDRV != 0));
    let hz = 25_000_000.0 / (4096.0 * (f32::from(prescale) + 1.0));
    println!("  PRESCALE {} (~{:.1}Hz)", prescale, hz);
    println!();

    println!("Step 3: Reading joint channels...");
    let config = ArmConfig::default();
    let mapper = config.mapper()?;
    for joint in JointId::ALL {
        let channel = Channel::new(config.joint(joint).channel)?;
        let low = device.read_register(Register::ChannelOffLow(channel))?;
        let high = device.read_register(Register::ChannelOffHigh(channel))?;
        let off = (u16::from(high & 0x0F) << 8) | u16::from(low);
        println!(
            "  {:<8} channel {:>2}: OFF tick {:>4} (mapped range {}..{})",
            joint,
            channel,
            off,
            mapper.to_tick(config.joint(joint).min_angle),
            mapper.to_tick(config.joint(joint).max_angle)
        );
    }
    println!();

    if mode1 & MODE1_SLEEP != 0 {
        println!("Oscillator is asleep: the runtime has not initialized the controller yet.");
    } else {
        println!("Controller is awake and generating pulses.");
    }
    println!("Next step: cargo run --example servo_sweep -- --simulate (or without it, arm clear of obstacles)");

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("pwm_diagnostic needs Linux i2c-dev");
    std::process::exit(1);
}
