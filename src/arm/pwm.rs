// PCA9685 16-channel PWM controller over I2C
//
// Register layout (datasheet, section 7.3):
// MODE1=0x00, MODE2=0x01, LEDn_ON_L = 0x06 + 4*n (ON_L, ON_H, OFF_L, OFF_H),
// ALL_LED_ON_L..ALL_LED_OFF_H = 0xFA..0xFD, PRE_SCALE=0xFE

use std::fmt;
use std::sync::{Arc, Mutex};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use tracing::{debug, info, warn};

/// Default 7-bit I2C address of the controller
pub const DEFAULT_ADDRESS: u8 = 0x40;

/// Default PWM frequency (20ms period, standard analog servo rate)
pub const DEFAULT_FREQUENCY_HZ: f32 = 50.0;

/// Internal oscillator frequency
const OSCILLATOR_HZ: f32 = 25_000_000.0;

/// 12-bit counter: 4096 ticks per PWM period
const TICKS_PER_PERIOD: f32 = 4096.0;

/// Highest duty-cycle tick inside one period
pub const MAX_TICK: u16 = 4095;

/// Bit 12 of the ON/OFF registers forces the output fully on/off
const FULL_ON_OFF: u16 = 0x1000;

/// Prescale register limits (datasheet: values below 3 are clamped by hardware)
const PRESCALE_MIN: f32 = 3.0;
const PRESCALE_MAX: f32 = 255.0;

/// Oscillator settling time after leaving sleep (datasheet asks for 500us)
const SETTLE_MS: u32 = 5;

/// First per-channel register (LED0_ON_L)
const LED0_ON_L: u8 = 0x06;

/// MODE1 / MODE2 bits
pub const MODE1_RESTART: u8 = 0x80;
pub const MODE1_SLEEP: u8 = 0x10;
pub const MODE1_ALLCALL: u8 = 0x01;
pub const MODE2_OUTDRV: u8 = 0x04;

/// Error types for PWM bus communication
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("I2C transaction on register 0x{register:02X} failed: {kind:?}")]
    Transaction { register: u8, kind: ErrorKind },

    #[error("PWM channel {0} out of range (0-15)")]
    InvalidChannel(u8),

    #[error("Frequency {hz}Hz needs a prescale outside 3..=255")]
    InvalidFrequency { hz: f32 },

    #[error("Failed to open I2C bus {path}: {reason}")]
    Open { path: String, reason: String },
}

impl BusError {
    /// Whether retrying the same write can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Transaction { .. })
    }
}

pub type Result<T> = std::result::Result<T, BusError>;

/// One of the 16 PWM outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub const COUNT: u8 = 16;

    pub fn new(index: u8) -> Result<Self> {
        if index < Self::COUNT {
            Ok(Self(index))
        } else {
            Err(BusError::InvalidChannel(index))
        }
    }

    pub const fn index(self) -> u8 {
        self.0
    }

    /// Address of this channel's ON_L register; the other three follow it
    const fn base_register(self) -> u8 {
        LED0_ON_L + 4 * self.0
    }
}

impl TryFrom<u8> for Channel {
    type Error = BusError;

    fn try_from(index: u8) -> Result<Self> {
        Self::new(index)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Register map
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Register {
    Mode1,
    Mode2,
    Prescale,
    ChannelOnLow(Channel),
    ChannelOnHigh(Channel),
    ChannelOffLow(Channel),
    ChannelOffHigh(Channel),
    AllOnLow,
    AllOnHigh,
    AllOffLow,
    AllOffHigh,
}

impl Register {
    pub const fn address(self) -> u8 {
        match self {
            Register::Mode1 => 0x00,
            Register::Mode2 => 0x01,
            Register::Prescale => 0xFE,
            Register::ChannelOnLow(ch) => ch.base_register(),
            Register::ChannelOnHigh(ch) => ch.base_register() + 1,
            Register::ChannelOffLow(ch) => ch.base_register() + 2,
            Register::ChannelOffHigh(ch) => ch.base_register() + 3,
            Register::AllOnLow => 0xFA,
            Register::AllOnHigh => 0xFB,
            Register::AllOffLow => 0xFC,
            Register::AllOffHigh => 0xFD,
        }
    }

    /// ON_L, ON_H, OFF_L, OFF_H for one channel
    const fn channel_block(channel: Channel) -> [Register; 4] {
        [
            Register::ChannelOnLow(channel),
            Register::ChannelOnHigh(channel),
            Register::ChannelOffLow(channel),
            Register::ChannelOffHigh(channel),
        ]
    }

    const BROADCAST_BLOCK: [Register; 4] = [
        Register::AllOnLow,
        Register::AllOnHigh,
        Register::AllOffLow,
        Register::AllOffHigh,
    ];
}

/// Prescale divisor for a target output frequency
pub fn prescale_for(hz: f32) -> Result<u8> {
    if !hz.is_finite() || hz <= 0.0 {
        return Err(BusError::InvalidFrequency { hz });
    }
    let prescale = (OSCILLATOR_HZ / (TICKS_PER_PERIOD * hz) - 1.0).round();
    if !(PRESCALE_MIN..=PRESCALE_MAX).contains(&prescale) {
        return Err(BusError::InvalidFrequency { hz });
    }
    Ok(prescale as u8)
}

/// Channel-level output used by the motion workers.
///
/// Implemented by the real controller and by [`SimulatedPwm`].
pub trait PwmOutput: Send {
    /// Program one channel's ON/OFF tick
    fn set_channel(&mut self, channel: Channel, on: u16, off: u16) -> Result<()>;

    /// Program every channel at once through the broadcast registers
    fn set_all_channels(&mut self, on: u16, off: u16) -> Result<()>;
}

/// PWM output shared by the controller and its motion workers
pub type SharedPwm = Arc<Mutex<dyn PwmOutput>>;

/// Wrap an output so it can be handed to an [`ArmController`](super::ArmController)
pub fn share<P: PwmOutput + 'static>(output: P) -> SharedPwm {
    Arc::new(Mutex::new(output))
}

/// PCA9685 driver
pub struct Pca9685<I2C: I2c, D: DelayNs> {
    i2c: I2C,
    delay: D,
    address: u8,
    frequency_hz: f32,
    // Set once any output has been programmed
    driving: bool,
}

impl<I2C: I2c, D: DelayNs> Pca9685<I2C, D> {
    pub fn new(i2c: I2C, delay: D, address: u8, frequency_hz: f32) -> Self {
        Self {
            i2c,
            delay,
            address,
            frequency_hz,
            driving: false,
        }
    }

    /// Bring the controller out of reset and start the oscillator.
    ///
    /// All outputs are zeroed first so servos do not twitch on power-up.
    /// Any failure here leaves the device unusable.
    pub fn initialize(&mut self) -> Result<()> {
        info!(
            "Initializing PWM controller at 0x{:02X} ({}Hz)",
            self.address, self.frequency_hz
        );

        self.set_all_channels(0, 0)?;
        self.write_register(Register::Mode2, MODE2_OUTDRV)?;
        self.write_register(Register::Mode1, MODE1_ALLCALL)?;
        self.delay.delay_ms(SETTLE_MS);

        // Wake up
        let mode1 = self.read_register(Register::Mode1)?;
        self.write_register(Register::Mode1, mode1 & !MODE1_SLEEP)?;
        self.delay.delay_ms(SETTLE_MS);

        self.set_frequency(self.frequency_hz)?;
        info!("PWM controller initialized");
        Ok(())
    }

    /// Change the output frequency.
    ///
    /// The prescaler can only be written while the oscillator sleeps, so the
    /// sequence is: sleep, write prescale, restore mode, settle, restart.
    pub fn set_frequency(&mut self, hz: f32) -> Result<()> {
        let prescale = prescale_for(hz)?;
        debug!("Setting PWM frequency {}Hz (prescale {})", hz, prescale);

        let old_mode = self.read_register(Register::Mode1)?;
        let sleep_mode = (old_mode & !MODE1_RESTART) | MODE1_SLEEP;
        self.write_register(Register::Mode1, sleep_mode)?;
        self.write_register(Register::Prescale, prescale)?;
        self.write_register(Register::Mode1, old_mode)?;
        self.delay.delay_ms(SETTLE_MS);
        self.write_register(Register::Mode1, old_mode | MODE1_RESTART)?;

        self.frequency_hz = hz;
        Ok(())
    }

    pub fn frequency_hz(&self) -> f32 {
        self.frequency_hz
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    /// Program one channel (servos only use the OFF tick, `on` stays 0)
    pub fn set_channel(&mut self, channel: Channel, on: u16, off: u16) -> Result<()> {
        self.driving = true;
        self.write_block(Register::channel_block(channel), on, off)
    }

    /// Program all channels through the ALL_LED registers
    pub fn set_all_channels(&mut self, on: u16, off: u16) -> Result<()> {
        self.driving = true;
        self.write_block(Register::BROADCAST_BLOCK, on, off)
    }

    /// Read a single register
    pub fn read_register(&mut self, register: Register) -> Result<u8> {
        let mut value = [0u8; 1];
        self.i2c
            .write_read(self.address, &[register.address()], &mut value)
            .map_err(|e| BusError::Transaction {
                register: register.address(),
                kind: e.kind(),
            })?;
        Ok(value[0])
    }

    fn write_register(&mut self, register: Register, value: u8) -> Result<()> {
        self.i2c
            .write(self.address, &[register.address(), value])
            .map_err(|e| BusError::Transaction {
                register: register.address(),
                kind: e.kind(),
            })
    }

    fn write_block(&mut self, block: [Register; 4], on: u16, off: u16) -> Result<()> {
        let on = on.min(FULL_ON_OFF);
        let off = off.min(FULL_ON_OFF);
        let [on_low, on_high, off_low, off_high] = block;

        self.write_register(on_low, (on & 0xFF) as u8)?;
        self.write_register(on_high, (on >> 8) as u8)?;
        self.write_register(off_low, (off & 0xFF) as u8)?;
        self.write_register(off_high, (off >> 8) as u8)
    }
}

impl<I2C, D> PwmOutput for Pca9685<I2C, D>
where
    I2C: I2c + Send,
    D: DelayNs + Send,
{
    fn set_channel(&mut self, channel: Channel, on: u16, off: u16) -> Result<()> {
        Pca9685::set_channel(self, channel, on, off)
    }

    fn set_all_channels(&mut self, on: u16, off: u16) -> Result<()> {
        Pca9685::set_all_channels(self, on, off)
    }
}

impl<I2C: I2c, D: DelayNs> Drop for Pca9685<I2C, D> {
    fn drop(&mut self) {
        // Leave the servos unpowered rather than holding the last pulse.
        // A handle that only read registers leaves the device alone.
        if !self.driving {
            return;
        }
        if let Err(e) = self.set_all_channels(0, 0) {
            warn!("Failed to zero PWM outputs on drop: {}", e);
        }
    }
}

/// Controller on a Linux i2c-dev bus
#[cfg(target_os = "linux")]
pub type LinuxPca9685 = Pca9685<linux_embedded_hal::I2cdev, linux_embedded_hal::Delay>;

#[cfg(target_os = "linux")]
impl Pca9685<linux_embedded_hal::I2cdev, linux_embedded_hal::Delay> {
    /// Open the controller on an i2c-dev path such as `/dev/i2c-1`
    pub fn open(path: &str, address: u8, frequency_hz: f32) -> Result<Self> {
        info!("Opening I2C bus {}", path);
        let i2c = linux_embedded_hal::I2cdev::new(path).map_err(|e| BusError::Open {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self::new(i2c, linux_embedded_hal::Delay, address, frequency_hz))
    }
}

/// Stand-in output for running without hardware: remembers the last OFF
/// tick of each channel.
#[derive(Debug, Default)]
pub struct SimulatedPwm {
    duty: [u16; Channel::COUNT as usize],
}

impl SimulatedPwm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn duty(&self, channel: Channel) -> u16 {
        self.duty[channel.index() as usize]
    }
}

impl PwmOutput for SimulatedPwm {
    fn set_channel(&mut self, channel: Channel, _on: u16, off: u16) -> Result<()> {
        debug!("[sim] channel {} off={}", channel, off);
        self.duty[channel.index() as usize] = off;
        Ok(())
    }

    fn set_all_channels(&mut self, _on: u16, off: u16) -> Result<()> {
        debug!("[sim] all channels off={}", off);
        self.duty = [off; Channel::COUNT as usize];
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorType, Operation};

    #[derive(Debug)]
    pub struct FakeError(ErrorKind);

    impl embedded_hal::i2c::Error for FakeError {
        fn kind(&self) -> ErrorKind {
            self.0
        }
    }

    /// Register file behind a fake I2C bus; logs every (register, value) write
    pub struct FakeBus {
        registers: [u8; 256],
        pub writes: Arc<Mutex<Vec<(u8, u8)>>>,
        pub fail_on: Option<u8>,
    }

    impl FakeBus {
        pub fn new() -> Self {
            let mut registers = [0u8; 256];
            // Power-on MODE1: SLEEP | ALLCALL
            registers[0] = MODE1_SLEEP | MODE1_ALLCALL;
            Self {
                registers,
                writes: Arc::new(Mutex::new(Vec::new())),
                fail_on: None,
            }
        }
    }

    impl ErrorType for FakeBus {
        type Error = FakeError;
    }

    impl I2c for FakeBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> std::result::Result<(), Self::Error> {
            assert_eq!(address, DEFAULT_ADDRESS);
            let mut pointer = 0usize;
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        pointer = bytes[0] as usize;
                        if self.fail_on == Some(bytes[0]) {
                            return Err(FakeError(ErrorKind::Bus));
                        }
                        if let Some(&value) = bytes.get(1) {
                            self.registers[pointer] = value;
                            self.writes.lock().unwrap().push((bytes[0], value));
                        }
                    }
                    Operation::Read(buffer) => {
                        for (offset, byte) in buffer.iter_mut().enumerate() {
                            *byte = self.registers[pointer + offset];
                        }
                    }
                }
            }
            Ok(())
        }
    }

    pub struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn driver() -> (Pca9685<FakeBus, NoDelay>, Arc<Mutex<Vec<(u8, u8)>>>) {
        let bus = FakeBus::new();
        let writes = bus.writes.clone();
        (
            Pca9685::new(bus, NoDelay, DEFAULT_ADDRESS, DEFAULT_FREQUENCY_HZ),
            writes,
        )
    }

    #[test]
    fn test_prescale_for_50hz() {
        assert_eq!(prescale_for(50.0).unwrap(), 121);
    }

    #[test]
    fn test_prescale_rejects_out_of_range() {
        assert!(prescale_for(0.0).is_err());
        assert!(prescale_for(-50.0).is_err());
        // 25MHz / (4096 * 10Hz) - 1 = 609, too large for the register
        assert!(prescale_for(10.0).is_err());
        // Above ~1526Hz the prescale drops below 3
        assert!(prescale_for(2000.0).is_err());
        assert!(prescale_for(1500.0).is_ok());
    }

    #[test]
    fn test_register_addresses() {
        let ch0 = Channel::new(0).unwrap();
        let ch15 = Channel::new(15).unwrap();
        assert_eq!(Register::Mode1.address(), 0x00);
        assert_eq!(Register::Mode2.address(), 0x01);
        assert_eq!(Register::Prescale.address(), 0xFE);
        assert_eq!(Register::ChannelOnLow(ch0).address(), 0x06);
        assert_eq!(Register::ChannelOffHigh(ch0).address(), 0x09);
        assert_eq!(Register::ChannelOnLow(ch15).address(), 0x42);
        assert_eq!(Register::ChannelOffHigh(ch15).address(), 0x45);
        assert_eq!(Register::AllOnLow.address(), 0xFA);
        assert_eq!(Register::AllOffHigh.address(), 0xFD);
    }

    #[test]
    fn test_channel_bounds() {
        assert!(Channel::new(15).is_ok());
        assert_eq!(Channel::new(16), Err(BusError::InvalidChannel(16)));
    }

    #[test]
    fn test_initialize_sequence() {
        let (mut pwm, writes) = driver();
        pwm.initialize().unwrap();

        let expected = vec![
            // zero all outputs
            (0xFA, 0),
            (0xFB, 0),
            (0xFC, 0),
            (0xFD, 0),
            (0x01, MODE2_OUTDRV),
            (0x00, MODE1_ALLCALL),
            // clear sleep
            (0x00, MODE1_ALLCALL),
            // set_frequency(50)
            (0x00, MODE1_ALLCALL | MODE1_SLEEP),
            (0xFE, 121),
            (0x00, MODE1_ALLCALL),
            (0x00, MODE1_ALLCALL | MODE1_RESTART),
        ];
        assert_eq!(*writes.lock().unwrap(), expected);
    }

    #[test]
    fn test_set_frequency_restores_mode() {
        let (mut pwm, writes) = driver();
        pwm.set_frequency(60.0).unwrap();

        let log = writes.lock().unwrap().clone();
        let original = MODE1_SLEEP | MODE1_ALLCALL;
        assert_eq!(log[0], (0x00, original));
        assert_eq!(log[1], (0xFE, prescale_for(60.0).unwrap()));
        assert_eq!(log[2], (0x00, original));
        assert_eq!(log[3], (0x00, original | MODE1_RESTART));
        assert_eq!(pwm.frequency_hz(), 60.0);
    }

    #[test]
    fn test_set_channel_writes_four_registers() {
        let (mut pwm, writes) = driver();
        pwm.set_channel(Channel::new(3).unwrap(), 0, 300).unwrap();

        // Channel 3 starts at 0x06 + 12 = 0x12
        assert_eq!(
            *writes.lock().unwrap(),
            vec![(0x12, 0), (0x13, 0), (0x14, 0x2C), (0x15, 0x01)]
        );
    }

    #[test]
    fn test_bus_failure_is_reported() {
        let mut bus = FakeBus::new();
        bus.fail_on = Some(0x14);
        let mut pwm = Pca9685::new(bus, NoDelay, DEFAULT_ADDRESS, DEFAULT_FREQUENCY_HZ);

        let err = pwm.set_channel(Channel::new(3).unwrap(), 0, 300).unwrap_err();
        assert_eq!(
            err,
            BusError::Transaction {
                register: 0x14,
                kind: ErrorKind::Bus
            }
        );
        assert!(err.is_transient());
    }

    #[test]
    fn test_drop_zeroes_outputs() {
        let (mut pwm, writes) = driver();
        pwm.set_channel(Channel::new(0).unwrap(), 0, 400).unwrap();
        drop(pwm);

        let log = writes.lock().unwrap().clone();
        assert_eq!(&log[4..], &[(0xFA, 0), (0xFB, 0), (0xFC, 0), (0xFD, 0)]);
    }

    #[test]
    fn test_drop_after_reads_only_writes_nothing() {
        let (mut pwm, writes) = driver();
        pwm.read_register(Register::Prescale).unwrap();
        drop(pwm);
        assert!(writes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_simulated_output_tracks_duty() {
        let mut sim = SimulatedPwm::new();
        let ch = Channel::new(2).unwrap();
        sim.set_channel(ch, 0, 350).unwrap();
        assert_eq!(sim.duty(ch), 350);
        sim.set_all_channels(0, 0).unwrap();
        assert_eq!(sim.duty(ch), 0);
    }
}
