//! LIS3DH accelerometer driver.
//!
//! Configures the chip for 100 Hz, high-resolution, ±2 g operation and
//! reads the three axes in one burst. Raw counts are converted to m/s².

use std::fmt;

use tracing::debug;

use super::bus::RegisterBus;
use super::SensorError;

/// Default I2C address (SDO pin low).
pub const LIS3DH_I2C_ADDR: u8 = 0x18;

const REG_WHO_AM_I: u8 = 0x0F;
const REG_CTRL_REG1: u8 = 0x20;
const REG_CTRL_REG4: u8 = 0x23;
const REG_OUT_X_L: u8 = 0x28;

/// Set on the register address to auto-increment during burst reads.
const AUTO_INCREMENT: u8 = 0x80;

const DEVICE_ID: u8 = 0x33;

/// 100 Hz data rate, normal mode, all three axes enabled.
const CTRL_REG1_INIT: u8 = 0x57;
/// Block data update and high-resolution mode, ±2 g full scale.
const CTRL_REG4_INIT: u8 = 0x88;

/// Raw counts per g at ±2 g in high-resolution mode.
const COUNTS_PER_G: f32 = 16380.0;
const STANDARD_GRAVITY: f32 = 9.80665;

/// One three-axis reading in m/s².
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelSample {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl fmt::Display for AccelSample {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "x: {:.2}, y: {:.2}, z: {:.2}", self.x, self.y, self.z)
    }
}

pub struct Lis3dh<B: RegisterBus> {
    bus: B,
}

impl<B: RegisterBus> Lis3dh<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    /// Probes the device id and programs the control registers.
    pub fn init(&mut self) -> Result<(), SensorError> {
        let id = self.bus.read_register(REG_WHO_AM_I)?;
        if id != DEVICE_ID {
            return Err(SensorError::UnexpectedDevice {
                found: id,
                expected: DEVICE_ID,
            });
        }
        self.bus.write_register(REG_CTRL_REG1, CTRL_REG1_INIT)?;
        self.bus.write_register(REG_CTRL_REG4, CTRL_REG4_INIT)?;
        debug!("LIS3DH configured: 100 Hz, high resolution, ±2 g");
        Ok(())
    }

    /// Reads all three axes in one burst.
    pub fn acceleration(&mut self) -> Result<AccelSample, SensorError> {
        let mut raw = [0u8; 6];
        self.bus
            .read_registers(REG_OUT_X_L | AUTO_INCREMENT, &mut raw)?;
        Ok(AccelSample {
            x: convert(raw[0], raw[1]),
            y: convert(raw[2], raw[3]),
            z: convert(raw[4], raw[5]),
        })
    }

    pub fn release(self) -> B {
        self.bus
    }
}

/// Converts a little-endian axis register pair to m/s².
fn convert(low: u8, high: u8) -> f32 {
    let counts = i16::from_le_bytes([low, high]);
    counts as f32 / COUNTS_PER_G * STANDARD_GRAVITY
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MockBus {
        registers: HashMap<u8, u8>,
        writes: Vec<(u8, u8)>,
    }

    impl MockBus {
        fn new(registers: &[(u8, u8)]) -> Self {
            Self {
                registers: registers.iter().copied().collect(),
                writes: Vec::new(),
            }
        }
    }

    impl RegisterBus for MockBus {
        fn read_register(&mut self, register: u8) -> Result<u8, SensorError> {
            self.registers
                .get(&(register & !AUTO_INCREMENT))
                .copied()
                .ok_or_else(|| SensorError::Bus(format!("no register {register:#04x}")))
        }

        fn read_registers(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), SensorError> {
            let base = register & !AUTO_INCREMENT;
            for (offset, slot) in buffer.iter_mut().enumerate() {
                *slot = self
                    .registers
                    .get(&(base + offset as u8))
                    .copied()
                    .unwrap_or(0);
            }
            Ok(())
        }

        fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
            self.writes.push((register, value));
            Ok(())
        }
    }

    #[test]
    fn init_programs_the_control_registers() {
        let bus = MockBus::new(&[(REG_WHO_AM_I, DEVICE_ID)]);
        let mut sensor = Lis3dh::new(bus);
        sensor.init().unwrap();

        let bus = sensor.release();
        assert_eq!(
            bus.writes,
            vec![(REG_CTRL_REG1, 0x57), (REG_CTRL_REG4, 0x88)]
        );
    }

    #[test]
    fn init_rejects_an_unexpected_device() {
        let bus = MockBus::new(&[(REG_WHO_AM_I, 0x6A)]);
        let mut sensor = Lis3dh::new(bus);

        assert!(matches!(
            sensor.init(),
            Err(SensorError::UnexpectedDevice {
                found: 0x6A,
                expected: DEVICE_ID,
            })
        ));
    }

    #[test]
    fn a_known_register_image_converts_to_expected_accelerations() {
        // x = 0, y = -8190 counts (-0.5 g), z = 16380 counts (1 g)
        let bus = MockBus::new(&[
            (REG_WHO_AM_I, DEVICE_ID),
            (0x28, 0x00),
            (0x29, 0x00),
            (0x2A, 0x02),
            (0x2B, 0xE0),
            (0x2C, 0xFC),
            (0x2D, 0x3F),
        ]);
        let mut sensor = Lis3dh::new(bus);
        let sample = sensor.acceleration().unwrap();

        assert!(sample.x.abs() < 1e-4);
        assert!((sample.y + STANDARD_GRAVITY / 2.0).abs() < 1e-3);
        assert!((sample.z - STANDARD_GRAVITY).abs() < 1e-3);
    }

    #[test]
    fn samples_render_with_two_decimals() {
        let sample = AccelSample {
            x: 0.0,
            y: -4.903,
            z: 9.80665,
        };
        assert_eq!(sample.to_string(), "x: 0.00, y: -4.90, z: 9.81");
    }
}
