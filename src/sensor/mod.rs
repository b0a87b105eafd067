//! # Sensor Module
//!
//! Register-level access to the LIS3DH accelerometer. The driver talks
//! to the chip through the [`bus::RegisterBus`] trait so the `accel`
//! binary can hand it the Raspberry Pi I2C bus while tests substitute an
//! in-memory register map. No filtering, buffering or recovery happens
//! here; a bus fault surfaces as an error and the caller decides.

pub mod bus;
pub mod lis3dh;

pub use bus::RegisterBus;
pub use lis3dh::{AccelSample, Lis3dh, LIS3DH_I2C_ADDR};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Unexpected device id {found:#04x} (expected {expected:#04x})")]
    UnexpectedDevice { found: u8, expected: u8 },
}
