//! Bus trait between the driver and the hardware.

use rppal::i2c::I2c;

use super::SensorError;

/// Register-oriented reads and writes against a single device.
///
/// The implementation is expected to have the device address already
/// selected; the driver only deals in register addresses.
pub trait RegisterBus {
    fn read_register(&mut self, register: u8) -> Result<u8, SensorError>;

    /// Reads consecutive registers starting at `register` into `buffer`.
    fn read_registers(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), SensorError>;

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError>;
}

impl RegisterBus for I2c {
    fn read_register(&mut self, register: u8) -> Result<u8, SensorError> {
        let mut buffer = [0u8; 1];
        self.write_read(&[register], &mut buffer)
            .map_err(|e| SensorError::Bus(e.to_string()))?;
        Ok(buffer[0])
    }

    fn read_registers(&mut self, register: u8, buffer: &mut [u8]) -> Result<(), SensorError> {
        self.write_read(&[register], buffer)
            .map_err(|e| SensorError::Bus(e.to_string()))
    }

    fn write_register(&mut self, register: u8, value: u8) -> Result<(), SensorError> {
        self.write(&[register, value])
            .map_err(|e| SensorError::Bus(e.to_string()))
            .map(|_| ())
    }
}
