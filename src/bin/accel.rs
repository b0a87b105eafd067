//! Polls the LIS3DH accelerometer once per second and prints the axes.
//!
//! No command-line surface; runs until killed. A bus fault terminates
//! the loop with the error.

use std::thread;
use std::time::Duration;

use color_eyre::Result;
use rppal::i2c::I2c;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use iotprobe::sensor::{Lis3dh, LIS3DH_I2C_ADDR};

const POLL_PERIOD: Duration = Duration::from_secs(1);

fn main() -> Result<()> {
    setup()?;

    let mut bus = I2c::new()?;
    bus.set_slave_address(u16::from(LIS3DH_I2C_ADDR))?;

    let mut sensor = Lis3dh::new(bus);
    sensor.init()?;
    info!("LIS3DH ready, polling every second");

    loop {
        let sample = sensor.acceleration()?;
        println!("{sample}");
        thread::sleep(POLL_PERIOD);
    }
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
    Ok(())
}
