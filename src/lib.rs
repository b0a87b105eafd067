//! iotprobe: small device-side tools for poking at an IoT deployment.
//!
//! Two binaries share this crate:
//!
//! * `pubsub` connects to an MQTT broker, subscribes to a topic,
//!   publishes a bounded series of JSON counter messages and
//!   disconnects. All protocol work is delegated to `rumqttc`; this
//!   crate only assembles configuration and drives the session.
//! * `accel` polls an LIS3DH accelerometer on the I2C bus once per
//!   second and prints the three axes.
//!
//! ## Modules
//!
//! * `cli`: dynamic command registry over the `clap` builder API.
//! * `mqtt`: connection settings, credential strategies, the event pump
//!   and the publish-session state machine.
//! * `sensor`: register-level LIS3DH driver behind a small bus trait.

pub mod cli;
pub mod mqtt;
pub mod sensor;
