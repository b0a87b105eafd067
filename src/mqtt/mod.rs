//! # MQTT Integration Module
//!
//! Everything the `pubsub` binary needs to talk to a broker. The actual
//! protocol work (session negotiation, keep-alive, reconnects, packet
//! encoding) lives in `rumqttc`; this module assembles configuration,
//! selects a credential strategy and drives a bounded publish session on
//! top of the client handle.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs      - Connection settings and credential strategy selection
//! ├── connection.rs  - Packaging settings into rumqttc options and transports
//! ├── link.rs        - Event pump: rumqttc event loop -> LinkEvent channel
//! └── session.rs     - Connecting -> Publishing -> Disconnecting state machine
//! ```
//!
//! ## Event Flow
//!
//! The client library surfaces connection interruptions, resumptions and
//! inbound messages on its own polling loop. Rather than reacting from
//! callbacks on a foreign task, the pump translates everything into
//! [`link::LinkEvent`] values on an `mpsc` channel and the session state
//! machine consumes them in one place, which keeps ordering
//! deterministic. Subscription bookkeeping (the initial subscribe and
//! resubscription after a lost session) also lives in the pump, so
//! SUBACK results can be matched back to topic names and a rejected
//! topic is reported per topic.

pub mod config;
pub mod connection;
pub mod link;
pub mod session;
