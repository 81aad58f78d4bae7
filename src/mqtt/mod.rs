//! # MQTT Session Module
//!
//! Everything needed to drive one MQTT session from an interactive front end:
//! broker configuration, the connection lifecycle, the subscription registry,
//! payload encoding and the message log.
//!
//! ## Module Architecture
//!
//! ```text
//! mqtt/
//! ├── config.rs            - Connection settings, broker URL parsing, defaults
//! ├── error.rs             - SessionError / TransportError
//! ├── transport.rs         - Transport traits and the SessionEvent stream
//! ├── rumqtt_transport.rs  - rumqttc-backed transport (3.1.1 and 5.0)
//! ├── mqtt_handler.rs      - Connection lifecycle state machine
//! ├── subscriptions.rs     - Ordered subscription registry
//! ├── codec.rs             - Payload modes and the `$dp` frame
//! ├── message_manager.rs   - Inbound/outbound message log
//! ├── session.rs           - SessionController, the single entry point
//! └── testing.rs           - Recording transport (tests, `testing` feature)
//! ```
//!
//! ## Event Flow
//!
//! The transport never touches session state. It reports [`SessionEvent`]s
//! tagged with the [`SessionId`] of the connect call that opened it, and the
//! controller drops anything from a superseded connection. Subscriptions
//! live in the registry independent of the connection and are re-sent after
//! every broker acknowledgement.
//!
//! [`SessionEvent`]: transport::SessionEvent
//! [`SessionId`]: transport::SessionId

pub mod codec;
pub mod config;
pub mod error;
pub mod message_manager;
pub mod mqtt_handler;
pub mod rumqtt_transport;
pub mod session;
pub mod subscriptions;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;
