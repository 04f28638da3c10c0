//! linemq-client - MQTT 3.1.1 client engine.
//!
//! The [`Client`] moves publish and subscribe requests over a single broker
//! connection with the three delivery guarantees, recovering in-flight
//! messages across connection loss through a pluggable [`Persistence`]
//! store. A [`ClientPool`] multiplexes publish work over several sessions.
//!
//! ```no_run
//! use std::time::Duration;
//! use linemq_client::{unsecured_connecter, Client, ClientConfig};
//!
//! let config = ClientConfig::new(unsecured_connecter(
//!     "localhost:1883",
//!     Duration::from_secs(4),
//! ))
//! .client_id("demo");
//!
//! let client = Client::new(config);
//! client.publish_at_least_once("greet/world", b"hello")?;
//! client.disconnect()?;
//! # Ok::<(), linemq_client::ClientError>(())
//! ```

mod client;
mod config;
mod error;
mod line;
mod persist;
mod pool;
mod receive;
mod tls;
mod transport;

pub use client::Client;
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use persist::{MemPersistence, Persistence, LOCAL_KEY_FLAG, SUBSCRIPTION_PACKET_ID};
pub use pool::ClientPool;
pub use receive::Receiver;
pub use tls::{secured_connecter, TlsTransport};
pub use transport::{unsecured_connecter, Conn, Connecter, Transport};

// wire-level types a configuration touches
pub use linemq_core::{ConnectReturn, ProtocolError, QoS, Will};
