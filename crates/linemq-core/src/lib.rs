//! linemq-core - MQTT 3.1.1 wire codec.
//!
//! This crate provides packet encoding and decoding for the client engine:
//! control packet framing, variable-length integers, and string validation.
//! It knows nothing about connections, sessions, or persistence.

pub mod error;
pub mod packet;
pub mod varint;

pub use error::ProtocolError;
pub use packet::*;
