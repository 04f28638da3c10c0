//! Protocol error vocabulary.

use thiserror::Error;

/// A violation of MQTT 3.1.1 framing or exchange rules.
///
/// Most variants belong to the reset class: the peer sent something illegal
/// and the connection must be torn down before resuming. The two encode-side
/// variants ([`StringInvalid`](ProtocolError::StringInvalid) and
/// [`PacketTooLarge`](ProtocolError::PacketTooLarge)) fault the caller
/// instead and leave the connection alone. [`is_reset`](ProtocolError::is_reset)
/// tells the two groups apart.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Reserved control packet type 0 or 15 on the wire.
    #[error("reserved packet type {0}")]
    ReservedPacketType(u8),

    /// A packet type only a client may send arrived from the server.
    #[error("received client-to-server packet type {0}")]
    UnexpectedPacketType(u8),

    /// A CONNACK outside the connect handshake.
    #[error("received connect acknowledgement outside the handshake")]
    StrayConnack,

    /// PUBLISH with the reserved QoS bit pattern 3.
    #[error("publish carries reserved QoS 3")]
    ReservedQos,

    /// A fixed-size packet with the wrong remaining length.
    #[error("{kind} with remaining length {got}")]
    SizeMismatch { kind: &'static str, got: usize },

    /// Remaining-length declaration with a continuation bit in the 4th byte.
    #[error("remaining length declaration exceeds 4 bytes")]
    RemainingLengthOverflow,

    /// An acknowledgement for a packet identifier other than the one in use.
    #[error("packet identifier {got:#06x} does not match {want:#06x} in use")]
    PacketIdMismatch { got: u16, want: u16 },

    /// An acknowledgement for a packet identifier with nothing in flight.
    #[error("packet identifier {0:#06x} not in flight")]
    PacketIdUnknown(u16),

    /// An acknowledgement that skips a step of the exactly-once exchange.
    #[error("packet identifier {0:#06x} not in the expected delivery state")]
    PacketIdOutOfOrder(u16),

    /// SUBACK return code outside {0, 1, 2, 0x80}.
    #[error("subscribe acknowledgement carries return code {0:#04x}")]
    InvalidReturnCode(u8),

    /// A SUBACK with more return codes than topic filters requested.
    #[error("subscribe acknowledgement carries {got} return codes for {want} topic filters")]
    ReturnCodeCount { got: usize, want: usize },

    /// CONNACK return code 6 or higher.
    #[error("reserved connect return code {0}")]
    ReservedConnectReturn(u8),

    /// CONNACK acknowledge flags with reserved bits set.
    #[error("reserved connect acknowledgement flags {0:#04x}")]
    ReservedConnackFlags(u8),

    /// The connect handshake got something other than a plain CONNACK.
    #[error("received head {0:#04x}, want connect acknowledgement")]
    MalformedConnack(u8),

    /// Inbound topic name that is not valid UTF-8 or contains U+0000.
    #[error("malformed topic name")]
    TopicInvalid,

    /// Caller-supplied string with U+0000 or over 65535 bytes once encoded.
    #[error("string contains U+0000 or exceeds 65535 bytes")]
    StringInvalid,

    /// The packet would exceed the 256 MiB protocol limit.
    #[error("packet exceeds the 256 MiB protocol limit")]
    PacketTooLarge,
}

impl ProtocolError {
    /// Whether this error requires the current connection to be dropped.
    pub fn is_reset(&self) -> bool {
        !matches!(
            self,
            ProtocolError::StringInvalid | ProtocolError::PacketTooLarge
        )
    }
}
