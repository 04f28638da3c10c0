//! Inbound delivery callbacks.

/// Destination for inbound application messages.
///
/// The read loop invokes these methods, so implementations should return
/// promptly; a slow receiver stalls all acknowledgement traffic on the
/// connection. All methods have default implementations, so a publish-only
/// client can implement nothing and a plain consumer only `on_message`.
pub trait Receiver: Send + Sync {
    /// An at-most-once delivery, or the default destination for the two
    /// acknowledged grades.
    #[allow(unused_variables)]
    fn on_message(&self, topic: &str, message: &[u8]) {}

    /// An at-least-once delivery. Return `true` to permit the PUBACK;
    /// returning `false` withholds it and invites redelivery, so the same
    /// message may arrive again even after a `true`.
    fn on_at_least_once(&self, topic: &str, message: &[u8]) -> bool {
        self.on_message(topic, message);
        true
    }

    /// An exactly-once delivery, replayed from the staging store on the
    /// second protocol round trip. Return `true` to commit: the staged copy
    /// is deleted and the exchange confirmed. On `false` the copy stays and
    /// the method runs again for the next PUBREL. A client restart before
    /// the final acknowledgement may also repeat the call.
    fn on_exactly_once(&self, topic: &str, message: &[u8]) -> bool {
        self.on_message(topic, message);
        true
    }
}

/// Default receiver: logs and drops everything, acknowledging as it goes.
pub(crate) struct Discard;

impl Receiver for Discard {
    fn on_message(&self, topic: &str, message: &[u8]) {
        log::debug!("no receiver configured; dropping {} B @ {topic}", message.len());
    }
}
