//! Durable session state contract.
//!
//! The client survives connection loss by writing every unacknowledged
//! exchange to a [`Persistence`] store before it touches the wire. On
//! reconnect the outbound half of the store is replayed verbatim, which is
//! what turns the QoS 1 and QoS 2 promises into guarantees.
//!
//! Keys span 17 bits. Bit 16 ([`LOCAL_KEY_FLAG`]) marks client-originated
//! state: outbound PUBLISH and PUBREL copies, plus the one reserved slot for
//! subscription requests. Keys with bit 16 clear hold inbound exactly-once
//! payloads staged between PUBREC and PUBREL.

use std::collections::BTreeMap;
use std::io;

use bytes::Bytes;
use parking_lot::Mutex;

/// Marks a key as client-originated (outbound) state.
pub const LOCAL_KEY_FLAG: u32 = 1 << 16;

/// The packet identifier reserved for SUBSCRIBE and UNSUBSCRIBE traffic.
///
/// Keeping subscription exchanges out of the publish allocators guarantees at
/// most one subscription request in flight per client.
pub const SUBSCRIPTION_PACKET_ID: u16 = 1;

/// Durable key to byte-buffer map consumed by the client.
///
/// Implementations must be safe for concurrent calls from the read loop and
/// from public callers; the client serializes nothing.
pub trait Persistence: Send + Sync {
    /// Atomically store the concatenation of `parts` under `key`,
    /// replacing any previous value.
    fn store(&self, key: u32, parts: &[&[u8]]) -> io::Result<()>;

    /// Fetch the value under `key`, or `None` when absent.
    fn load(&self, key: u32) -> io::Result<Option<Bytes>>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&self, key: u32) -> io::Result<()>;

    /// Snapshot of all records, used to replay outbound state on reconnect.
    fn entries(&self) -> io::Result<Vec<(u32, Bytes)>>;
}

/// Volatile in-memory store.
///
/// Sessions backed by this store do not survive the process; in-flight
/// messages are still recovered across connection loss within its lifetime.
#[derive(Debug, Default)]
pub struct MemPersistence {
    records: Mutex<BTreeMap<u32, Bytes>>,
}

impl MemPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persistence for MemPersistence {
    fn store(&self, key: u32, parts: &[&[u8]]) -> io::Result<()> {
        let mut value = Vec::with_capacity(parts.iter().map(|p| p.len()).sum());
        for part in parts {
            value.extend_from_slice(part);
        }
        self.records.lock().insert(key, Bytes::from(value));
        Ok(())
    }

    fn load(&self, key: u32) -> io::Result<Option<Bytes>> {
        Ok(self.records.lock().get(&key).cloned())
    }

    fn delete(&self, key: u32) -> io::Result<()> {
        self.records.lock().remove(&key);
        Ok(())
    }

    fn entries(&self) -> io::Result<Vec<(u32, Bytes)>> {
        Ok(self
            .records
            .lock()
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }
}
