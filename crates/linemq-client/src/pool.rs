//! N-way publish parallelism over independent sessions.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// A fixed set of [`Client`] sessions multiplexing publish traffic.
///
/// Each publish takes an idle client off the pool, runs on it, and returns
/// it regardless of the outcome, so at most N publishes run at once with no
/// cross-session coordination. A single `Client` serializes heavy publish
/// bursts on its write slot; the pool trades connections for throughput.
pub struct ClientPool {
    hand_in: Sender<Client>,
    idle: Receiver<Client>,
    size: usize,
    closed: AtomicBool,
}

impl ClientPool {
    /// Pool with one client per configuration.
    pub fn new(configs: impl IntoIterator<Item = ClientConfig>) -> Self {
        let clients: Vec<Client> = configs.into_iter().map(Client::new).collect();
        let size = clients.len();
        let (hand_in, idle) = bounded(size.max(1));
        for client in clients {
            let _ = hand_in.send(client);
        }
        Self {
            hand_in,
            idle,
            size,
            closed: AtomicBool::new(false),
        }
    }

    /// Pool with `n` clients sharing one configuration.
    pub fn with_size(n: usize, config: &ClientConfig) -> Self {
        Self::new((0..n).map(|_| config.clone()))
    }

    /// Invoke [`Client::publish`] on an idle session.
    pub fn publish(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.with_client(|client| client.publish(topic, message))
    }

    /// Invoke [`Client::publish_at_least_once`] on an idle session.
    pub fn publish_at_least_once(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.with_client(|client| client.publish_at_least_once(topic, message))
    }

    /// Invoke [`Client::publish_exactly_once`] on an idle session.
    pub fn publish_exactly_once(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.with_client(|client| client.publish_exactly_once(topic, message))
    }

    /// Disconnect every session. Outstanding publishes finish first; the
    /// first error encountered is returned.
    pub fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::Closed);
        }
        let mut result = Ok(());
        for _ in 0..self.size {
            match self.idle.recv() {
                Ok(client) => {
                    let disconnected = client.disconnect();
                    if result.is_ok() {
                        result = disconnected;
                    }
                }
                Err(_) => break,
            }
        }
        result
    }

    fn with_client(&self, op: impl FnOnce(&Client) -> Result<()>) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let client = self.idle.recv().map_err(|_| ClientError::Closed)?;
        let result = op(&client);
        let _ = self.hand_in.send(client);
        result
    }
}
