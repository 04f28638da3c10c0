//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use linemq_core::{Will, PACKET_MAX};

use crate::line::LINE_MAX;
use crate::persist::{MemPersistence, Persistence};
use crate::receive::{Discard, Receiver};
use crate::transport::Connecter;

/// Client settings, copied at construction and read-only afterwards.
#[derive(Clone)]
pub struct ClientConfig {
    /// Factory for broker connections.
    pub(crate) connecter: Arc<dyn Connecter>,
    /// Destination for inbound messages. Defaults to a discarding sink.
    pub(crate) receiver: Arc<dyn Receiver>,
    /// Session safeguard. Defaults to a volatile in-memory store.
    pub(crate) persistence: Arc<dyn Persistence>,

    /// Client identifier presented in CONNECT.
    pub client_id: String,
    /// User name for authentication.
    pub user_name: Option<String>,
    /// Password for authentication.
    pub password: Option<Vec<u8>>,
    /// Will message registered with the CONNECT.
    pub will: Option<Will>,
    /// Clean session flag.
    pub clean_session: bool,
    /// Keep-alive interval in seconds (0 = disabled).
    pub keep_alive: u16,

    /// Inbound packets larger than this are dropped without reaching the
    /// receiver. Clamped to the 256 MiB protocol limit.
    pub in_size_limit: usize,
    /// When true, an oversized inbound publish is still acknowledged per its
    /// QoS; when false it is skipped silently (which violates MQTT-4.5.0-2
    /// but never confirms a message the application did not see).
    pub ack_oversized: bool,
    /// Backoff between failed transport operations.
    pub retry_delay: Duration,
    /// In-flight cap for at-least-once publishes (at most 16384).
    pub at_least_once_max: usize,
    /// In-flight cap for exactly-once publishes (at most 16384).
    pub exactly_once_max: usize,
}

impl ClientConfig {
    /// New configuration with defaults: empty client identifier, clean
    /// session, volatile persistence, discarding receiver, 60 s keep-alive.
    pub fn new(connecter: impl Connecter + 'static) -> Self {
        Self {
            connecter: Arc::new(connecter),
            receiver: Arc::new(Discard),
            persistence: Arc::new(MemPersistence::new()),
            client_id: String::new(),
            user_name: None,
            password: None,
            will: None,
            clean_session: true,
            keep_alive: 60,
            in_size_limit: PACKET_MAX,
            ack_oversized: false,
            retry_delay: Duration::from_secs(1),
            at_least_once_max: 256,
            exactly_once_max: 256,
        }
    }

    /// Set the destination for inbound messages.
    pub fn receiver(mut self, receiver: impl Receiver + 'static) -> Self {
        self.receiver = Arc::new(receiver);
        self
    }

    /// Shared variant of [`receiver`](Self::receiver).
    pub fn receiver_arc(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.receiver = receiver;
        self
    }

    /// Set the session store.
    pub fn persistence(mut self, persistence: impl Persistence + 'static) -> Self {
        self.persistence = Arc::new(persistence);
        self
    }

    /// Shared variant of [`persistence`](Self::persistence).
    pub fn persistence_arc(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Set the client identifier.
    pub fn client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set user name and password.
    pub fn credentials(mut self, user: impl Into<String>, password: impl Into<Vec<u8>>) -> Self {
        self.user_name = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// Register a will message.
    pub fn will(mut self, will: Will) -> Self {
        self.will = Some(will);
        self
    }

    /// Set the clean session flag.
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    /// Set the keep-alive interval in seconds.
    pub fn keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive = seconds;
        self
    }

    /// Cap inbound packet size.
    pub fn in_size_limit(mut self, limit: usize) -> Self {
        self.in_size_limit = limit;
        self
    }

    /// Acknowledge oversized inbound publishes instead of staying silent.
    pub fn ack_oversized(mut self, ack: bool) -> Self {
        self.ack_oversized = ack;
        self
    }

    /// Set the backoff applied between failed transport operations.
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Cap concurrent at-least-once publishes.
    pub fn at_least_once_max(mut self, max: usize) -> Self {
        self.at_least_once_max = max.clamp(1, LINE_MAX);
        self
    }

    /// Cap concurrent exactly-once publishes.
    pub fn exactly_once_max(mut self, max: usize) -> Self {
        self.exactly_once_max = max.clamp(1, LINE_MAX);
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        self.in_size_limit = self.in_size_limit.min(PACKET_MAX);
        self.at_least_once_max = self.at_least_once_max.clamp(1, LINE_MAX);
        self.exactly_once_max = self.exactly_once_max.clamp(1, LINE_MAX);
        self
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("client_id", &self.client_id)
            .field("user_name", &self.user_name)
            .field("clean_session", &self.clean_session)
            .field("keep_alive", &self.keep_alive)
            .field("in_size_limit", &self.in_size_limit)
            .field("ack_oversized", &self.ack_oversized)
            .field("retry_delay", &self.retry_delay)
            .field("at_least_once_max", &self.at_least_once_max)
            .field("exactly_once_max", &self.exactly_once_max)
            .finish_non_exhaustive()
    }
}
