//! MQTT client: connection lifecycle, read loop, and delivery pipelines.
//!
//! Each [`Client`] owns one dedicated read thread. Public methods encode a
//! packet, persist it when the delivery grade demands, acquire the write
//! slot, write, and then wait for the acknowledgement that the read thread
//! hands over through a rendezvous channel. The write slot is a one-place
//! cell holding the current connection, so wire writes are totally ordered
//! by acquisition; nothing ever interleaves inside a packet.

use std::io::{self, BufReader, IoSlice, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Receiver as SlotReceiver, Sender as SlotSender};
use linemq_core::{
    decode_packet, encode_ack, encode_connect, encode_subscribe, encode_unsubscribe,
    publish_header, Connect, ConnectReturn, Packet, PacketType, ProtocolError, QoS, DISCONNECT,
    DUP_FLAG, PINGREQ,
};
use log::{debug, error, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::line::{AtLeastOnceLine, ExactlyOnceLine};
use crate::persist::{Persistence, LOCAL_KEY_FLAG, SUBSCRIPTION_PACKET_ID};
use crate::receive::Receiver;
use crate::transport::{Conn, Connecter, Transport};

/// Buffered reader over the read half of the current connection.
type PacketReader = BufReader<Conn>;

/// Errors worth retrying on the same connection after a backoff.
fn retry_in_place(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

struct SlotState {
    conn: Option<Conn>,
    /// Bumped on every install so a writer cannot put a superseded
    /// connection back over its replacement.
    epoch: u64,
    closed: bool,
}

/// One-place cell holding the current connection. Whoever holds the
/// connection may write to the socket.
struct ConnSlot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl ConnSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                conn: None,
                epoch: 0,
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Block until a connection is present, then take it.
    fn acquire(&self) -> Result<(Conn, u64)> {
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(ClientError::Closed);
            }
            if let Some(conn) = state.conn.take() {
                return Ok((conn, state.epoch));
            }
            self.ready.wait(&mut state);
        }
    }

    fn release(&self, conn: Conn, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch == epoch && !state.closed && state.conn.is_none() {
            state.conn = Some(conn);
            self.ready.notify_one();
        }
    }

    /// Install a fresh connection, superseding whatever was current.
    fn install(&self, conn: Conn) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.epoch += 1;
        state.conn = Some(conn);
        self.ready.notify_all();
    }

    fn take_now(&self) -> Option<Conn> {
        self.state.lock().conn.take()
    }

    fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.conn = None;
        self.ready.notify_all();
    }
}

struct ClientCore {
    config: ClientConfig,
    slot: ConnSlot,
    closed: AtomicBool,

    /// Semaphore for the one ping request in flight.
    ping_slot: (SlotSender<SlotSender<()>>, SlotReceiver<SlotSender<()>>),
    /// Semaphore for the one subscribe or unsubscribe request in flight.
    /// The rendezvous carries the per-filter return codes (empty for
    /// UNSUBACK).
    sub_slot: (
        SlotSender<SlotSender<Vec<u8>>>,
        SlotReceiver<SlotSender<Vec<u8>>>,
    ),

    at_least_once: AtLeastOnceLine,
    exactly_once: ExactlyOnceLine,
}

/// A long-lived session with one broker.
///
/// All methods are safe to call from multiple threads; the write slot and
/// the identifier lines do the serialization. [`ClientPool`] offers N-way
/// parallelism over independent sessions on top.
///
/// [`ClientPool`]: crate::pool::ClientPool
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    /// Create the client and launch its read thread. The first connect
    /// attempt starts immediately.
    pub fn new(config: ClientConfig) -> Self {
        let config = config.normalized();
        let core = Arc::new(ClientCore {
            at_least_once: AtLeastOnceLine::new(config.at_least_once_max),
            exactly_once: ExactlyOnceLine::new(config.exactly_once_max),
            slot: ConnSlot::new(),
            closed: AtomicBool::new(false),
            ping_slot: bounded(1),
            sub_slot: bounded(1),
            config,
        });

        let runner = Arc::clone(&core);
        thread::spawn(move || runner.read_routine());

        Client { core }
    }

    /// Fire-and-forget delivery with QoS 0.
    ///
    /// The most efficient option: no persistence, no acknowledgement, and no
    /// guarantee under error.
    pub fn publish(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.core.publish_unacked(topic, message, false)
    }

    /// Like [`publish`](Self::publish), with the message retained on the
    /// server for future subscribers.
    pub fn publish_retained(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.core.publish_unacked(topic, message, true)
    }

    /// Persist the message and deliver it with QoS 1.
    ///
    /// Returns once the message is safe in the session store; delivery and
    /// redelivery then proceed regardless of connection loss, until the
    /// server acknowledges.
    pub fn publish_at_least_once(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.core
            .publish_acked(topic, message, QoS::AtLeastOnce, false)
    }

    /// Like [`publish_at_least_once`](Self::publish_at_least_once), retained.
    pub fn publish_at_least_once_retained(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.core
            .publish_acked(topic, message, QoS::AtLeastOnce, true)
    }

    /// Persist the message and deliver it with QoS 2, which rules out the
    /// duplicate reception QoS 1 permits at the cost of a second round trip.
    pub fn publish_exactly_once(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.core
            .publish_acked(topic, message, QoS::ExactlyOnce, false)
    }

    /// Like [`publish_exactly_once`](Self::publish_exactly_once), retained.
    pub fn publish_exactly_once_retained(&self, topic: &str, message: &[u8]) -> Result<()> {
        self.core.publish_acked(topic, message, QoS::ExactlyOnce, true)
    }

    /// Request a subscription to every topic matching any of the filters.
    ///
    /// At most one subscribe or unsubscribe runs at a time; concurrent calls
    /// wait their turn. On partial rejection the error lists the zero-based
    /// indexes of the refused filters while the others stay active.
    pub fn subscribe(&self, topic_filters: &[&str]) -> Result<()> {
        self.core.subscribe(topic_filters)
    }

    /// Cancel subscriptions.
    pub fn unsubscribe(&self, topic_filters: &[&str]) -> Result<()> {
        self.core.unsubscribe(topic_filters)
    }

    /// Round trip to the server to validate the connection.
    pub fn ping(&self) -> Result<()> {
        self.core.ping()
    }

    /// Graceful termination: writes DISCONNECT (which discards the will) and
    /// closes the transport. All subsequent calls return
    /// [`ClientError::Closed`].
    pub fn disconnect(&self) -> Result<()> {
        self.core.disconnect()
    }

    /// Number of outbound exchanges awaiting their final acknowledgement.
    pub fn pending(&self) -> usize {
        self.core.at_least_once.len() + self.core.exactly_once.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !self.core.closed.load(Ordering::Acquire) {
            let _ = self.core.disconnect();
        }
    }
}

impl ClientCore {
    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn closed_check(&self) -> Result<()> {
        if self.closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    // ===== write path =====

    fn write(&self, packet: &[u8]) -> Result<()> {
        self.write_buffers(&[packet])
    }

    /// Write an ordered list of buffers as one totally-ordered wire unit,
    /// retrying transient errors from the accepted byte offset.
    fn write_buffers(&self, buffers: &[&[u8]]) -> Result<()> {
        let total: usize = buffers.iter().map(|b| b.len()).sum();
        let (mut conn, epoch) = self.slot.acquire()?;

        let mut done = 0usize;
        let result = loop {
            match write_from(&mut conn, buffers, done) {
                Ok(0) if done < total => {
                    let _ = conn.shutdown();
                    break Err(ClientError::Transport(io::ErrorKind::WriteZero.into()));
                }
                Ok(n) => {
                    done += n;
                    if done >= total {
                        break Ok(());
                    }
                }
                Err(e) if retry_in_place(&e) => {
                    if self.closed() {
                        break Err(ClientError::Closed);
                    }
                    warn!("write retry in {:?} on {e}", self.config.retry_delay);
                    thread::sleep(self.config.retry_delay);
                }
                Err(e) => {
                    // force a reconnect; persisted traffic replays there
                    let _ = conn.shutdown();
                    break Err(ClientError::Transport(e));
                }
            }
        };

        self.slot.release(conn, epoch);
        result
    }

    /// Shut the current connection down in place so the read loop observes
    /// the loss and reconnects. The connection stays in the slot: taking it
    /// here could leave the read loop parked on an acquire with nobody left
    /// to connect.
    fn force_reset(&self) {
        let state = self.slot.state.lock();
        if let Some(conn) = state.conn.as_ref() {
            let _ = conn.shutdown();
        }
    }

    /// Read-loop teardown of a connection that already failed.
    fn discard_current(&self) {
        if let Some(conn) = self.slot.take_now() {
            let _ = conn.shutdown();
        }
    }

    // ===== outbound publish pipelines =====

    fn publish_unacked(&self, topic: &str, message: &[u8], retain: bool) -> Result<()> {
        self.closed_check()?;
        let mut head = Vec::with_capacity(7 + topic.len());
        publish_header(topic, message.len(), QoS::AtMostOnce, retain, &mut head)?;
        self.write_buffers(&[&head, message])
    }

    fn publish_acked(&self, topic: &str, message: &[u8], qos: QoS, retain: bool) -> Result<()> {
        self.closed_check()?;
        let mut head = Vec::with_capacity(9 + topic.len());
        publish_header(topic, message.len(), qos, retain, &mut head)?;

        let id = match qos {
            QoS::AtLeastOnce => self.at_least_once.assign()?,
            _ => self.exactly_once.assign()?,
        };
        head.extend_from_slice(&id.to_be_bytes());

        // the record must be durable before the first byte hits the wire
        let key = LOCAL_KEY_FLAG | id as u32;
        if let Err(e) = self.config.persistence.store(key, &[&head, message]) {
            match qos {
                QoS::AtLeastOnce => self.at_least_once.rollback(id),
                _ => self.exactly_once.rollback(id),
            }
            return Err(ClientError::Persistence(e));
        }

        if let Err(e) = self.write_buffers(&[&head, message]) {
            warn!("publish {id:#06x} deferred to replay on {e}");
        }
        Ok(())
    }

    // ===== request-reply operations =====

    fn subscribe(&self, topic_filters: &[&str]) -> Result<()> {
        if topic_filters.is_empty() {
            return Ok(());
        }
        self.closed_check()?;

        let mut packet = Vec::new();
        encode_subscribe(SUBSCRIPTION_PACKET_ID, topic_filters, &mut packet)?;

        let codes = self.subscription_round_trip(packet)?;
        if codes.len() > topic_filters.len() {
            self.force_reset();
            return Err(ProtocolError::ReturnCodeCount {
                got: codes.len(),
                want: topic_filters.len(),
            }
            .into());
        }

        let mut rejected = Vec::new();
        for (i, &code) in codes.iter().enumerate() {
            match code {
                0 | 1 | 2 => {}
                0x80 => rejected.push(i),
                _ => {
                    self.force_reset();
                    return Err(ProtocolError::InvalidReturnCode(code).into());
                }
            }
        }
        if !rejected.is_empty() {
            return Err(ClientError::SubscribeRejected(rejected));
        }
        Ok(())
    }

    fn unsubscribe(&self, topic_filters: &[&str]) -> Result<()> {
        if topic_filters.is_empty() {
            return Ok(());
        }
        self.closed_check()?;

        let mut packet = Vec::new();
        encode_unsubscribe(SUBSCRIPTION_PACKET_ID, topic_filters, &mut packet)?;

        let codes = self.subscription_round_trip(packet)?;
        if !codes.is_empty() {
            self.force_reset();
            return Err(ProtocolError::ReturnCodeCount {
                got: codes.len(),
                want: 0,
            }
            .into());
        }
        Ok(())
    }

    /// Persist a subscription request, write it, and await its
    /// acknowledgement. The subscription slot admits one request at a time.
    fn subscription_round_trip(&self, packet: Vec<u8>) -> Result<Vec<u8>> {
        let (ack, rendezvous) = bounded(1);
        if self.sub_slot.0.send(ack).is_err() {
            return Err(ClientError::Closed);
        }

        let key = LOCAL_KEY_FLAG | SUBSCRIPTION_PACKET_ID as u32;
        if let Err(e) = self.config.persistence.store(key, &[&packet]) {
            let _ = self.sub_slot.1.try_recv();
            return Err(ClientError::Persistence(e));
        }
        if let Err(e) = self.write(&packet) {
            // the transport is already down; reconnect replays the request,
            // and a late acknowledgement finds the slot empty
            let _ = self.sub_slot.1.try_recv();
            return Err(e);
        }

        rendezvous.recv().map_err(|_| ClientError::Closed)
    }

    fn ping(&self) -> Result<()> {
        self.closed_check()?;

        let (ack, rendezvous) = bounded(1);
        if self.ping_slot.0.send(ack).is_err() {
            return Err(ClientError::Closed);
        }
        if let Err(e) = self.write(&PINGREQ) {
            let _ = self.ping_slot.1.try_recv();
            return Err(e);
        }
        rendezvous.recv().map_err(|_| ClientError::Closed)
    }

    fn disconnect(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::Closed);
        }

        let result = match self.slot.take_now() {
            Some(mut conn) => {
                let written = conn.write_all(&DISCONNECT).map_err(ClientError::Transport);
                let _ = conn.shutdown();
                written
            }
            None => Ok(()),
        };

        // unblock callers parked on the slot or a full line; the read loop
        // notices the shutdown and drains the rendezvous slots
        self.slot.close();
        self.at_least_once.close();
        self.exactly_once.close();
        result
    }

    // ===== read loop =====

    fn read_routine(&self) {
        loop {
            match self.connect() {
                Ok(mut reader) => {
                    if let Err(e) = self.replay() {
                        error!("session replay interrupted: {e}");
                    }
                    let mut body = Vec::new();
                    loop {
                        match self.next_packet(&mut reader, &mut body) {
                            Ok(()) => continue,
                            Err(ClientError::Closed) => return self.terminate(),
                            Err(e) => {
                                if !self.closed() {
                                    error!("connection lost: {e}");
                                }
                                break;
                            }
                        }
                    }
                    self.discard_current();
                }
                Err(ClientError::Closed) => return self.terminate(),
                Err(e) => {
                    error!("connect failed: {e}");
                    thread::sleep(self.config.retry_delay);
                }
            }

            if self.closed() {
                return self.terminate();
            }
        }
    }

    /// Permanent wind-down: fail blocked callers and outstanding
    /// request-reply waits.
    fn terminate(&self) {
        self.slot.close();
        self.at_least_once.close();
        self.exactly_once.close();
        while self.ping_slot.1.try_recv().is_ok() {}
        while self.sub_slot.1.try_recv().is_ok() {}
    }

    /// One connect attempt: dial, CONNECT, CONNACK validation. On success
    /// the connection lands in the write slot and the returned reader feeds
    /// the packet loop.
    fn connect(&self) -> Result<PacketReader> {
        self.closed_check()?;
        let mut conn = self
            .config
            .connecter
            .connect()
            .map_err(ClientError::Transport)?;

        let mut packet = Vec::with_capacity(32);
        let compose = encode_connect(
            &Connect {
                client_id: &self.config.client_id,
                user_name: self.config.user_name.as_deref(),
                password: self.config.password.as_deref(),
                will: self.config.will.as_ref(),
                clean_session: self.config.clean_session,
                keep_alive: self.config.keep_alive,
            },
            &mut packet,
        );
        if let Err(e) = compose {
            let _ = conn.shutdown();
            return Err(e.into());
        }
        if let Err(e) = conn.write_all(&packet) {
            let _ = conn.shutdown();
            return Err(ClientError::Transport(e));
        }

        let mut ack = [0u8; 4];
        if let Err(e) = conn.read_exact(&mut ack) {
            let _ = conn.shutdown();
            return Err(ClientError::Transport(e));
        }
        let accept = Self::check_connack(ack);
        if let Err(e) = accept {
            let _ = conn.shutdown();
            return Err(e);
        }

        let reader = conn.try_clone().map_err(ClientError::Transport)?;
        self.slot.install(conn);
        Ok(BufReader::with_capacity(4096, reader))
    }

    fn check_connack(ack: [u8; 4]) -> Result<()> {
        if ack[0] != (PacketType::Connack as u8) << 4 {
            return Err(ProtocolError::MalformedConnack(ack[0]).into());
        }
        if ack[1] != 2 {
            return Err(ProtocolError::SizeMismatch {
                kind: "connect acknowledgement",
                got: ack[1] as usize,
            }
            .into());
        }
        if ack[2] > 1 {
            return Err(ProtocolError::ReservedConnackFlags(ack[2]).into());
        }
        match ConnectReturn::try_from(ack[3])? {
            ConnectReturn::Accepted => Ok(()),
            refusal => Err(ClientError::Refused(refusal)),
        }
    }

    /// Re-write all outbound session state to a fresh connection, keeping
    /// the original packet identifiers (MQTT-2.3.1-3).
    fn replay(&self) -> Result<()> {
        let mut entries = self
            .config
            .persistence
            .entries()
            .map_err(ClientError::Persistence)?;
        entries.retain(|(key, _)| key & LOCAL_KEY_FLAG != 0);
        entries.sort_unstable_by_key(|(key, _)| *key);

        for (key, packet) in entries {
            if packet.is_empty() {
                continue;
            }
            let id = (key & 0xFFFF) as u16;
            match PacketType::try_from(packet[0] >> 4) {
                Ok(PacketType::Publish) => {
                    match (packet[0] >> 1) & 0b11 {
                        1 => self.at_least_once.restore(id),
                        2 => self.exactly_once.restore_sent(id),
                        _ => {}
                    }
                    let mut dup = packet.to_vec();
                    dup[0] |= DUP_FLAG;
                    debug!("replaying publish {id:#06x}");
                    self.write(&dup)?;
                }
                Ok(PacketType::Pubrel) => {
                    self.exactly_once.restore_released(id);
                    debug!("replaying publish release {id:#06x}");
                    self.write(&packet)?;
                }
                Ok(PacketType::Subscribe) | Ok(PacketType::Unsubscribe) => {
                    debug!("replaying subscription request");
                    self.write(&packet)?;
                }
                _ => warn!("skipping unrecognized session record under key {key:#x}"),
            }
        }
        Ok(())
    }

    /// Read one packet and dispatch it.
    fn next_packet(&self, r: &mut PacketReader, body: &mut Vec<u8>) -> Result<()> {
        let first = self.read_byte(r)?;
        let remaining = self.read_remaining_length(r)?;

        if remaining > self.config.in_size_limit {
            return self.drop_oversized(r, first, remaining);
        }

        body.clear();
        body.resize(remaining, 0);
        self.read_full(r, body)?;
        self.inbound(decode_packet(first, body)?)
    }

    fn read_byte(&self, r: &mut PacketReader) -> Result<u8> {
        let mut byte = [0u8; 1];
        self.read_full(r, &mut byte)?;
        Ok(byte[0])
    }

    fn read_full(&self, r: &mut PacketReader, buf: &mut [u8]) -> Result<()> {
        let mut at = 0;
        while at < buf.len() {
            match r.read(&mut buf[at..]) {
                Ok(0) => {
                    return Err(ClientError::Transport(
                        io::ErrorKind::UnexpectedEof.into(),
                    ))
                }
                Ok(n) => at += n,
                Err(e) if retry_in_place(&e) => {
                    if self.closed() {
                        return Err(ClientError::Closed);
                    }
                    warn!("read retry in {:?} on {e}", self.config.retry_delay);
                    thread::sleep(self.config.retry_delay);
                }
                Err(e) => return Err(ClientError::Transport(e)),
            }
        }
        Ok(())
    }

    fn read_remaining_length(&self, r: &mut PacketReader) -> Result<usize> {
        let mut value = 0usize;
        for i in 0..4 {
            let byte = self.read_byte(r)?;
            value |= ((byte & 0x7F) as usize) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::RemainingLengthOverflow.into())
    }

    /// Drain a packet beyond the inbound size limit. Skipping a publish
    /// without acknowledgement violates MQTT-4.5.0-2; `ack_oversized` opts
    /// into confirming the delivery the receiver never saw.
    fn drop_oversized(&self, r: &mut PacketReader, first: u8, remaining: usize) -> Result<()> {
        warn!(
            "skipping {remaining} B inbound packet content; limit is {} B",
            self.config.in_size_limit
        );
        let mut left = remaining;
        let mut confirm: Option<(QoS, u16)> = None;

        if self.config.ack_oversized && first >> 4 == PacketType::Publish as u8 {
            let qos = QoS::try_from((first >> 1) & 0b11)?;
            if qos != QoS::AtMostOnce && remaining >= 4 {
                let mut head = [0u8; 2];
                self.read_full(r, &mut head)?;
                left -= 2;
                let topic_len = u16::from_be_bytes(head) as usize;
                if topic_len + 2 <= left {
                    self.discard(r, topic_len)?;
                    left -= topic_len;
                    let mut id = [0u8; 2];
                    self.read_full(r, &mut id)?;
                    left -= 2;
                    confirm = Some((qos, u16::from_be_bytes(id)));
                }
            }
        }

        self.discard(r, left)?;

        if let Some((qos, id)) = confirm {
            let mut packet = Vec::with_capacity(4);
            let ack_type = match qos {
                QoS::AtLeastOnce => PacketType::Puback,
                _ => PacketType::Pubrec,
            };
            encode_ack(ack_type, id, &mut packet);
            self.write(&packet)?;
        }
        Ok(())
    }

    fn discard(&self, r: &mut PacketReader, mut n: usize) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while n > 0 {
            let take = n.min(scratch.len());
            self.read_full(r, &mut scratch[..take])?;
            n -= take;
        }
        Ok(())
    }

    /// Dispatch one inbound packet to its pipeline or rendezvous.
    fn inbound(&self, packet: Packet<'_>) -> Result<()> {
        match packet {
            Packet::Publish {
                qos,
                topic,
                packet_id,
                payload,
                ..
            } => self.inbound_publish(qos, topic, packet_id, payload),

            // second round trip of an exactly-once reception
            Packet::Pubrel { packet_id } => self.inbound_release(packet_id),

            Packet::Puback { packet_id } => {
                self.at_least_once.free(packet_id)?;
                self.config
                    .persistence
                    .delete(LOCAL_KEY_FLAG | packet_id as u32)
                    .map_err(ClientError::Persistence)?;
                Ok(())
            }

            Packet::Pubrec { packet_id } => {
                self.exactly_once.release(packet_id)?;
                let mut release = Vec::with_capacity(4);
                encode_ack(PacketType::Pubrel, packet_id, &mut release);
                // the PUBREL replaces the stored PUBLISH under the same key
                self.config
                    .persistence
                    .store(LOCAL_KEY_FLAG | packet_id as u32, &[&release])
                    .map_err(ClientError::Persistence)?;
                self.write(&release)
            }

            Packet::Pubcomp { packet_id } => {
                self.exactly_once.free(packet_id)?;
                self.config
                    .persistence
                    .delete(LOCAL_KEY_FLAG | packet_id as u32)
                    .map_err(ClientError::Persistence)?;
                Ok(())
            }

            Packet::Suback {
                packet_id,
                return_codes,
            } => {
                self.check_subscription_id(packet_id)?;
                if let Ok(ack) = self.sub_slot.1.try_recv() {
                    let _ = ack.send(return_codes.to_vec());
                } // else: tolerate a redundant acknowledgement
                Ok(())
            }

            Packet::Unsuback { packet_id } => {
                self.check_subscription_id(packet_id)?;
                if let Ok(ack) = self.sub_slot.1.try_recv() {
                    let _ = ack.send(Vec::new());
                }
                Ok(())
            }

            Packet::Pingresp => {
                if let Ok(ack) = self.ping_slot.1.try_recv() {
                    let _ = ack.send(());
                } // else: tolerate an unsolicited ping response
                Ok(())
            }
        }
    }

    fn check_subscription_id(&self, packet_id: u16) -> Result<()> {
        if packet_id != SUBSCRIPTION_PACKET_ID {
            return Err(ProtocolError::PacketIdMismatch {
                got: packet_id,
                want: SUBSCRIPTION_PACKET_ID,
            }
            .into());
        }
        self.config
            .persistence
            .delete(LOCAL_KEY_FLAG | SUBSCRIPTION_PACKET_ID as u32)
            .map_err(ClientError::Persistence)
    }

    fn inbound_publish(
        &self,
        qos: QoS,
        topic: &str,
        packet_id: Option<u16>,
        payload: &[u8],
    ) -> Result<()> {
        match (qos, packet_id) {
            (QoS::AtMostOnce, _) => {
                self.config.receiver.on_message(topic, payload);
                Ok(())
            }
            (QoS::AtLeastOnce, Some(id)) => {
                if self.config.receiver.on_at_least_once(topic, payload) {
                    let mut ack = Vec::with_capacity(4);
                    encode_ack(PacketType::Puback, id, &mut ack);
                    self.write(&ack)?;
                }
                // a withheld acknowledgement invites redelivery
                Ok(())
            }
            (QoS::ExactlyOnce, Some(id)) => {
                let stage = self
                    .config
                    .persistence
                    .store(id as u32, &[topic.as_bytes(), &[0], payload]);
                if let Err(e) = stage {
                    // no PUBREC either; the server redelivers
                    error!("persistence malfunction: {e}");
                    return Ok(());
                }
                let mut ack = Vec::with_capacity(4);
                encode_ack(PacketType::Pubrec, id, &mut ack);
                self.write(&ack)
            }
            _ => Ok(()),
        }
    }

    fn inbound_release(&self, packet_id: u16) -> Result<()> {
        match self.config.persistence.load(packet_id as u32) {
            Err(e) => {
                error!("persistence malfunction: {e}");
                return Ok(()); // don't confirm
            }
            Ok(Some(record)) => {
                if let Some(i) = record.iter().position(|&b| b == 0) {
                    match std::str::from_utf8(&record[..i]) {
                        Ok(topic) => {
                            if !self.config.receiver.on_exactly_once(topic, &record[i + 1..]) {
                                return Ok(()); // keep the record; don't confirm
                            }
                        }
                        Err(_) => warn!("corrupt staged record under {packet_id:#06x}"),
                    }
                }
                if let Err(e) = self.config.persistence.delete(packet_id as u32) {
                    error!("persistence malfunction: {e}");
                }
            }
            Ok(None) => {} // complete the exchange regardless
        }

        let mut ack = Vec::with_capacity(4);
        encode_ack(PacketType::Pubcomp, packet_id, &mut ack);
        self.write(&ack)
    }
}

/// Write as much as one call allows, starting `skip` bytes into the
/// concatenation of `buffers`.
fn write_from(conn: &mut Conn, buffers: &[&[u8]], skip: usize) -> io::Result<usize> {
    let mut to_skip = skip;
    let mut slices = Vec::with_capacity(buffers.len());
    for buffer in buffers {
        if to_skip >= buffer.len() {
            to_skip -= buffer.len();
            continue;
        }
        slices.push(IoSlice::new(&buffer[to_skip..]));
        to_skip = 0;
    }
    if slices.is_empty() {
        return Ok(0);
    }
    conn.write_vectored(&slices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn pipe() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (Box::new(client), server)
    }

    #[test]
    fn slot_roundtrip() {
        let slot = ConnSlot::new();
        let (conn, _keep) = pipe();
        slot.install(conn);

        let (conn, epoch) = slot.acquire().unwrap();
        slot.release(conn, epoch);
        assert!(slot.take_now().is_some());
    }

    #[test]
    fn slot_drops_superseded_connection() {
        let slot = ConnSlot::new();
        let (old, _keep_old) = pipe();
        slot.install(old);
        let (old, old_epoch) = slot.acquire().unwrap();

        let (fresh, _keep_fresh) = pipe();
        slot.install(fresh);

        // the stale release must not clobber the replacement
        slot.release(old, old_epoch);
        let (_conn, epoch) = slot.acquire().unwrap();
        assert_eq!(epoch, 2);
    }

    #[test]
    fn slot_close_fails_acquire() {
        let slot = ConnSlot::new();
        slot.close();
        assert!(matches!(slot.acquire(), Err(ClientError::Closed)));
    }

    #[test]
    fn write_from_trims_across_buffers() {
        let (mut conn, mut server) = pipe();
        let n = write_from(&mut conn, &[b"abc", b"def"], 4).unwrap();
        assert_eq!(n, 2);
        let mut got = [0u8; 2];
        server.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"ef");
    }
}
