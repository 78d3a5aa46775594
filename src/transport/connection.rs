//! One remote endpoint.
//!
//! A `Connection` owns everything that is scoped to a single peer:
//!
//! - reliable and ordered resend queues
//! - the chunk buffer batching small unreliable packets
//! - the fragment reassembly table
//! - the window of recently handled inbound ids
//! - MTU discovery, ping window and send throttle
//! - [`ConnectionStats`]
//!
//! The application sends through [`Connection::send_packet`]. Everything else is driven by
//! the messenger's network thread, either from inbound control packets or from
//! [`Connection::heartbeat`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, error, info, instrument, trace, warn};

use crate::config::NetworkConfig;
use crate::core::buffer::{PacketReader, PacketWriter};
use crate::core::chunk::{self, ChunkBuffer};
use crate::core::fragment::{self, FragmentTable};
use crate::core::packet::{
    clear_delivery_bits, DeliveryMethod, OutboundPacket, PacketFlags, PacketHeader, PacketType,
    HEADER_SIZE,
};
use crate::error::constants;
use crate::error::{ProtocolError, Result};
use crate::protocol::flow_control::{
    MtuAction, MtuDiscovery, MtuState, PingWindow, SendThrottle, ThrottleChange,
};
use crate::protocol::reliability::{OrderedAck, OrderedQueue, ReliableQueue};
use crate::transport::messenger::MessengerEvent;
use crate::transport::socket::Transmitter;
use crate::utils::metrics::{ConnectionStats, StatsSnapshot};
use crate::utils::replay_cache::ReplayWindow;

/// How long a handled id stays in the duplicate window.
const DUPLICATE_TTL: Duration = Duration::from_secs(30);

/// Unanswered pings kept for matching late responses.
const MAX_PENDING_PINGS: usize = 16;

const MTU_PROBE: u8 = 0;
const MTU_REPLY: u8 = 1;

/// Bytes of an MTU test body before the padding.
const MTU_TEST_BODY: usize = 5;

#[derive(Debug)]
struct FlowState {
    pings: PingWindow,
    throttle: SendThrottle,
    pending_pings: BTreeMap<u32, Instant>,
    next_ping: u32,
    last_ping: Option<Instant>,
    last_work: Option<Instant>,
}

/// A live connection to one remote endpoint.
pub struct Connection {
    remote: SocketAddr,
    config: Arc<NetworkConfig>,
    tx: Arc<Transmitter>,
    events: flume::Sender<MessengerEvent>,
    closed: AtomicBool,
    created: Instant,
    last_received: Mutex<Instant>,
    reliable: ReliableQueue,
    ordered: OrderedQueue,
    chunks: Mutex<ChunkBuffer>,
    fragments: FragmentTable,
    /// Ids of everything sent to this peer, acks included
    next_id: AtomicU16,
    next_group: AtomicU16,
    handled: Mutex<ReplayWindow>,
    mtu: Mutex<MtuDiscovery>,
    flow: Mutex<FlowState>,
    stats: ConnectionStats,
}

impl Connection {
    pub(crate) fn new(
        remote: SocketAddr,
        config: Arc<NetworkConfig>,
        tx: Arc<Transmitter>,
        events: flume::Sender<MessengerEvent>,
    ) -> Self {
        let now = Instant::now();
        let mtu = MtuDiscovery::new(&config.transport);
        let flow = FlowState {
            pings: PingWindow::new(config.connection.ping_window),
            throttle: SendThrottle::new(&config.connection),
            pending_pings: BTreeMap::new(),
            next_ping: 0,
            last_ping: None,
            last_work: None,
        };
        Self {
            remote,
            tx,
            events,
            closed: AtomicBool::new(false),
            created: now,
            last_received: Mutex::new(now),
            reliable: ReliableQueue::new(),
            ordered: OrderedQueue::new(),
            chunks: Mutex::new(ChunkBuffer::new()),
            fragments: FragmentTable::new(),
            next_id: AtomicU16::new(0),
            next_group: AtomicU16::new(0),
            handled: Mutex::new(ReplayWindow::with_settings(
                DUPLICATE_TTL,
                config.connection.duplicate_window,
            )),
            stats: ConnectionStats::new(mtu.effective_mtu()),
            mtu: Mutex::new(mtu),
            flow: Mutex::new(flow),
            config,
        }
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    /// Time since the connection was established.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Usable MTU right now. Grows while discovery is in progress.
    pub fn mtu(&self) -> usize {
        self.mtu.lock().effective_mtu()
    }

    pub fn mtu_state(&self) -> MtuState {
        self.mtu.lock().state()
    }

    /// Average round trip over the last full ping window.
    pub fn ping(&self) -> Duration {
        self.stats.average_ping()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reliable packets waiting for their ack.
    pub fn pending_reliable(&self) -> usize {
        self.reliable.len() + self.ordered.len()
    }

    /// Sends a packet to this peer.
    ///
    /// The packet is consumed. Unreliable packets not marked immediate wait in the chunk
    /// buffer until the next flush; packets larger than the MTU are fragmented.
    ///
    /// # Errors
    /// `ConnectionClosed` after a disconnect, `OversizedPacket` above the configured
    /// maximum, and transform failures.
    #[instrument(level = "trace", skip(self, packet), fields(peer = %self.remote))]
    pub fn send_packet(&self, packet: OutboundPacket) -> Result<()> {
        if !self.is_connected() {
            return Err(ProtocolError::ConnectionClosed);
        }
        let delivery = packet.delivery();
        let immediate = packet.is_immediate();
        let id = self.next_id();
        let datagram = self.tx.encode_as(id, packet)?;
        self.stats.logical_sent();

        let mtu = self.mtu();
        if datagram.len() > mtu {
            return self.send_fragmented(datagram, delivery, mtu);
        }
        self.route(id, datagram, delivery, immediate, Instant::now());
        Ok(())
    }

    /// Gracefully closes the connection and tells the peer why.
    ///
    /// Returns `false` if it was already closed.
    pub fn disconnect(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.flush_chunks();

        let mut packet = OutboundPacket::new(PacketType::Disconnected, DeliveryMethod::Unreliable);
        packet.write_string(reason);
        match self.tx.encode_as(self.next_id(), packet) {
            Ok(datagram) => self.transmit(&datagram),
            Err(e) => warn!(peer = %self.remote, error = %e, "Failed to encode disconnect"),
        }

        info!(peer = %self.remote, reason, "Disconnected");
        self.notify_disconnected(reason, false);
        true
    }

    // =================== Outbound ===================

    /// Next id on this connection. The peer's duplicate window sees one dense sequence,
    /// whatever else the messenger sends to other endpoints.
    fn next_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn send_ack(&self, acked: u16) {
        self.tx.send_ack(self.remote, self.next_id(), acked);
    }

    fn route(
        &self,
        id: u16,
        datagram: Vec<u8>,
        delivery: DeliveryMethod,
        immediate: bool,
        now: Instant,
    ) {
        match delivery {
            DeliveryMethod::Unreliable if immediate => self.transmit(&datagram),
            DeliveryMethod::Unreliable => self.enqueue_chunk(datagram, now),
            DeliveryMethod::Reliable => {
                let datagram: Arc<[u8]> = datagram.into();
                self.reliable.track(id, datagram.clone(), now);
                self.transmit(&datagram);
            }
            DeliveryMethod::ReliableOrdered => {
                let datagram: Arc<[u8]> = datagram.into();
                if self.ordered.push(id, datagram.clone(), now) {
                    self.transmit(&datagram);
                }
            }
        }
    }

    fn send_fragmented(
        &self,
        mut datagram: Vec<u8>,
        delivery: DeliveryMethod,
        mtu: usize,
    ) -> Result<()> {
        // the fragments carry delivery; the reassembled packet must not be acked again
        clear_delivery_bits(&mut datagram);
        let group = self.next_group.fetch_add(1, Ordering::Relaxed);
        let bodies = fragment::split(&datagram, group, mtu)?;

        // a lost fragment would lose the whole packet
        let outer = match delivery {
            DeliveryMethod::Unreliable => DeliveryMethod::Reliable,
            other => other,
        };
        let packet_type = PacketHeader::parse(&datagram)?.packet_type;
        debug!(
            peer = %self.remote,
            group,
            fragments = bodies.len(),
            size = datagram.len(),
            "Fragmenting packet"
        );

        let now = Instant::now();
        for body in bodies {
            let header = PacketHeader {
                id: self.next_id(),
                packet_type,
                flags: PacketFlags::for_delivery(outer) | PacketFlags::PARTIAL,
            };
            self.route(header.id, header.frame(&body), outer, true, now);
        }
        Ok(())
    }

    fn enqueue_chunk(&self, datagram: Vec<u8>, now: Instant) {
        let mtu = self.mtu();
        let full = {
            let mut chunks = self.chunks.lock();
            let full = if chunks.would_overflow(datagram.len(), mtu) {
                chunks.take()
            } else {
                Vec::new()
            };
            chunks.push(datagram, now);
            full
        };
        self.send_batch(full);
    }

    /// Sends everything waiting in the chunk buffer.
    pub(crate) fn flush_chunks(&self) {
        let pending = self.chunks.lock().take();
        self.send_batch(pending);
    }

    fn send_batch(&self, mut pending: Vec<Vec<u8>>) {
        match pending.len() {
            0 => {}
            1 => {
                if let Some(single) = pending.pop() {
                    self.transmit(&single);
                }
            }
            count => {
                trace!(peer = %self.remote, count, "Flushing chunk");
                let datagram = chunk::encode_chunk(self.next_id(), &pending);
                self.transmit(&datagram);
            }
        }
    }

    fn transmit(&self, datagram: &[u8]) {
        match self.tx.send(self.remote, datagram) {
            Ok(()) => self.stats.physical_sent(datagram.len()),
            Err(e) => error!(peer = %self.remote, error = %e, "Failed to send datagram"),
        }
    }

    fn send_control(&self, packet: OutboundPacket) {
        match self.tx.encode_as(self.next_id(), packet) {
            Ok(datagram) => self.transmit(&datagram),
            Err(e) => warn!(peer = %self.remote, error = %e, "Failed to encode control packet"),
        }
    }

    // =================== Inbound ===================

    pub(crate) fn mark_received(&self, now: Instant) {
        *self.last_received.lock() = now;
    }

    /// Records an inbound id. Returns `true` if it was handled before.
    pub(crate) fn is_duplicate(&self, id: u16, now: Instant) -> bool {
        self.handled.lock().check_and_insert(id, now)
    }

    pub(crate) fn accept_fragment(&self, body: &[u8], now: Instant) -> Result<Option<Vec<u8>>> {
        self.fragments.accept(body, now)
    }

    pub(crate) fn handle_ack(&self, id: u16, now: Instant) {
        if self.reliable.ack(id) {
            trace!(peer = %self.remote, id, "Reliable packet acked");
            return;
        }
        match self.ordered.ack(id, now) {
            OrderedAck::Released(Some(next)) => {
                trace!(peer = %self.remote, id, next = next.id, "Ordered head acked");
                self.transmit(&next.datagram);
            }
            OrderedAck::Released(None) | OrderedAck::NotHead => {}
            OrderedAck::Unknown => {
                // late acks for resent packets land here too
                debug!(peer = %self.remote, id, "{}", constants::WARN_UNKNOWN_ACK);
            }
        }
    }

    pub(crate) fn handle_ping_request(&self, seq: u32) {
        let mut response =
            OutboundPacket::new(PacketType::PingResponse, DeliveryMethod::Unreliable).immediate();
        response.write_u32(seq);
        self.send_control(response);
    }

    pub(crate) fn handle_ping_response(&self, seq: u32, now: Instant) {
        let mut flow = self.flow.lock();
        let Some(sent) = flow.pending_pings.remove(&seq) else {
            trace!(peer = %self.remote, seq, "Ping response without pending ping");
            return;
        };
        let rtt = now.saturating_duration_since(sent);
        self.stats.record_ping(rtt);

        let Some(avg) = flow.pings.record(rtt) else {
            return;
        };
        self.stats.set_average_ping(avg);
        match flow.throttle.on_window(avg, now) {
            ThrottleChange::Baseline(base) => {
                debug!(peer = %self.remote, base_ms = base.as_millis() as u64, "Base ping set")
            }
            ThrottleChange::Dropped | ThrottleChange::Restored => debug!(
                peer = %self.remote,
                send_rate = flow.throttle.send_rate(),
                "Send rate changed"
            ),
            ThrottleChange::Rebaselined(_) | ThrottleChange::None => {}
        }
    }

    /// Handles an `MtuTest` body: answers probes, feeds replies to discovery.
    pub(crate) fn handle_mtu_test(&self, reader: &mut PacketReader<'_>, now: Instant) -> Result<()> {
        let kind = reader.read_u8()?;
        let size = reader.read_u32()? as usize;
        match kind {
            MTU_PROBE => {
                trace!(peer = %self.remote, size, "Answering MTU probe");
                let mut reply =
                    OutboundPacket::new(PacketType::MtuTest, DeliveryMethod::Unreliable).immediate();
                reply.write_u8(MTU_REPLY);
                reply.write_u32(size as u32);
                self.send_control(reply);
            }
            MTU_REPLY => {
                let action = self.mtu.lock().on_reply(size, now);
                self.apply_mtu_action(action);
            }
            _ => return Err(ProtocolError::Custom(format!("unknown MTU test kind {kind}"))),
        }
        Ok(())
    }

    /// The peer said goodbye.
    pub(crate) fn close_remote(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(peer = %self.remote, reason, "Peer disconnected");
        self.notify_disconnected(reason, false);
    }

    fn notify_disconnected(&self, reason: &str, lost_connection: bool) {
        let _ = self.events.send(MessengerEvent::Disconnected {
            endpoint: self.remote,
            reason: reason.to_string(),
            lost_connection,
        });
    }

    // =================== Heartbeat ===================

    /// Periodic work, called from the network thread on every loop iteration.
    ///
    /// Timeout detection runs every call; resends, chunk flushes, pings and MTU probes are
    /// paced by the current send rate.
    pub(crate) fn heartbeat(&self, now: Instant) {
        if !self.is_connected() {
            return;
        }

        let silent = now.saturating_duration_since(*self.last_received.lock());
        if silent > self.config.connection.connection_timeout {
            if !self.closed.swap(true, Ordering::AcqRel) {
                warn!(
                    peer = %self.remote,
                    silent_ms = silent.as_millis() as u64,
                    "{}",
                    constants::ERR_CONNECTION_TIMEOUT
                );
                self.notify_disconnected(constants::ERR_CONNECTION_TIMEOUT, true);
            }
            return;
        }

        let (chunk_interval, ping_due) = {
            let mut flow = self.flow.lock();
            let interval = flow.throttle.send_interval();
            if flow
                .last_work
                .is_some_and(|last| now.saturating_duration_since(last) < interval)
            {
                return;
            }
            flow.last_work = Some(now);
            let ping_due = flow.last_ping.map_or(true, |last| {
                now.saturating_duration_since(last) >= self.config.connection.ping_interval
            });
            (flow.throttle.chunk_interval(), ping_due)
        };

        self.resend_overdue(now);

        if self.chunks.lock().is_due(now, chunk_interval) {
            self.flush_chunks();
        }

        if ping_due {
            self.send_ping(now);
        }

        self.drive_mtu(now);

        let purged = self
            .fragments
            .purge_stale(now, self.config.connection.connection_timeout);
        if purged > 0 {
            debug!(peer = %self.remote, purged, "Dropped stale fragment groups");
        }

        self.stats.tick(now);
    }

    fn ack_deadline(&self) -> Duration {
        self.config.connection.ack_await_delay + self.stats.average_ping()
    }

    fn resend_overdue(&self, now: Instant) {
        let deadline = self.ack_deadline();
        let mut resent = self.reliable.collect_overdue(now, deadline);
        resent.extend(self.ordered.overdue_head(now, deadline));
        if resent.is_empty() {
            return;
        }
        debug!(peer = %self.remote, count = resent.len(), "Resending unacked packets");
        self.stats.packets_lost(resent.len() as u64);
        for packet in &resent {
            self.transmit(&packet.datagram);
        }
    }

    fn send_ping(&self, now: Instant) {
        let seq = {
            let mut flow = self.flow.lock();
            let seq = flow.next_ping;
            flow.next_ping = seq.wrapping_add(1);
            flow.last_ping = Some(now);
            flow.pending_pings.insert(seq, now);
            while flow.pending_pings.len() > MAX_PENDING_PINGS {
                flow.pending_pings.pop_first();
            }
            seq
        };
        let mut ping =
            OutboundPacket::new(PacketType::PingRequest, DeliveryMethod::Unreliable).immediate();
        ping.write_u32(seq);
        self.send_control(ping);
    }

    fn drive_mtu(&self, now: Instant) {
        let retry_after = self.ack_deadline();
        let action = {
            let mut mtu = self.mtu.lock();
            match mtu.state() {
                MtuState::Unset => mtu.start(now),
                MtuState::Setting => mtu.poll(now, retry_after),
                MtuState::Set => MtuAction::Idle,
            }
        };
        self.apply_mtu_action(action);
    }

    fn apply_mtu_action(&self, action: MtuAction) {
        match action {
            MtuAction::Idle => {}
            MtuAction::Probe(size) => {
                if let Err(e) = self.tx.send(self.remote, &mtu_probe(self.next_id(), size)) {
                    debug!(peer = %self.remote, size, error = %e, "MTU probe failed to send");
                    let action = self.mtu.lock().on_send_failure();
                    self.apply_mtu_action(action);
                }
            }
            MtuAction::Settled(mtu) => {
                self.stats.set_mtu(mtu);
                info!(peer = %self.remote, mtu, "MTU set");
                let _ = self.events.send(MessengerEvent::MtuSet {
                    endpoint: self.remote,
                    mtu,
                });
            }
        }
    }
}

/// Builds an MTU probe datagram of exactly `size` bytes, padded with zeros.
///
/// Probes bypass the payload transforms: compressing the padding would defeat the probe.
pub(crate) fn mtu_probe(id: u16, size: usize) -> Vec<u8> {
    let header = PacketHeader {
        id,
        packet_type: PacketType::MtuTest,
        flags: PacketFlags::empty(),
    };
    let mut body = PacketWriter::with_capacity(size.saturating_sub(HEADER_SIZE));
    body.write_u8(MTU_PROBE);
    body.write_u32(size as u32);
    body.write_zeros(size.saturating_sub(HEADER_SIZE + MTU_TEST_BODY));
    header.frame(body.as_slice())
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("connected", &self.is_connected())
            .field("mtu", &self.mtu())
            .field("pending_reliable", &self.pending_reliable())
            .finish()
    }
}
