use crate::config::{ConnectionOptions, EffectiveConnectionConfig, SocketConfig};
use crate::crypto::Crypto;
use crate::estimators::{RttEstimator, WindowEstimator};
use crate::handshake::{Handshake, Role};
use crate::packet::{Packet, PacketType};
use crate::packet_id::PacketId;
use crate::path::PathValidator;
use crate::probe::Probe;
use crate::receiver::Receiver;
use crate::retrier::Retrier;
use crate::scheduler::{Scheduler, Timeout};
use crate::sender::Sender;
use crate::socket::{AcceptCallback, ConnectionHandle};
use crate::statistics::{ConnectionStatistics, LifecycleCounter, Statistics};
use crate::transport::Transport;
use crate::util::lock;
use anyhow::bail;
use bytes::{BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Why a connection was closed. Delivered exactly once per connection to its close callback.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseEvent {
    /// both sides closed gracefully
    Closed,
    /// a reliable packet (data, probe or handshake) was not acknowledged after the maximum
    ///  number of attempts
    Timeout,
    /// the listener did not accept the incoming connection
    NotAccepted,
}

/// States only move forward
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ConnectionState {
    Uninitialized,
    Handshaking,
    Open,
    Closing,
    Closed,
    Finished,
}

pub type ReceiveCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(CloseEvent) + Send + Sync>;
pub type FinishCallback = Box<dyn Fn(&Connection) + Send + Sync>;

/// The application's callbacks for a connection. They are replaced as a whole, never modified
///  in place, so a reader always sees a consistent pair.
#[derive(Clone, Default)]
pub struct UserHooks {
    pub on_receive: Option<ReceiveCallback>,
    pub on_close: Option<CloseCallback>,
}

pub struct ConnectionParams {
    pub local_short_id: u16,
    pub long_id: u128,
    pub role: Role,
    pub remote_addr: SocketAddr,
    pub options: ConnectionOptions,
    pub socket_config: Arc<SocketConfig>,
    pub scheduler: Arc<Scheduler>,
    pub transport: Arc<dyn Transport>,
    pub hooks: UserHooks,
    /// called once when the handshake of an incoming connection completes
    pub on_accept: Option<AcceptCallback>,
    /// called once when the connection is finished and can be forgotten
    pub on_finish: Option<FinishCallback>,
    pub lifecycle: Option<Arc<LifecycleCounter>>,
}

/// One connection's protocol engine. It owns handshake, sender, retrier, receiver, probe and
///  path validation, and is the single dispatch point for incoming packets.
///
/// Components do not keep references to each other. They get the connection passed in for
///  every call, and timer callbacks hold a `Weak<Connection>`.
pub struct Connection {
    local_short_id: u16,
    long_id: u128,
    /// 0 until the handshake told us the peer's id
    remote_short_id: AtomicU16,
    remote_addr: Mutex<SocketAddr>,
    state: AtomicU8,
    closed: AtomicBool,
    accepted: AtomicBool,

    config: Mutex<EffectiveConnectionConfig>,
    pub(crate) socket_config: Arc<SocketConfig>,
    scheduler: Arc<Scheduler>,
    transport: Arc<dyn Transport>,
    crypto: Option<Arc<dyn Crypto>>,

    hooks: Mutex<UserHooks>,
    on_accept: Mutex<Option<AcceptCallback>>,
    on_finish: Mutex<Option<FinishCallback>>,
    lifecycle: Option<Arc<LifecycleCounter>>,

    pub(crate) statistics: ConnectionStatistics,
    pub(crate) rtt: Mutex<RttEstimator>,
    pub(crate) window: Mutex<WindowEstimator>,

    pub(crate) handshake: Handshake,
    pub(crate) sender: Sender,
    pub(crate) retrier: Retrier,
    pub(crate) receiver: Receiver,
    pub(crate) probe: Probe,
    pub(crate) path: PathValidator,
    finish_timeout: Timeout,
}

impl Debug for Connection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "CONN{{{}->{}@{:?}:{:?}}}", self.local_short_id, self.remote_short_id(), self.remote_addr(), self.state())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(lifecycle) = &self.lifecycle {
            lifecycle.on_dropped();
        }
    }
}

impl Connection {
    pub fn new(params: ConnectionParams) -> Arc<Connection> {
        let config = params.socket_config.effective_connection_config(&params.options);
        let initial_packet_id = PacketId::from_raw(rand::random());
        let packet_capacity = params.socket_config.max_packet_payload();
        let scheduler = params.scheduler;

        if let Some(lifecycle) = &params.lifecycle {
            lifecycle.on_created();
        }

        Arc::new_cyclic(|weak| {
            let finish_weak = weak.clone();
            Connection {
                local_short_id: params.local_short_id,
                long_id: params.long_id,
                remote_short_id: AtomicU16::new(0),
                remote_addr: Mutex::new(params.remote_addr),
                state: AtomicU8::new(ConnectionState::Uninitialized.into()),
                closed: AtomicBool::new(false),
                accepted: AtomicBool::new(false),
                config: Mutex::new(config),
                crypto: params.socket_config.crypto.clone(),
                rtt: Mutex::new(RttEstimator::new(params.socket_config.initial_rtt, params.socket_config.max_rtt)),
                window: Mutex::new(WindowEstimator::new(params.socket_config.initial_window, params.socket_config.max_window)),
                socket_config: params.socket_config,
                transport: params.transport,
                hooks: Mutex::new(params.hooks),
                on_accept: Mutex::new(params.on_accept),
                on_finish: Mutex::new(params.on_finish),
                lifecycle: params.lifecycle,
                statistics: ConnectionStatistics::default(),
                handshake: Handshake::new(params.role),
                sender: Sender::new(&scheduler, weak.clone(), &config, packet_capacity, initial_packet_id),
                retrier: Retrier::new(&scheduler, weak.clone()),
                receiver: Receiver::new(SocketConfig::MAX_WINDOW_LIMIT as u16),
                probe: Probe::new(&scheduler, weak.clone(), config.probe_interval),
                path: PathValidator::new(),
                finish_timeout: scheduler.allocate(move |_| {
                    if let Some(conn) = finish_weak.upgrade() {
                        conn.finish();
                    }
                }),
                scheduler,
            }
        })
    }

    pub fn local_short_id(&self) -> u16 {
        self.local_short_id
    }

    pub fn long_id(&self) -> u128 {
        self.long_id
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            short_id: self.local_short_id,
            long_id: self.long_id,
        }
    }

    pub fn remote_short_id(&self) -> u16 {
        self.remote_short_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_remote_short_id(&self, remote_short_id: u16) {
        self.remote_short_id.store(remote_short_id, Ordering::Release);
    }

    pub fn remote_addr(&self) -> SocketAddr {
        *lock(&self.remote_addr)
    }

    pub(crate) fn set_remote_addr(&self, remote_addr: SocketAddr) {
        *lock(&self.remote_addr) = remote_addr;
    }

    pub fn role(&self) -> Role {
        self.handshake.role()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::try_from(self.state.load(Ordering::Acquire))
            .unwrap_or(ConnectionState::Finished)
    }

    fn advance_state(&self, new_state: ConnectionState) {
        self.state.fetch_max(new_state.into(), Ordering::AcqRel);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics.snapshot()
    }

    pub fn effective_config(&self) -> EffectiveConnectionConfig {
        *lock(&self.config)
    }

    /// adopts the probe interval and max attempts both sides agreed on during the handshake
    pub(crate) fn set_negotiated(&self, probe_interval: Duration, max_attempts: u32) {
        {
            let mut config = lock(&self.config);
            config.probe_interval = probe_interval;
            config.max_attempts = max_attempts;
        }
        self.probe.set_interval(probe_interval);
    }

    pub fn retry_delay(&self) -> Duration {
        lock(&self.rtt).retry_delay(self.socket_config.delayed_ack_allowance)
    }

    pub fn current_rtt(&self) -> Duration {
        lock(&self.rtt).current()
    }

    pub fn window_size(&self) -> usize {
        lock(&self.window).current() as usize
    }

    /// Starts the handshake (as initiator) or waits for it (as responder), and arms the probe
    pub fn open(&self, now: Instant) {
        if self.state() != ConnectionState::Uninitialized {
            return;
        }
        self.advance_state(ConnectionState::Handshaking);
        self.probe.open(now);
        self.handshake.start(self, now);
    }

    /// Entry point for a packet received from the network, still protected if crypto is
    ///  configured
    pub fn receive(&self, mut packet: Packet, from: SocketAddr, now: Instant) {
        if self.state() == ConnectionState::Finished {
            trace!("connection {} is finished - dropping {:?}", self.local_short_id, packet.header);
            return;
        }
        let wire_len = packet.serialized_len();

        if let Some(crypto) = &self.crypto {
            if !crypto.on_receive(&mut packet) {
                warn!("connection {}: packet {:?} from {:?} failed decryption - dropping", self.local_short_id, packet.header, from);
                return;
            }
        }
        self.statistics.on_packet_received(wire_len);
        self.dispatch(packet, from, now);
    }

    /// Handshake sees packets first, since the other components rely on the ids it establishes
    fn dispatch(&self, packet: Packet, from: SocketAddr, now: Instant) {
        if self.handshake.on_packet(self, &packet, from, now) {
            self.probe.on_activity(now);
            return;
        }
        if !self.handshake.is_complete() {
            debug!("connection {}: handshake is not complete - dropping {:?}", self.local_short_id, packet.header);
            return;
        }

        if packet.packet_type() == PacketType::PathResponse {
            self.path.on_response(self, &packet, from);
            return;
        }
        if from != self.remote_addr() {
            self.path.on_foreign_address(self, from, now);
        }

        self.probe.on_activity(now);
        self.sender.on_packet(self, &packet, now);
        self.receiver.on_packet(self, &packet, from, now);
    }

    pub fn send(&self, data: &[u8], reliable: bool) -> anyhow::Result<()> {
        if self.is_closed() || self.state() >= ConnectionState::Closing {
            bail!("connection {} is closed", self.local_short_id);
        }
        if let Some(crypto) = &self.crypto {
            if !crypto.can_send() {
                bail!("connection {}: no crypto session established", self.local_short_id);
            }
        }

        let now = self.scheduler.now();
        self.sender.send(self, data, reliable, now)?;
        self.probe.on_activity(now);
        Ok(())
    }

    /// Graceful close initiated by the application: stops reading and writing, and finishes
    ///  once everything in flight was acknowledged and the peer closed as well
    pub fn shutdown(&self, now: Instant) {
        if self.state() >= ConnectionState::Closing {
            return;
        }
        debug!("connection {}: shutting down", self.local_short_id);
        self.advance_state(ConnectionState::Closing);
        self.receiver.close(self, now);
        self.sender.close(self, now);
        self.check_finish();
    }

    /// Calls the close callback (exactly once, whatever triggered the close) and schedules the
    ///  connection to be finished after a grace period. Until then, retransmissions and acks
    ///  still flow.
    pub fn close(&self, event: CloseEvent) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("connection {} to {:?} closed: {:?}", self.local_short_id, self.remote_addr(), event);
        self.advance_state(ConnectionState::Closed);
        self.probe.close();

        let on_close = lock(&self.hooks).on_close.clone();
        if let Some(on_close) = on_close {
            on_close(event);
        }

        let grace = self.current_rtt() * self.socket_config.close_grace_rtt_factor;
        self.finish_timeout.schedule(self.scheduler.now() + grace);
    }

    /// Hard failure: everything in flight is discarded without any closing handshake
    pub fn fail(&self, event: CloseEvent) {
        debug!("connection {} failed: {:?}", self.local_short_id, event);
        self.sender.fail(self);
        self.receiver.fail();
        self.probe.close();
        self.close(event);
    }

    /// closes the connection once both directions are done
    pub(crate) fn check_finish(&self) {
        if self.is_closed() {
            return;
        }
        if self.sender.is_write_done(self) && self.receiver.is_read_done() {
            self.close(CloseEvent::Closed);
        }
    }

    fn finish(&self) {
        if self.state() == ConnectionState::Finished {
            return;
        }
        debug!("connection {} finished", self.local_short_id);
        self.advance_state(ConnectionState::Finished);

        self.sender.cancel_timers();
        self.retrier.clear();
        self.retrier.cancel_timer();
        self.probe.close();
        self.finish_timeout.cancel();

        *lock(&self.hooks) = UserHooks::default();
        lock(&self.on_accept).take();
        let on_finish = lock(&self.on_finish).take();
        if let Some(on_finish) = on_finish {
            on_finish(self);
        }
    }

    /// Sends a packet on a given path, stamping the peer's short id and applying crypto. While
    ///  the peer's short id is unknown, the long id is put in front of the payload for routing.
    pub(crate) fn transmit(&self, packet: &Packet, to: SocketAddr) {
        let mut packet = packet.clone();
        packet.header.short_id = self.remote_short_id();

        if let Some(crypto) = &self.crypto {
            if !crypto.on_send(&mut packet) {
                debug!("connection {}: crypto discarded {:?}", self.local_short_id, packet.header);
                return;
            }
        }

        let mut buf = BytesMut::with_capacity(packet.serialized_len() + size_of::<u128>());
        packet.header.ser(&mut buf);
        if packet.header.short_id == 0 {
            buf.put_u128(self.long_id);
        }
        buf.put_slice(packet.payload());

        trace!("connection {}: sending {:?} to {:?}", self.local_short_id, packet, to);
        self.statistics.on_packet_sent(buf.len());
        self.transport.send(to, buf.freeze());
    }

    pub(crate) fn on_handshake_complete(&self, first_expected: PacketId, now: Instant) {
        info!("connection {} to {:?} established (peer id {})", self.local_short_id, self.remote_addr(), self.remote_short_id());

        if self.role() == Role::Responder {
            let on_accept = lock(&self.on_accept).take();
            if let Some(on_accept) = on_accept {
                on_accept(self.handle());
            }
        }

        self.receiver.open(first_expected);
        self.sender.open(self, now);
        self.advance_state(ConnectionState::Open);

        if self.role() == Role::Responder && !self.accepted.load(Ordering::Acquire) {
            debug!("connection {} was not accepted", self.local_short_id);
            self.shutdown(now);
            self.close(CloseEvent::NotAccepted);
        }
    }

    /// Installs the application's callbacks for an incoming connection. A close callback that
    ///  is not given here stays the listener's.
    pub fn accept(&self, hooks: UserHooks) {
        {
            let mut current = lock(&self.hooks);
            let on_close = hooks.on_close.or_else(|| current.on_close.clone());
            *current = UserHooks {
                on_receive: hooks.on_receive,
                on_close,
            };
        }
        self.accepted.store(true, Ordering::Release);
    }

    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }

    pub(crate) fn deliver(&self, data: &[u8]) {
        let on_receive = lock(&self.hooks).on_receive.clone();
        match on_receive {
            Some(on_receive) => on_receive(data),
            None => debug!("connection {}: no receive callback - dropping {} bytes", self.local_short_id, data.len()),
        }
    }

    pub(crate) fn on_close_read(&self) {
        self.sender.on_close_read();
        self.check_finish();
    }
}
