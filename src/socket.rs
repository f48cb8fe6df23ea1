use crate::config::{ConnectionOptions, SocketConfig};
use crate::connection::{CloseCallback, CloseEvent, Connection, ConnectionParams, ReceiveCallback, UserHooks};
use crate::handshake::Role;
use crate::packet::{Packet, PacketHeader, PacketType};
use crate::scheduler::Scheduler;
use crate::statistics::{LifecycleCounter, Statistics};
use crate::transport::Transport;
use crate::util::lock;
use anyhow::{anyhow, bail};
use bytes::{Buf, BytesMut};
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

/// Identifies a connection towards the application. The long id guards against a short id
///  that was reused by a newer connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle {
    pub short_id: u16,
    pub long_id: u128,
}

/// Called when the handshake of an incoming connection completed. The application accepts the
///  connection by calling [Socket::accept] from inside the callback; otherwise the connection
///  is closed with [CloseEvent::NotAccepted].
pub type AcceptCallback = Arc<dyn Fn(ConnectionHandle) + Send + Sync>;

/// Close callback for incoming connections that do not register a close callback of their own
pub type ListenerCloseCallback = Arc<dyn Fn(ConnectionHandle, CloseEvent) + Send + Sync>;

struct Listener {
    on_accept: AcceptCallback,
    on_close: ListenerCloseCallback,
}

#[derive(Default)]
struct ConnectionTables {
    by_short_id: FxHashMap<u16, Arc<Connection>>,
    by_long_id: FxHashMap<u128, u16>,
    listener: Option<Listener>,
}

impl ConnectionTables {
    const NUM_RANDOM_SHORT_ID_ATTEMPTS: usize = 32;

    /// a random unused short id, falling back to a scan when the table is (nearly) full
    fn unused_short_id(&self) -> anyhow::Result<u16> {
        for _ in 0..Self::NUM_RANDOM_SHORT_ID_ATTEMPTS {
            let candidate = rand::random::<u16>();
            if candidate != 0 && !self.by_short_id.contains_key(&candidate) {
                return Ok(candidate);
            }
        }

        (1..=u16::MAX)
            .find(|candidate| !self.by_short_id.contains_key(candidate))
            .ok_or_else(|| anyhow!("all {} short connection ids are in use", u16::MAX))
    }

    fn unused_long_id(&self) -> u128 {
        loop {
            let candidate = Uuid::new_v4().as_u128();
            if !self.by_long_id.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    fn get(&self, handle: ConnectionHandle) -> Option<Arc<Connection>> {
        self.by_short_id.get(&handle.short_id)
            .filter(|conn| conn.long_id() == handle.long_id)
            .cloned()
    }

    fn get_by_long_id(&self, long_id: u128) -> Option<Arc<Connection>> {
        self.by_long_id.get(&long_id)
            .and_then(|short_id| self.by_short_id.get(short_id))
            .cloned()
    }

    fn insert(&mut self, conn: Arc<Connection>) {
        self.by_long_id.insert(conn.long_id(), conn.local_short_id());
        self.by_short_id.insert(conn.local_short_id(), conn);
    }
}

struct SocketCore {
    config: Arc<SocketConfig>,
    transport: Arc<dyn Transport>,
    scheduler: Arc<Scheduler>,
    tables: Mutex<ConnectionTables>,
    num_connections: watch::Sender<usize>,
    lifecycle: Option<Arc<LifecycleCounter>>,
}

/// A local endpoint multiplexing any number of connections over one transport. Incoming
///  datagrams are routed by short connection id, or by long connection id while a handshake is
///  in progress.
#[derive(Clone)]
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    pub fn new(config: SocketConfig, transport: Arc<dyn Transport>, scheduler: Arc<Scheduler>) -> anyhow::Result<Socket> {
        Self::create(config, transport, scheduler, None)
    }

    /// registers every connection of this socket with a lifecycle counter, for leak detection
    ///  in tests
    pub fn new_with_lifecycle_counter(config: SocketConfig, transport: Arc<dyn Transport>, scheduler: Arc<Scheduler>, lifecycle: Arc<LifecycleCounter>) -> anyhow::Result<Socket> {
        Self::create(config, transport, scheduler, Some(lifecycle))
    }

    fn create(config: SocketConfig, transport: Arc<dyn Transport>, scheduler: Arc<Scheduler>, lifecycle: Option<Arc<LifecycleCounter>>) -> anyhow::Result<Socket> {
        config.validate()?;
        info!("creating socket on {:?}", transport.local_addr());

        Ok(Socket {
            core: Arc::new(SocketCore {
                config: Arc::new(config),
                transport,
                scheduler,
                tables: Default::default(),
                num_connections: watch::Sender::new(0),
                lifecycle,
            }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.transport.local_addr()
    }

    pub fn config(&self) -> &SocketConfig {
        &self.core.config
    }

    /// Accepts incoming connections from now on. The accept callback is invoked when an incoming
    ///  handshake completes.
    pub fn listen(
        &self,
        on_accept: impl Fn(ConnectionHandle) + Send + Sync + 'static,
        on_close: impl Fn(ConnectionHandle, CloseEvent) + Send + Sync + 'static,
    ) {
        info!("socket {:?} is listening", self.local_addr());
        lock(&self.core.tables).listener = Some(Listener {
            on_accept: Arc::new(on_accept),
            on_close: Arc::new(on_close),
        });
    }

    pub fn connect(
        &self,
        remote_addr: SocketAddr,
        options: ConnectionOptions,
        on_receive: impl Fn(&[u8]) + Send + Sync + 'static,
        on_close: impl Fn(CloseEvent) + Send + Sync + 'static,
    ) -> anyhow::Result<ConnectionHandle> {
        options.validate()?;

        let conn = {
            let mut tables = lock(&self.core.tables);
            let conn = self.new_connection(
                tables.unused_short_id()?,
                tables.unused_long_id(),
                Role::Initiator,
                remote_addr,
                options,
                UserHooks {
                    on_receive: Some(Arc::new(on_receive)),
                    on_close: Some(Arc::new(on_close)),
                },
                None,
            );
            tables.insert(conn.clone());
            self.publish_num_connections(&tables);
            conn
        };

        info!("connecting to {:?} as connection {}", remote_addr, conn.local_short_id());
        conn.open(self.core.scheduler.now());
        Ok(conn.handle())
    }

    #[allow(clippy::too_many_arguments)]
    fn new_connection(
        &self,
        local_short_id: u16,
        long_id: u128,
        role: Role,
        remote_addr: SocketAddr,
        options: ConnectionOptions,
        hooks: UserHooks,
        on_accept: Option<AcceptCallback>,
    ) -> Arc<Connection> {
        let socket: Weak<SocketCore> = Arc::downgrade(&self.core);
        Connection::new(ConnectionParams {
            local_short_id,
            long_id,
            role,
            remote_addr,
            options,
            socket_config: self.core.config.clone(),
            scheduler: self.core.scheduler.clone(),
            transport: self.core.transport.clone(),
            hooks,
            on_accept,
            on_finish: Some(Box::new(move |conn: &Connection| {
                if let Some(core) = socket.upgrade() {
                    Socket { core }.erase(conn);
                }
            })),
            lifecycle: self.core.lifecycle.clone(),
        })
    }

    /// Installs the application's callbacks for an incoming connection. This must be called
    ///  from inside the accept callback.
    pub fn accept(
        &self,
        handle: ConnectionHandle,
        on_receive: impl Fn(&[u8]) + Send + Sync + 'static,
        on_close: Option<CloseCallback>,
    ) -> anyhow::Result<()> {
        let conn = self.connection(handle)?;
        let on_receive: ReceiveCallback = Arc::new(on_receive);
        conn.accept(UserHooks {
            on_receive: Some(on_receive),
            on_close,
        });
        Ok(())
    }

    pub fn send(&self, handle: ConnectionHandle, data: &[u8], reliable: bool) -> anyhow::Result<()> {
        self.connection(handle)?
            .send(data, reliable)
    }

    /// graceful close
    pub fn close(&self, handle: ConnectionHandle) -> anyhow::Result<()> {
        self.connection(handle)?
            .shutdown(self.core.scheduler.now());
        Ok(())
    }

    pub fn statistics(&self, handle: ConnectionHandle) -> anyhow::Result<Statistics> {
        Ok(self.connection(handle)?.statistics())
    }

    pub fn connection(&self, handle: ConnectionHandle) -> anyhow::Result<Arc<Connection>> {
        lock(&self.core.tables).get(handle)
            .ok_or_else(|| anyhow!("no connection for {:?}", handle))
    }

    pub fn num_connections(&self) -> usize {
        lock(&self.core.tables).by_short_id.len()
    }

    /// starts a graceful close of every connection
    pub fn close_all(&self) {
        let connections = lock(&self.core.tables).by_short_id.values()
            .cloned()
            .collect::<Vec<_>>();
        let now = self.core.scheduler.now();
        for conn in connections {
            conn.shutdown(now);
        }
    }

    /// waits until all connections are finished and removed
    pub async fn wait_until_idle(&self, timeout: Duration) -> anyhow::Result<()> {
        let mut num_connections = self.core.num_connections.subscribe();
        let result = match tokio::time::timeout(timeout, num_connections.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => bail!("socket was dropped"),
            Err(_) => bail!("{} connections still open after {:?}", self.num_connections(), timeout),
        };
        result
    }

    fn publish_num_connections(&self, tables: &ConnectionTables) {
        self.core.num_connections.send_replace(tables.by_short_id.len());
    }

    fn erase(&self, conn: &Connection) {
        let mut tables = lock(&self.core.tables);
        let is_registered = tables.by_short_id.get(&conn.local_short_id())
            .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), conn));
        if !is_registered {
            return;
        }

        debug!("removing connection {} from socket tables", conn.local_short_id());
        tables.by_short_id.remove(&conn.local_short_id());
        if tables.by_long_id.get(&conn.long_id()) == Some(&conn.local_short_id()) {
            tables.by_long_id.remove(&conn.long_id());
        }
        self.publish_num_connections(&tables);
    }

    /// Routes a datagram to its connection, creating a connection for a fresh H0 if the socket
    ///  is listening
    pub fn on_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let now = self.core.scheduler.now();
        let mut buf = datagram;

        let header = match PacketHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                debug!("received datagram with unparsable header from {:?} - dropping: {}", from, e);
                return;
            }
        };

        let conn = if header.short_id != 0 {
            match lock(&self.core.tables).by_short_id.get(&header.short_id).cloned() {
                Some(conn) => conn,
                None => {
                    debug!("no connection with short id {} - dropping {:?} from {:?}", header.short_id, header, from);
                    return;
                }
            }
        }
        else {
            let long_id = match buf.try_get_u128() {
                Ok(long_id) => long_id,
                Err(_) => {
                    debug!("datagram from {:?} without short id has no long id - dropping", from);
                    return;
                }
            };
            let existing = lock(&self.core.tables).get_by_long_id(long_id);
            match existing {
                Some(conn) => conn,
                None => match self.on_new_handshake(header, long_id, buf, from) {
                    Some(conn) => conn,
                    None => return,
                },
            }
        };

        conn.receive(Packet::from_parts(header, BytesMut::from(buf)), from, now);
    }

    fn is_initial_handshake(&self, header: PacketHeader, payload: &[u8]) -> bool {
        match &self.core.config.crypto {
            None => header.packet_type == PacketType::H0,
            Some(crypto) => {
                if header.packet_type != PacketType::EncryptedHandshake {
                    return false;
                }
                let mut packet = Packet::from_parts(header, BytesMut::from(payload));
                crypto.on_receive(&mut packet) && packet.packet_type() == PacketType::H0
            }
        }
    }

    fn on_new_handshake(&self, header: PacketHeader, long_id: u128, payload: &[u8], from: SocketAddr) -> Option<Arc<Connection>> {
        if !self.is_initial_handshake(header, payload) {
            debug!("no connection with long id {} - dropping {:?} from {:?}", long_id, header, from);
            return None;
        }

        let conn = {
            let mut tables = lock(&self.core.tables);
            if let Some(existing) = tables.get_by_long_id(long_id) {
                return Some(existing);
            }
            let listener = match &tables.listener {
                Some(listener) => listener,
                None => {
                    debug!("socket is not listening - dropping H0 from {:?}", from);
                    return None;
                }
            };

            let short_id = match tables.unused_short_id() {
                Ok(short_id) => short_id,
                Err(e) => {
                    warn!("dropping H0 from {:?}: {}", from, e);
                    return None;
                }
            };
            let handle = ConnectionHandle { short_id, long_id };
            let listener_on_close = listener.on_close.clone();
            let on_close: CloseCallback = Arc::new(move |event| listener_on_close(handle, event));
            let on_accept = listener.on_accept.clone();

            let conn = self.new_connection(
                short_id,
                long_id,
                Role::Responder,
                from,
                ConnectionOptions::default(),
                UserHooks {
                    on_receive: None,
                    on_close: Some(on_close),
                },
                Some(on_accept),
            );
            tables.insert(conn.clone());
            self.publish_num_connections(&tables);
            conn
        };

        info!("incoming connection {} from {:?}", conn.local_short_id(), from);
        conn.open(self.core.scheduler.now());
        Some(conn)
    }

    /// Feeds datagrams from a UDP socket into [Socket::on_datagram] until the task is aborted
    pub async fn recv_loop(self, udp_socket: Arc<UdpSocket>) {
        info!("starting receive loop on {:?}", self.local_addr());

        let mut buf = vec![0u8; self.core.config.max_datagram_size];
        loop {
            let (num_read, from) = match udp_socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    error!("socket error: {}", e);
                    continue;
                }
            };

            let span = span!(Level::TRACE, "datagram_received", ?from);
            let _entered = span.enter();
            trace!("received {} bytes", num_read);
            self.on_datagram(&buf[..num_read], from);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_addr;
    use crate::transport::MockTransport;
    use bytes::{BufMut, Bytes};
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn mock_transport() -> MockTransport {
        let mut transport = MockTransport::new();
        transport.expect_local_addr()
            .return_const(test_addr(1));
        transport
    }

    fn socket_with(transport: MockTransport) -> Socket {
        Socket::new(SocketConfig::default(), Arc::new(transport), Scheduler::with_manual_clock(Instant::now())).unwrap()
    }

    fn handshake_datagram(packet_type: PacketType, packet_id: u16, long_id: u128) -> Vec<u8> {
        let mut buf = BytesMut::new();
        PacketHeader::new(0, packet_type, crate::packet_id::PacketId::from_raw(packet_id)).ser(&mut buf);
        buf.put_u128(long_id);
        buf.to_vec()
    }

    #[test]
    fn test_connect_sends_h0_with_long_id() {
        let sent = Arc::new(Mutex::new(Vec::<(SocketAddr, Bytes)>::new()));
        let mut transport = mock_transport();
        let captured = sent.clone();
        transport.expect_send()
            .times(1)
            .returning(move |to, packet| captured.lock().unwrap().push((to, packet)));

        let socket = socket_with(transport);
        let handle = socket.connect(test_addr(2), ConnectionOptions::default(), |_| {}, |_| {}).unwrap();
        assert_ne!(handle.short_id, 0);
        assert_eq!(socket.num_connections(), 1);

        let sent = sent.lock().unwrap();
        let (to, data) = &sent[0];
        assert_eq!(*to, test_addr(2));
        assert_eq!(data.len(), PacketHeader::SERIALIZED_LEN + size_of::<u128>());
        assert_eq!(&data[..4], &[PacketHeader::PROTOCOL_VERSION_1, 0, 0, b'0']);
        assert_eq!(&data[6..], &handle.long_id.to_be_bytes());
    }

    #[test]
    fn test_h0_creates_responder_when_listening() {
        let mut transport = mock_transport();
        transport.expect_send()
            .times(2)
            .withf(|to, packet| *to == test_addr(2)
                && packet[3] == b'1'
                && packet[4..6] == [0x12, 0x34]
                && packet[6..22] == 99u128.to_be_bytes())
            .return_const(());

        let socket = socket_with(transport);
        socket.listen(|_| {}, |_, _| {});
        socket.on_datagram(&handshake_datagram(PacketType::H0, 0x1234, 99), test_addr(2));
        assert_eq!(socket.num_connections(), 1);

        // a retransmitted H0 reaches the same connection, which answers with H1 again
        socket.on_datagram(&handshake_datagram(PacketType::H0, 0x1234, 99), test_addr(2));
        assert_eq!(socket.num_connections(), 1);
    }

    #[rstest]
    #[case::garbage(vec![1, 2, 3])]
    #[case::wrong_version(vec![9, 0, 0, b'0', 0, 1])]
    #[case::unknown_short_id(vec![1, 0, 7, b'R', 0, 1, b'D', 0, 0, 0, 0])]
    #[case::missing_long_id(vec![1, 0, 0, b'0', 0, 1])]
    #[case::unknown_long_id_no_h0(handshake_datagram(PacketType::H2, 1, 5))]
    fn test_undeliverable_datagrams_are_dropped(#[case] datagram: Vec<u8>) {
        let mut transport = mock_transport();
        transport.expect_send().never();

        let socket = socket_with(transport);
        socket.listen(|_| {}, |_, _| {});
        socket.on_datagram(&datagram, test_addr(2));
        assert_eq!(socket.num_connections(), 0);
    }

    #[test]
    fn test_h0_without_listener_is_dropped() {
        let mut transport = mock_transport();
        transport.expect_send().never();

        let socket = socket_with(transport);
        socket.on_datagram(&handshake_datagram(PacketType::H0, 1, 5), test_addr(2));
        assert_eq!(socket.num_connections(), 0);
    }

    fn session_params_datagram(packet_id: u16, long_id: u128, probe_interval_millis: u32) -> Vec<u8> {
        let mut buf = BytesMut::from(handshake_datagram(PacketType::H2, packet_id, long_id).as_slice());
        buf.put_u16(77);
        buf.put_u32(probe_interval_millis);
        buf.put_u32(3);
        buf.to_vec()
    }

    fn counting_transport(num_sent: &Arc<AtomicUsize>) -> MockTransport {
        let mut transport = mock_transport();
        let num_sent = num_sent.clone();
        transport.expect_send()
            .returning(move |_, _| { num_sent.fetch_add(1, Ordering::SeqCst); });
        transport
    }

    fn listen_accepting(socket: &Socket) {
        let accepting_socket = socket.clone();
        socket.listen(move |handle| { accepting_socket.accept(handle, |_| {}, None).unwrap(); }, |_, _| {});
    }

    #[rstest]
    #[case::zero(0)]
    #[case::below_tick(9)]
    fn test_h2_with_invalid_probe_interval_is_ignored(#[case] probe_interval_millis: u32) {
        let num_sent = Arc::new(AtomicUsize::new(0));
        let socket = socket_with(counting_transport(&num_sent));
        listen_accepting(&socket);

        socket.on_datagram(&handshake_datagram(PacketType::H0, 0x1234, 99), test_addr(2));
        socket.on_datagram(&session_params_datagram(0x1235, 99, probe_interval_millis), test_addr(2));
        assert_eq!(num_sent.load(Ordering::SeqCst), 1, "only H1 is sent");

        let conn = lock(&socket.core.tables).get_by_long_id(99).unwrap();
        assert!(!conn.handshake.is_complete());
        assert_eq!(conn.effective_config().probe_interval, ConnectionOptions::DEFAULT_PROBE_INTERVAL);

        for _ in 0..10 {
            socket.core.scheduler.advance(Scheduler::TICK);
        }
        assert_eq!(num_sent.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_h2_negotiates_small_probe_interval() {
        let num_sent = Arc::new(AtomicUsize::new(0));
        let socket = socket_with(counting_transport(&num_sent));
        listen_accepting(&socket);

        socket.on_datagram(&handshake_datagram(PacketType::H0, 0x1234, 99), test_addr(2));
        socket.on_datagram(&session_params_datagram(0x1235, 99, 10), test_addr(2));

        let conn = lock(&socket.core.tables).get_by_long_id(99).unwrap();
        assert!(conn.handshake.is_complete());
        assert_eq!(conn.effective_config().probe_interval, Duration::from_millis(10));
        assert_eq!(conn.effective_config().max_attempts, 3);

        // one probe per tick at most while the peer is silent, until retries are exhausted
        let sent_after_handshake = num_sent.load(Ordering::SeqCst);
        for _ in 0..5 {
            socket.core.scheduler.advance(Scheduler::TICK);
        }
        assert!(num_sent.load(Ordering::SeqCst) - sent_after_handshake <= 5);
    }

    #[test]
    fn test_short_ids_exhausted() {
        let mut transport = mock_transport();
        transport.expect_send()
            .times(1)
            .return_const(());
        let socket = socket_with(transport);
        listen_accepting(&socket);

        let handle = socket.connect(test_addr(2), ConnectionOptions::default(), |_| {}, |_| {}).unwrap();
        let conn = socket.connection(handle).unwrap();
        {
            let mut tables = lock(&socket.core.tables);
            for short_id in 1..=u16::MAX {
                tables.by_short_id.insert(short_id, conn.clone());
            }
        }

        assert!(socket.connect(test_addr(3), ConnectionOptions::default(), |_| {}, |_| {}).is_err());
        socket.on_datagram(&handshake_datagram(PacketType::H0, 1, 5), test_addr(3));
        assert!(lock(&socket.core.tables).get_by_long_id(5).is_none());

        lock(&socket.core.tables).by_short_id.remove(&4711);
        assert_eq!(lock(&socket.core.tables).unused_short_id().unwrap(), 4711);
    }

    #[test]
    fn test_unknown_handle() {
        let socket = socket_with(mock_transport());
        let handle = ConnectionHandle { short_id: 5, long_id: 5 };
        assert!(socket.send(handle, b"x", true).is_err());
        assert!(socket.close(handle).is_err());
        assert!(socket.statistics(handle).is_err());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = SocketConfig {
            max_datagram_size: 100,
            ..Default::default()
        };
        assert!(Socket::new(config, Arc::new(mock_transport()), Scheduler::with_manual_clock(Instant::now())).is_err());
    }

    #[tokio::test]
    async fn test_wait_until_idle() {
        let mut transport = mock_transport();
        transport.expect_send().return_const(());
        let socket = socket_with(transport);

        socket.wait_until_idle(Duration::from_millis(10)).await.unwrap();

        socket.connect(test_addr(2), ConnectionOptions::default(), |_| {}, |_| {}).unwrap();
        assert!(socket.wait_until_idle(Duration::from_millis(10)).await.is_err());
    }
}
