use crate::config::SocketConfig;
use crate::connection::CloseEvent;
use crate::scheduler::Scheduler;
use crate::socket::{ConnectionHandle, Socket};
use crate::statistics::LifecycleCounter;
use crate::transport::Transport;
use crate::util::lock;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// convenience for test code: the same number always yields the same address
pub fn test_addr(number: u16) -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, number))
}

#[derive(Debug, Clone)]
pub struct Datagram {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub data: Bytes,
}

impl Datagram {
    /// the raw packet type from the header, `None` if the datagram is too short
    pub fn packet_type(&self) -> Option<u8> {
        self.data.get(3).copied()
    }
}

type Outbox = Arc<Mutex<VecDeque<Datagram>>>;

/// Collects sent datagrams in an outbox shared by all transports of a [TestNetwork]
pub struct LoopbackTransport {
    local_addr: SocketAddr,
    outbox: Outbox,
}

impl Transport for LoopbackTransport {
    fn send(&self, to: SocketAddr, packet: Bytes) {
        lock(&self.outbox).push_back(Datagram {
            from: self.local_addr,
            to,
            data: packet,
        });
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

type DropFilter = Box<dyn FnMut(&Datagram) -> bool + Send>;

/// An in-memory network of sockets driven by a manual clock. Datagrams are delivered only when
///  the test calls [TestNetwork::deliver_all] or [TestNetwork::run_for], so tests control
///  timing and loss exactly.
pub struct TestNetwork {
    pub scheduler: Arc<Scheduler>,
    outbox: Outbox,
    sockets: Mutex<FxHashMap<SocketAddr, Socket>>,
    /// returns `true` for datagrams that are lost
    drop_filter: Mutex<Option<DropFilter>>,
    /// real address -> the address packets from it appear to come from
    aliases: Mutex<FxHashMap<SocketAddr, SocketAddr>>,
    delivered: Mutex<Vec<Datagram>>,
}

impl TestNetwork {
    pub fn new() -> TestNetwork {
        TestNetwork {
            scheduler: Scheduler::with_manual_clock(Instant::now()),
            outbox: Default::default(),
            sockets: Default::default(),
            drop_filter: Default::default(),
            aliases: Default::default(),
            delivered: Default::default(),
        }
    }

    pub fn socket(&self, number: u16, config: SocketConfig) -> Socket {
        self.create_socket(number, config, None)
    }

    pub fn socket_with_lifecycle_counter(&self, number: u16, config: SocketConfig, lifecycle: Arc<LifecycleCounter>) -> Socket {
        self.create_socket(number, config, Some(lifecycle))
    }

    fn create_socket(&self, number: u16, config: SocketConfig, lifecycle: Option<Arc<LifecycleCounter>>) -> Socket {
        let transport = Arc::new(LoopbackTransport {
            local_addr: test_addr(number),
            outbox: self.outbox.clone(),
        });
        let socket = match lifecycle {
            Some(lifecycle) => Socket::new_with_lifecycle_counter(config, transport, self.scheduler.clone(), lifecycle),
            None => Socket::new(config, transport, self.scheduler.clone()),
        }.unwrap();
        lock(&self.sockets).insert(test_addr(number), socket.clone());
        socket
    }

    pub fn set_drop_filter(&self, filter: impl FnMut(&Datagram) -> bool + Send + 'static) {
        *lock(&self.drop_filter) = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        *lock(&self.drop_filter) = None;
    }

    /// simulates a NAT rebinding: datagrams from `real` appear to come from `apparent`, and
    ///  datagrams to `apparent` reach `real`
    pub fn alias(&self, real: SocketAddr, apparent: SocketAddr) {
        lock(&self.aliases).insert(real, apparent);
    }

    /// every datagram that was delivered so far, in delivery order
    pub fn delivered(&self) -> Vec<Datagram> {
        lock(&self.delivered).clone()
    }

    /// puts a datagram back on the wire, e.g. to replay it
    pub fn inject(&self, datagram: Datagram) {
        lock(&self.outbox).push_back(datagram);
    }

    fn target_socket(&self, to: SocketAddr) -> Option<Socket> {
        let real_to = lock(&self.aliases).iter()
            .find(|(_, &apparent)| apparent == to)
            .map(|(&real, _)| real)
            .unwrap_or(to);
        lock(&self.sockets).get(&real_to).cloned()
    }

    /// Delivers datagrams until no more are in flight. Returns the number of delivered datagrams.
    pub fn deliver_all(&self) -> usize {
        let mut num_delivered = 0;
        loop {
            let datagram = match lock(&self.outbox).pop_front() {
                Some(d) => d,
                None => return num_delivered,
            };

            let is_dropped = lock(&self.drop_filter).as_mut()
                .is_some_and(|filter| filter(&datagram));
            if is_dropped {
                trace!("test network: dropping datagram {:?} -> {:?}", datagram.from, datagram.to);
                continue;
            }

            let from = lock(&self.aliases).get(&datagram.from).copied()
                .unwrap_or(datagram.from);
            if let Some(socket) = self.target_socket(datagram.to) {
                lock(&self.delivered).push(datagram.clone());
                socket.on_datagram(&datagram.data, from);
                num_delivered += 1;
            }
        }
    }

    /// delivers datagrams and advances the clock tick by tick
    pub fn run_for(&self, duration: Duration) {
        let end = self.scheduler.now() + duration;
        self.deliver_all();
        while self.scheduler.now() < end {
            self.scheduler.advance(Scheduler::TICK);
            self.deliver_all();
        }
    }
}

/// Records what the callbacks of a connection (or listener) observe
#[derive(Clone, Default)]
pub struct Collector {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    close_events: Arc<Mutex<Vec<CloseEvent>>>,
    accepted: Arc<Mutex<Vec<ConnectionHandle>>>,
}

impl Collector {
    pub fn on_receive(&self) -> impl Fn(&[u8]) + Send + Sync + 'static {
        let received = self.received.clone();
        move |data| lock(&received).push(data.to_vec())
    }

    pub fn on_close(&self) -> impl Fn(CloseEvent) + Send + Sync + 'static {
        let close_events = self.close_events.clone();
        move |event| lock(&close_events).push(event)
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        lock(&self.received).clone()
    }

    pub fn close_events(&self) -> Vec<CloseEvent> {
        lock(&self.close_events).clone()
    }

    pub fn accepted(&self) -> Vec<ConnectionHandle> {
        lock(&self.accepted).clone()
    }

    /// Makes the socket accept every incoming connection, recording into this collector
    pub fn listen_accepting(&self, socket: &Socket) {
        let collector = self.clone();
        let accepting_socket = socket.clone();
        let on_close = self.on_close();
        socket.listen(
            move |handle| {
                lock(&collector.accepted).push(handle);
                accepting_socket.accept(handle, collector.on_receive(), None).unwrap();
            },
            move |_, event| on_close(event),
        );
    }

    /// Makes the socket listen without ever accepting
    pub fn listen_rejecting(&self, socket: &Socket) {
        let on_close = self.on_close();
        socket.listen(|_| {}, move |_, event| on_close(event));
    }
}
