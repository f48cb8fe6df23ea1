use crate::config::SocketConfig;
use crate::scheduler::Scheduler;
use crate::socket::Socket;
use crate::statistics::LifecycleCounter;
use crate::transport::UdpTransport;
use crate::util::lock;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// The runtime for any number of sockets: owns the scheduler and the task driving it, and the
///  receive loops of its sockets. Must be started from within a tokio runtime.
pub struct Service {
    scheduler: Arc<Scheduler>,
    driver: JoinHandle<()>,
    sockets: Mutex<Vec<(Socket, JoinHandle<()>)>>,
}

impl Drop for Service {
    fn drop(&mut self) {
        self.driver.abort();
        for (_, recv_loop) in lock(&self.sockets).iter() {
            recv_loop.abort();
        }
    }
}

impl Service {
    pub fn start() -> Service {
        let scheduler = Scheduler::new();
        let driver = tokio::spawn(scheduler.clone().run());
        Service {
            scheduler,
            driver,
            sockets: Default::default(),
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// binds a UDP socket and starts receiving on it
    pub async fn open_socket(&self, bind_addr: SocketAddr, config: SocketConfig) -> anyhow::Result<Socket> {
        self.do_open_socket(bind_addr, config, None).await
    }

    pub async fn open_socket_with_lifecycle_counter(&self, bind_addr: SocketAddr, config: SocketConfig, lifecycle: Arc<LifecycleCounter>) -> anyhow::Result<Socket> {
        self.do_open_socket(bind_addr, config, Some(lifecycle)).await
    }

    async fn do_open_socket(&self, bind_addr: SocketAddr, config: SocketConfig, lifecycle: Option<Arc<LifecycleCounter>>) -> anyhow::Result<Socket> {
        let transport = Arc::new(UdpTransport::bind(bind_addr).await?);
        let udp_socket = transport.udp_socket();

        let socket = match lifecycle {
            Some(lifecycle) => Socket::new_with_lifecycle_counter(config, transport, self.scheduler.clone(), lifecycle)?,
            None => Socket::new(config, transport, self.scheduler.clone())?,
        };
        let recv_loop = tokio::spawn(socket.clone().recv_loop(udp_socket));

        lock(&self.sockets).push((socket.clone(), recv_loop));
        Ok(socket)
    }

    /// Closes all connections of all sockets gracefully and waits for them to finish, then stops
    ///  receiving and firing timers. Returns an error if connections are still open after
    ///  `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> anyhow::Result<()> {
        info!("shutting down");
        let sockets = lock(&self.sockets).iter()
            .map(|(socket, _)| socket.clone())
            .collect::<Vec<_>>();

        for socket in &sockets {
            socket.close_all();
        }

        let mut result = Ok(());
        for socket in &sockets {
            if let Err(e) = socket.wait_until_idle(timeout).await {
                warn!("socket {:?} did not become idle: {}", socket.local_addr(), e);
                result = Err(e);
            }
        }

        for (_, recv_loop) in lock(&self.sockets).drain(..) {
            recv_loop.abort();
        }
        self.driver.abort();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::CloseEvent;
    use crate::config::{CoalescingMode, ConnectionOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn localhost() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_end_to_end() {
        let service_a = Service::start();
        let service_b = Service::start();
        let lifecycle = Arc::new(LifecycleCounter::default());

        let socket_a = service_a.open_socket_with_lifecycle_counter(localhost(), SocketConfig::default(), lifecycle.clone()).await.unwrap();
        let socket_b = service_b.open_socket_with_lifecycle_counter(localhost(), SocketConfig::default(), lifecycle.clone()).await.unwrap();

        let (received_sender, mut received) = mpsc::unbounded_channel::<Vec<u8>>();
        let (closed_sender, mut closed_a) = mpsc::unbounded_channel();
        let accepting_socket = socket_a.clone();
        socket_a.listen(
            move |handle| {
                let received_sender = received_sender.clone();
                accepting_socket.accept(handle, move |data| { received_sender.send(data.to_vec()).ok(); }, None).unwrap();
            },
            move |_, event| { closed_sender.send(event).ok(); },
        );

        let (closed_b_sender, mut closed_b) = mpsc::unbounded_channel();
        let handle = socket_b.connect(socket_a.local_addr(), ConnectionOptions::default(), |_| {}, move |event| { closed_b_sender.send(event).ok(); }).unwrap();
        socket_b.send(handle, b"abc", true).unwrap();

        let data = tokio::time::timeout(Duration::from_secs(5), received.recv()).await.unwrap().unwrap();
        assert_eq!(data, b"abc");

        socket_b.close(handle).unwrap();
        assert_eq!(tokio::time::timeout(Duration::from_secs(5), closed_b.recv()).await.unwrap(), Some(CloseEvent::Closed));
        assert_eq!(tokio::time::timeout(Duration::from_secs(5), closed_a.recv()).await.unwrap(), Some(CloseEvent::Closed));

        socket_a.wait_until_idle(Duration::from_secs(5)).await.unwrap();
        socket_b.wait_until_idle(Duration::from_secs(5)).await.unwrap();
        assert!(received.try_recv().is_err(), "data must be delivered exactly once");
        assert_eq!(lifecycle.num_created(), 2);

        // the last reference can be held by a timer callback that is just returning
        tokio::time::timeout(Duration::from_secs(1), async {
            while lifecycle.num_live() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_closes_connections() {
        let service = Service::start();
        let server = service.open_socket(localhost(), SocketConfig::default()).await.unwrap();
        let client = service.open_socket(localhost(), SocketConfig::default()).await.unwrap();

        let num_received = Arc::new(AtomicUsize::new(0));
        let accepting_socket = server.clone();
        let counter = num_received.clone();
        server.listen(
            move |handle| {
                let counter = counter.clone();
                accepting_socket.accept(handle, move |_| { counter.fetch_add(1, Ordering::SeqCst); }, None).unwrap();
            },
            |_, _| {},
        );

        let options = ConnectionOptions {
            reliable_coalescing: Some(CoalescingMode::Packet),
            reliable_coalesce_delay: Some(Duration::from_millis(5)),
            ..Default::default()
        };
        let handle = client.connect(server.local_addr(), options, |_| {}, |_| {}).unwrap();
        for _ in 0..20 {
            client.send(handle, b"x", true).unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while num_received.load(Ordering::SeqCst) < 20 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }).await.unwrap();

        service.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(server.num_connections(), 0);
        assert_eq!(client.num_connections(), 0);
    }
}
