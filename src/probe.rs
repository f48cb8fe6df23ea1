use crate::connection::{CloseEvent, Connection};
use crate::packet::{Packet, PacketType};
use crate::scheduler::{Scheduler, Timeout};
use crate::util::lock;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

struct ProbeState {
    last_activity: Instant,
    interval: Duration,
    active: bool,
}

impl ProbeState {
    fn next_probe_time(&self) -> Instant {
        self.last_activity + self.interval
    }
}

/// Keepalive for idle connections. A probe is a reliable packet, so a dead path surfaces
///  through retry exhaustion even if the application sends nothing.
pub struct Probe {
    state: Mutex<ProbeState>,
    timeout: Timeout,
}

impl Probe {
    pub fn new(scheduler: &Arc<Scheduler>, connection: Weak<Connection>, interval: Duration) -> Probe {
        let timeout = scheduler.allocate(move |now| {
            if let Some(conn) = connection.upgrade() {
                conn.probe.on_timeout(&conn, now);
            }
        });

        Probe {
            state: Mutex::new(ProbeState {
                last_activity: scheduler.now(),
                interval,
                active: false,
            }),
            timeout,
        }
    }

    pub fn open(&self, now: Instant) {
        let next = {
            let mut state = lock(&self.state);
            state.active = true;
            state.last_activity = now;
            state.next_probe_time()
        };
        self.timeout.schedule(next);
    }

    /// Refreshes the idle timer. The scheduled timeout is not moved: it checks the actual probe
    ///  time when it fires.
    pub fn on_activity(&self, now: Instant) {
        let mut state = lock(&self.state);
        if now > state.last_activity {
            state.last_activity = now;
        }
    }

    pub fn interval(&self) -> Duration {
        lock(&self.state).interval
    }

    pub fn set_interval(&self, interval: Duration) {
        let next = {
            let mut state = lock(&self.state);
            state.interval = interval;
            if !state.active {
                return;
            }
            state.next_probe_time()
        };
        self.timeout.schedule(next);
    }

    pub fn close(&self) {
        lock(&self.state).active = false;
        self.timeout.cancel();
    }

    fn on_timeout(&self, conn: &Connection, now: Instant) {
        let next = {
            let state = lock(&self.state);
            if !state.active {
                return;
            }
            state.next_probe_time()
        };
        if next > now {
            trace!("connection {} had activity - probing at {:?}", conn.local_short_id(), next);
            self.timeout.schedule(next);
            return;
        }

        if !conn.sender.is_open() {
            debug!("connection {} is idle without an open sender - timing out", conn.local_short_id());
            conn.fail(CloseEvent::Timeout);
            return;
        }

        trace!("probing idle connection {}", conn.local_short_id());
        conn.sender.send_reliably(conn, Packet::new(PacketType::Probe, 0), &[conn.remote_addr()], now, true);

        let next = {
            let mut state = lock(&self.state);
            state.last_activity = now;
            state.next_probe_time()
        };
        self.timeout.schedule(next);
    }
}
