use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// A point-in-time copy of a connection's counters
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct Statistics {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_resent: u64,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionStatistics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_resent: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl ConnectionStatistics {
    pub fn on_packet_sent(&self, num_bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn on_packet_resent(&self) {
        self.packets_resent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_frames_sent(&self, num_frames: usize) {
        self.frames_sent.fetch_add(num_frames as u64, Ordering::Relaxed);
    }

    pub fn on_packet_received(&self, num_bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(num_bytes as u64, Ordering::Relaxed);
    }

    pub fn on_frames_received(&self, num_frames: usize) {
        self.frames_received.fetch_add(num_frames as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Statistics {
        Statistics {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_resent: self.packets_resent.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

/// Counts live connection instances. This is a diagnostic for leak detection in tests, injected
///  into a socket rather than kept as global state.
#[derive(Debug, Default)]
pub struct LifecycleCounter {
    created: AtomicUsize,
    dropped: AtomicUsize,
}

impl LifecycleCounter {
    pub fn on_created(&self) {
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    pub fn on_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn num_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn num_live(&self) -> usize {
        self.created.load(Ordering::SeqCst) - self.dropped.load(Ordering::SeqCst)
    }
}
