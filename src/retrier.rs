use crate::connection::{CloseEvent, Connection};
use crate::packet::Packet;
use crate::packet_id::PacketId;
use crate::scheduler::{Scheduler, Timeout};
use crate::util::lock;
use rustc_hash::FxHashMap;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// An unacknowledged reliable packet. There is usually one path variant; path challenges are
///  sent on both the old and the new path.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    pub id: PacketId,
    pub packet_paths: Vec<(Packet, SocketAddr)>,
    pub sent_at: Instant,
    pub retry_at: Instant,
    pub attempts: u32,
    pub is_priority: bool,
}

pub struct AckOutcome {
    pub rtt_sample: Duration,
    pub needs_recalculation: bool,
}

#[derive(Debug)]
pub enum RetryDecision {
    Nothing,
    Resend(Vec<(Packet, SocketAddr)>),
    Exhausted(PacketId),
}

/// The window of unacknowledged reliable packets. Entries are ordered by insertion, which is
///  packet id order without wraparound, so the first entry is the oldest one.
#[derive(Default)]
pub struct RetryWindow {
    entries: BTreeMap<u64, RetryEntry>,
    seq_by_id: FxHashMap<PacketId, u64>,
    next_seq: u64,
}

impl RetryWindow {
    pub fn num_unacked(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// returns `true` if the retry timer needs to be recalculated
    pub fn insert(&mut self, id: PacketId, packet_paths: Vec<(Packet, SocketAddr)>, now: Instant, retry_delay: Duration, is_priority: bool) -> bool {
        let was_empty = self.entries.is_empty();

        if let Some(prev_seq) = self.seq_by_id.remove(&id) {
            warn!("packet id {} is still in the retry window - replacing it", id);
            self.entries.remove(&prev_seq);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.seq_by_id.insert(id, seq);
        self.entries.insert(seq, RetryEntry {
            id,
            packet_paths,
            sent_at: now,
            retry_at: now + retry_delay,
            attempts: 0,
            is_priority,
        });

        was_empty || is_priority
    }

    /// Removes an acknowledged packet. Returns `None` for unknown ids, e.g. duplicate acks.
    pub fn ack(&mut self, id: PacketId, now: Instant, ack_delay: Duration) -> Option<AckOutcome> {
        let seq = self.seq_by_id.remove(&id)?;
        let was_first = self.entries.first_key_value()
            .map(|(&first, _)| first == seq)
            .unwrap_or(false);
        let entry = self.entries.remove(&seq)?;

        let rtt_sample = now.saturating_duration_since(entry.sent_at)
            .saturating_sub(ack_delay);

        Some(AckOutcome {
            rtt_sample,
            needs_recalculation: was_first || entry.is_priority,
        })
    }

    /// Updates all entries' retry times for a new retry delay, returning the earliest one
    pub fn recalculate(&mut self, retry_delay: Duration) -> Option<Instant> {
        self.entries.values_mut()
            .map(|entry| {
                entry.retry_at = entry.sent_at + retry_delay;
                entry.retry_at
            })
            .min()
    }

    /// Collects all packets that are due for retransmission, marking them as resent. If any due
    ///  packet has used up its attempts, nothing is resent.
    pub fn due(&mut self, now: Instant, max_attempts: u32) -> RetryDecision {
        if let Some(exhausted) = self.entries.values()
            .find(|e| e.retry_at <= now && e.attempts >= max_attempts)
        {
            return RetryDecision::Exhausted(exhausted.id);
        }

        let mut result = Vec::new();
        for entry in self.entries.values_mut() {
            if entry.retry_at <= now {
                entry.attempts += 1;
                entry.sent_at = now;
                trace!("packet {} is due for retry #{}", entry.id, entry.attempts);
                result.extend(entry.packet_paths.iter().cloned());
            }
        }

        if result.is_empty() {
            RetryDecision::Nothing
        }
        else {
            RetryDecision::Resend(result)
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seq_by_id.clear();
    }

    #[cfg(test)]
    pub fn entry(&self, id: PacketId) -> Option<&RetryEntry> {
        self.entries.get(self.seq_by_id.get(&id)?)
    }
}

/// Tracks unacknowledged reliable packets of a connection and retransmits them until they are
///  acknowledged, or declares the connection dead after `max_attempts` retries.
pub struct Retrier {
    window: Mutex<RetryWindow>,
    timeout: Timeout,
}

impl Retrier {
    pub fn new(scheduler: &Arc<Scheduler>, connection: Weak<Connection>) -> Retrier {
        let timeout = scheduler.allocate(move |now| {
            if let Some(conn) = connection.upgrade() {
                conn.retrier.on_retry_timeout(&conn, now);
            }
        });

        Retrier {
            window: Mutex::new(RetryWindow::default()),
            timeout,
        }
    }

    pub fn num_unacked(&self) -> usize {
        lock(&self.window).num_unacked()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.window).is_empty()
    }

    pub fn insert(&self, conn: &Connection, id: PacketId, packet_paths: Vec<(Packet, SocketAddr)>, now: Instant, is_priority: bool) {
        let retry_delay = conn.retry_delay();
        let needs_recalculation = lock(&self.window)
            .insert(id, packet_paths, now, retry_delay, is_priority);
        if needs_recalculation {
            self.recalculate_retry_timeout(conn);
        }
    }

    /// Returns the RTT sample if the ack removed a packet from the window
    pub fn ack(&self, conn: &Connection, id: PacketId, now: Instant, ack_delay: Duration) -> Option<Duration> {
        let outcome = lock(&self.window).ack(id, now, ack_delay)?;
        trace!("packet {} acknowledged, RTT sample {:?}", id, outcome.rtt_sample);
        if outcome.needs_recalculation {
            self.recalculate_retry_timeout(conn);
        }
        Some(outcome.rtt_sample)
    }

    /// Retry delay is `2 x RTT + delayed ack allowance`; arms the timer for the earliest entry
    pub fn recalculate_retry_timeout(&self, conn: &Connection) {
        let retry_delay = conn.retry_delay();
        match lock(&self.window).recalculate(retry_delay) {
            Some(retry_at) => self.timeout.schedule(retry_at),
            None => self.timeout.cancel(),
        }
    }

    fn on_retry_timeout(&self, conn: &Connection, now: Instant) {
        let max_attempts = conn.effective_config().max_attempts;
        let decision = lock(&self.window).due(now, max_attempts);

        match decision {
            RetryDecision::Nothing => {}
            RetryDecision::Exhausted(id) => {
                debug!("packet {} was not acknowledged after {} retries - connection {} timed out", id, max_attempts, conn.local_short_id());
                conn.fail(CloseEvent::Timeout);
                return;
            }
            RetryDecision::Resend(packet_paths) => {
                for (packet, to) in &packet_paths {
                    debug!("resending {:?} to {:?}", packet.header, to);
                    conn.statistics.on_packet_resent();
                    conn.transmit(packet, *to);
                }
                lock(&conn.rtt).on_failure();
                lock(&conn.window).on_failure();
            }
        }
        self.recalculate_retry_timeout(conn);
    }

    pub fn clear(&self) {
        lock(&self.window).clear();
        self.timeout.cancel();
    }

    pub fn cancel_timer(&self) {
        self.timeout.cancel();
    }
}
