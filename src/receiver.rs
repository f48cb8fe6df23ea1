use crate::connection::Connection;
use crate::frame::{Frame, FrameType};
use crate::packet::{Packet, PacketType};
use crate::packet_id::PacketId;
use crate::util::lock;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

#[derive(Debug, Eq, PartialEq)]
pub enum ReceiveOutcome<T> {
    /// the pushed entry and all buffered entries that became contiguous, in id order
    Deliver(Vec<T>),
    Buffered,
    Duplicate,
    /// too far ahead of the expected id to be buffered
    OutOfWindow,
}

/// Reorders entries by packet id, releasing each id exactly once and in increasing order.
///  The entry at the expected id is never buffered.
pub struct ReceiveQueue<T> {
    expected: PacketId,
    buffered: FxHashMap<PacketId, T>,
    max_ahead: u16,
}

impl<T> ReceiveQueue<T> {
    pub fn new(first_expected: PacketId, max_ahead: u16) -> ReceiveQueue<T> {
        ReceiveQueue {
            expected: first_expected,
            buffered: FxHashMap::default(),
            max_ahead,
        }
    }

    pub fn expected(&self) -> PacketId {
        self.expected
    }

    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }

    pub fn push(&mut self, id: PacketId, item: T) -> ReceiveOutcome<T> {
        if id == self.expected {
            let mut ready = vec![item];
            self.expected = self.expected.next();
            while let Some(next) = self.buffered.remove(&self.expected) {
                ready.push(next);
                self.expected = self.expected.next();
            }
            return ReceiveOutcome::Deliver(ready);
        }

        if !id.greater_than(self.expected) {
            return ReceiveOutcome::Duplicate;
        }
        if id.distance_from(self.expected) > self.max_ahead {
            return ReceiveOutcome::OutOfWindow;
        }
        if self.buffered.contains_key(&id) {
            return ReceiveOutcome::Duplicate;
        }
        self.buffered.insert(id, item);
        ReceiveOutcome::Buffered
    }
}

struct ReceiverState {
    /// `None` until the handshake completes
    queue: Option<ReceiveQueue<Packet>>,
    /// released packets waiting to be processed
    ready: VecDeque<Packet>,
    /// a thread is working through `ready`: exactly one thread processes packets at a time,
    ///  which keeps user callbacks in order
    delivering: bool,
    /// the peer sent CLOSE_WRITE
    closed_by_peer: bool,
    /// the application stopped reading
    closed_locally: bool,
}

/// The ordered receive pipeline: acks reliable packets and delivers their frames in packet id
///  order exactly once. Unreliable data bypasses ordering.
pub struct Receiver {
    state: Mutex<ReceiverState>,
    max_ahead: u16,
}

impl Receiver {
    pub fn new(max_ahead: u16) -> Receiver {
        Receiver {
            state: Mutex::new(ReceiverState {
                queue: None,
                ready: VecDeque::new(),
                delivering: false,
                closed_by_peer: false,
                closed_locally: false,
            }),
            max_ahead,
        }
    }

    pub fn open(&self, first_expected: PacketId) {
        let mut state = lock(&self.state);
        if state.queue.is_none() {
            debug!("opening receiver, first expected packet id is {}", first_expected);
            state.queue = Some(ReceiveQueue::new(first_expected, self.max_ahead));
        }
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).queue.is_some()
    }

    /// no more data will be delivered
    pub fn is_read_done(&self) -> bool {
        let state = lock(&self.state);
        state.closed_by_peer || state.closed_locally
    }

    pub fn on_packet(&self, conn: &Connection, packet: &Packet, from: SocketAddr, now: Instant) {
        let packet_type = packet.packet_type();
        if packet_type == PacketType::DataUnreliable {
            self.on_unreliable(conn, packet);
            return;
        }
        if !packet_type.is_reliable() {
            return;
        }

        let id = packet.packet_id();
        let should_deliver = {
            let mut state = lock(&self.state);
            let queue = match &mut state.queue {
                Some(queue) => queue,
                None => {
                    debug!("receiver is not open - dropping {:?}", packet.header);
                    return;
                }
            };
            match queue.push(id, packet.clone()) {
                ReceiveOutcome::Deliver(ready) => state.ready.extend(ready),
                ReceiveOutcome::Buffered => trace!("buffering out-of-order packet {}", id),
                ReceiveOutcome::Duplicate => trace!("duplicate packet {} - re-acking", id),
                ReceiveOutcome::OutOfWindow => {
                    debug!("packet {} is too far ahead of the receive window - dropping", id);
                    return;
                }
            }

            let should_deliver = !state.delivering && !state.ready.is_empty();
            if should_deliver {
                state.delivering = true;
            }
            should_deliver
        };

        conn.sender.queue_ack(conn, id, now);

        if packet_type == PacketType::PathChallenge {
            // answered on every receipt, since the response goes to the address this copy
            //  came from
            conn.path.on_challenge(conn, packet, from);
        }

        if should_deliver {
            self.deliver_ready(conn);
        }
    }

    fn on_unreliable(&self, conn: &Connection, packet: &Packet) {
        if !self.is_open() {
            debug!("receiver is not open - dropping {:?}", packet.header);
            return;
        }
        let frames = match Frame::pop_all(&mut packet.clone()) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("malformed unreliable packet {:?} from {:?}: {}", packet.header, conn.remote_addr(), e);
                return;
            }
        };
        self.deliver_frames(conn, frames);
    }

    fn deliver_ready(&self, conn: &Connection) {
        loop {
            let packet = {
                let mut state = lock(&self.state);
                match state.ready.pop_front() {
                    Some(p) => p,
                    None => {
                        state.delivering = false;
                        return;
                    }
                }
            };
            self.process_in_order(conn, packet);
        }
    }

    fn process_in_order(&self, conn: &Connection, mut packet: Packet) {
        match packet.packet_type() {
            PacketType::DataReliable => {
                match Frame::pop_all(&mut packet) {
                    Ok(frames) => {
                        let closes_write = frames.iter().any(|f| f.frame_type == FrameType::CloseWrite);
                        self.deliver_frames(conn, frames);
                        if closes_write {
                            self.on_close_write(conn);
                        }
                    }
                    Err(e) => warn!("malformed reliable packet {:?} from {:?}: {}", packet.header, conn.remote_addr(), e),
                }
            }
            PacketType::CloseRead => {
                debug!("peer closed connection {} for reading", conn.local_short_id());
                conn.on_close_read();
            }
            PacketType::Probe => trace!("probe {}", packet.packet_id()),
            _ => {}
        }
    }

    fn deliver_frames(&self, conn: &Connection, frames: Vec<Frame>) {
        conn.statistics.on_frames_received(frames.len());
        if lock(&self.state).closed_locally {
            trace!("receiver is closed - discarding {} frames", frames.len());
            return;
        }
        for frame in frames {
            if frame.frame_type == FrameType::Data {
                conn.deliver(&frame.data);
            }
        }
    }

    fn on_close_write(&self, conn: &Connection) {
        debug!("peer closed connection {} for writing", conn.local_short_id());
        lock(&self.state).closed_by_peer = true;
        conn.check_finish();
    }

    /// The application stops reading. The peer is told with a CLOSE_READ packet, queued
    ///  behind data that is already waiting to be sent.
    pub fn close(&self, conn: &Connection, now: Instant) {
        {
            let mut state = lock(&self.state);
            if state.closed_locally {
                return;
            }
            state.closed_locally = true;
            state.ready.clear();
        }
        if conn.sender.is_open() && !conn.sender.is_closed() {
            conn.sender.enqueue_reliable_packet(conn, Packet::new(PacketType::CloseRead, 0), now);
        }
    }

    /// hard failure
    pub fn fail(&self) {
        let mut state = lock(&self.state);
        state.closed_locally = true;
        state.ready.clear();
        if let Some(queue) = &mut state.queue {
            queue.buffered.clear();
        }
    }
}
