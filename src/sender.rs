use crate::config::{CoalescingMode, EffectiveConnectionConfig};
use crate::connection::Connection;
use crate::frame::{Frame, FrameType};
use crate::packet::{Packet, PacketType};
use crate::packet_id::PacketId;
use crate::scheduler::{Scheduler, Timeout};
use crate::util::lock;
use anyhow::bail;
use std::cmp::min;
use std::collections::VecDeque;
use std::iter::Peekable;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

struct QueuedPacket {
    packet: Packet,
    num_frames: usize,
    /// sealed packets do not accept additional frames
    sealed: bool,
}

/// Outgoing packets of one reliability class, combining frames into packets according to the
///  class' coalescing mode.
pub struct CoalescingQueue {
    mode: CoalescingMode,
    packet_type: PacketType,
    capacity: usize,
    packets: VecDeque<QueuedPacket>,
    next_frame_id: u16,
}

impl CoalescingQueue {
    pub fn new(mode: CoalescingMode, packet_type: PacketType, capacity: usize) -> CoalescingQueue {
        CoalescingQueue {
            mode,
            packet_type,
            capacity,
            packets: VecDeque::new(),
            next_frame_id: 0,
        }
    }

    pub fn mode(&self) -> CoalescingMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }

    fn max_frame_payload(&self) -> usize {
        self.capacity - Frame::HEADER_LEN
    }

    fn next_frame_id(&mut self) -> u16 {
        let result = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        result
    }

    /// true if the tail packet can take another frame with `min_len` bytes of data
    fn tail_fits(&self, min_len: usize) -> bool {
        self.packets.back()
            .is_some_and(|tail| !tail.sealed && tail.packet.remaining_capacity() >= Frame::HEADER_LEN + min_len)
    }

    /// the tail packet, starting a new one unless the tail can be extended
    fn tail_for(&mut self, min_len: usize, coalesce: bool) -> &mut QueuedPacket {
        if !(coalesce && self.tail_fits(min_len)) {
            self.packets.push_back(QueuedPacket {
                packet: Packet::new(self.packet_type, self.capacity),
                num_frames: 0,
                sealed: false,
            });
        }
        let last = self.packets.len() - 1;
        &mut self.packets[last]
    }

    fn push_frame(&mut self, frame: Frame) {
        let frame_len = frame.data.len();
        let coalesce = self.mode != CoalescingMode::None;
        let tail = self.tail_for(frame_len, coalesce);

        if tail.packet.push(&frame) {
            tail.num_frames += 1;
        }
        else {
            debug!("frame of length {} does not fit into an empty packet - dropping", frame_len);
        }
        if !coalesce {
            tail.sealed = true;
        }
    }

    /// Enqueues application data. Outside stream mode, data must fit into a single frame.
    pub fn push_data(&mut self, mut data: &[u8]) -> anyhow::Result<()> {
        if self.mode != CoalescingMode::Stream {
            if data.len() > self.max_frame_payload() {
                bail!("payload of {} bytes exceeds the maximum of {} bytes", data.len(), self.max_frame_payload());
            }
            let frame_id = self.next_frame_id();
            self.push_frame(Frame::data(frame_id, data));
            return Ok(());
        }

        while !data.is_empty() {
            let frame_id = self.next_frame_id();
            let tail = self.tail_for(1, true);

            let chunk_len = min(data.len(), tail.packet.remaining_capacity() - Frame::HEADER_LEN);
            if tail.packet.push(&Frame::data(frame_id, &data[..chunk_len])) {
                tail.num_frames += 1;
            }
            data = &data[chunk_len..];
        }
        Ok(())
    }

    pub fn push_close_write(&mut self) {
        let frame_id = self.next_frame_id();
        self.push_frame(Frame::close_write(frame_id));
    }

    /// Enqueues a complete packet that is sent as it is, e.g. a control packet that must be
    ///  ordered after previously enqueued data
    pub fn push_sealed_packet(&mut self, packet: Packet) {
        self.packets.push_back(QueuedPacket {
            packet,
            num_frames: 0,
            sealed: true,
        });
    }

    /// (packet, number of frames)
    pub fn pop(&mut self) -> Option<(Packet, usize)> {
        self.packets.pop_front()
            .map(|q| (q.packet, q.num_frames))
    }
}

struct SenderState {
    /// opened when the handshake completes
    open: bool,
    /// no more application data is accepted
    closed: bool,
    failed: bool,
    next_packet_id: PacketId,
    reliable: CoalescingQueue,
    unreliable: CoalescingQueue,
    /// ids of received reliable packets that were not acknowledged yet, with their arrival time
    pending_acks: Vec<(PacketId, Instant)>,
}

impl SenderState {
    fn take_packet_id(&mut self) -> PacketId {
        let id = self.next_packet_id;
        self.next_packet_id = id.next();
        id
    }
}

/// Queues outgoing data in a reliable and an unreliable pipeline, each with its own coalescing
///  and its own drain timer. Reliable packets go through the [crate::retrier::Retrier].
pub struct Sender {
    state: Mutex<SenderState>,
    reliable_timeout: Timeout,
    unreliable_timeout: Timeout,
    reliable_delay: Duration,
    unreliable_delay: Duration,
    packet_capacity: usize,
}

impl Sender {
    pub fn new(
        scheduler: &Arc<Scheduler>,
        connection: Weak<Connection>,
        config: &EffectiveConnectionConfig,
        packet_capacity: usize,
        initial_packet_id: PacketId,
    ) -> Sender {
        let conn = connection.clone();
        let reliable_timeout = scheduler.allocate(move |now| {
            if let Some(conn) = conn.upgrade() {
                conn.sender.drain_reliable(&conn, now);
            }
        });
        let unreliable_timeout = scheduler.allocate(move |now| {
            if let Some(conn) = connection.upgrade() {
                conn.sender.drain_unreliable(&conn, now);
            }
        });

        Sender {
            state: Mutex::new(SenderState {
                open: false,
                closed: false,
                failed: false,
                next_packet_id: initial_packet_id,
                reliable: CoalescingQueue::new(config.reliable_coalescing, PacketType::DataReliable, packet_capacity),
                unreliable: CoalescingQueue::new(config.unreliable_coalescing, PacketType::DataUnreliable, packet_capacity),
                pending_acks: Vec::new(),
            }),
            reliable_timeout,
            unreliable_timeout,
            reliable_delay: config.reliable_coalesce_delay,
            unreliable_delay: config.unreliable_coalesce_delay,
            packet_capacity,
        }
    }

    /// the id the next reliable packet will get
    pub fn next_packet_id(&self) -> PacketId {
        lock(&self.state).next_packet_id
    }

    pub fn is_open(&self) -> bool {
        let state = lock(&self.state);
        state.open && !state.failed
    }

    pub fn is_closed(&self) -> bool {
        let state = lock(&self.state);
        state.closed || state.failed
    }

    /// closed, and everything that was sent is acknowledged
    pub fn is_write_done(&self, conn: &Connection) -> bool {
        let done = {
            let state = lock(&self.state);
            state.failed || (state.closed && state.reliable.is_empty())
        };
        done && conn.retrier.is_empty()
    }

    /// starts draining the queues
    pub fn open(&self, conn: &Connection, now: Instant) {
        lock(&self.state).open = true;
        self.drain_reliable(conn, now);
        self.drain_unreliable(conn, now);
    }

    pub fn send(&self, conn: &Connection, data: &[u8], reliable: bool, now: Instant) -> anyhow::Result<()> {
        let (mode, is_open) = {
            let mut state = lock(&self.state);
            if state.closed || state.failed {
                bail!("connection {} is closed for sending", conn.local_short_id());
            }
            let queue = if reliable { &mut state.reliable } else { &mut state.unreliable };
            queue.push_data(data)?;
            (queue.mode(), state.open)
        };
        trace!("enqueued {} bytes ({})", data.len(), if reliable { "reliable" } else { "unreliable" });

        if !is_open {
            return Ok(());
        }
        match (mode, reliable) {
            (CoalescingMode::None, true) => self.drain_reliable(conn, now),
            (CoalescingMode::None, false) => self.drain_unreliable(conn, now),
            (_, true) => self.reliable_timeout.schedule_no_later(now + self.reliable_delay),
            (_, false) => self.unreliable_timeout.schedule_no_later(now + self.unreliable_delay),
        }
        Ok(())
    }

    /// Assigns the next packet id, registers the packet with the retrier and transmits it on
    ///  every given path
    pub fn send_reliably(&self, conn: &Connection, mut packet: Packet, paths: &[SocketAddr], now: Instant, is_priority: bool) -> PacketId {
        packet.header.packet_id = lock(&self.state).take_packet_id();
        self.register_and_transmit(conn, packet, paths, now, is_priority)
    }

    fn register_and_transmit(&self, conn: &Connection, packet: Packet, paths: &[SocketAddr], now: Instant, is_priority: bool) -> PacketId {
        let id = packet.packet_id();
        let packet_paths = paths.iter()
            .map(|&to| (packet.clone(), to))
            .collect();
        conn.retrier.insert(conn, id, packet_paths, now, is_priority);

        for &to in paths {
            conn.transmit(&packet, to);
        }
        id
    }

    /// The next queued reliable packet if the send window has room. Its id is assigned while
    ///  the queue is locked, so ids follow queue order even if several threads drain at once.
    fn pop_reliable(&self, conn: &Connection) -> Option<(Packet, usize)> {
        let mut state = lock(&self.state);
        if !state.open || state.failed {
            return None;
        }
        if conn.retrier.num_unacked() >= conn.window_size() {
            trace!("send window is full");
            return None;
        }

        let (mut packet, num_frames) = state.reliable.pop()?;
        packet.header.packet_id = state.take_packet_id();
        Some((packet, num_frames))
    }

    pub fn drain_reliable(&self, conn: &Connection, now: Instant) {
        while let Some((packet, num_frames)) = self.pop_reliable(conn) {
            conn.statistics.on_frames_sent(num_frames);
            self.register_and_transmit(conn, packet, &[conn.remote_addr()], now, false);
        }
    }

    /// Sends pending acks and all queued unreliable packets. Acks are piggybacked on unreliable
    ///  data packets ahead of the data frames where they fit, the rest goes into ack packets.
    pub fn drain_unreliable(&self, conn: &Connection, now: Instant) {
        let (acks, packets) = {
            let mut state = lock(&self.state);
            if state.failed {
                return;
            }
            let acks = std::mem::take(&mut state.pending_acks);
            let mut packets = Vec::new();
            if state.open {
                while let Some(p) = state.unreliable.pop() {
                    packets.push(p);
                }
            }
            (acks, packets)
        };

        let mut ack_frames = acks.into_iter()
            .map(|(id, received_at)| {
                let delay = now.saturating_duration_since(received_at).as_millis();
                Frame::ack(id, min(delay, u16::MAX as u128) as u16)
            })
            .peekable();

        let to = conn.remote_addr();
        for (packet, num_frames) in packets {
            let packet = prepend_acks(&packet, &mut ack_frames, self.packet_capacity);
            conn.statistics.on_frames_sent(num_frames);
            conn.transmit(&packet, to);
        }

        while ack_frames.peek().is_some() {
            let mut packet = Packet::new(PacketType::Ack, self.packet_capacity);
            while let Some(ack) = ack_frames.next_if(|_| packet.remaining_capacity() >= Frame::ACK_LEN) {
                let _ = packet.push(&ack);
            }
            conn.transmit(&packet, to);
        }
    }

    /// registers an ack for a received reliable packet, sending it immediately unless acks are
    ///  delayed
    pub fn queue_ack(&self, conn: &Connection, id: PacketId, now: Instant) {
        lock(&self.state).pending_acks.push((id, now));

        let ack_delay = conn.socket_config.ack_delay;
        if ack_delay.is_zero() {
            self.drain_unreliable(conn, now);
        }
        else {
            self.unreliable_timeout.schedule_no_later(now + ack_delay);
        }
    }

    /// handles ack frames in incoming packets
    pub fn on_packet(&self, conn: &Connection, packet: &Packet, now: Instant) {
        if !matches!(packet.packet_type(), PacketType::Ack | PacketType::DataUnreliable) {
            return;
        }

        let frames = match Frame::pop_all(&mut packet.clone()) {
            Ok(frames) => frames,
            Err(e) => {
                debug!("malformed frames in {:?}: {} - ignoring", packet.header, e);
                return;
            }
        };

        for frame in frames.iter().filter(|f| f.frame_type == FrameType::Ack) {
            if let Ok((acked_id, delay_millis)) = frame.ack_fields() {
                self.on_ack(conn, acked_id, delay_millis, now);
            }
        }
    }

    pub fn on_ack(&self, conn: &Connection, acked_id: PacketId, delay_millis: u16, now: Instant) {
        match conn.retrier.ack(conn, acked_id, now, Duration::from_millis(delay_millis as u64)) {
            Some(rtt_sample) => {
                lock(&conn.rtt).on_sample(rtt_sample);
                lock(&conn.window).on_ack();
            }
            None => {
                trace!("ack for packet {} that is not in the retry window - ignoring", acked_id);
                return;
            }
        }
        self.drain_reliable(conn, now);
        conn.check_finish();
    }

    /// Graceful close: stops accepting application data and sends a CLOSE_WRITE frame after
    ///  everything that was queued before
    pub fn close(&self, conn: &Connection, now: Instant) {
        {
            let mut state = lock(&self.state);
            if state.closed || state.failed {
                return;
            }
            state.closed = true;
            state.reliable.push_close_write();
        }
        self.drain_reliable(conn, now);
    }

    /// Enqueues a control packet (e.g. CLOSE_READ) behind queued reliable data
    pub fn enqueue_reliable_packet(&self, conn: &Connection, packet: Packet, now: Instant) {
        lock(&self.state).reliable.push_sealed_packet(packet);
        self.drain_reliable(conn, now);
    }

    /// the peer will not read anything anymore: unsent data is discarded
    pub fn on_close_read(&self) {
        let mut state = lock(&self.state);
        state.closed = true;
        state.reliable.clear();
        state.unreliable.clear();
    }

    /// hard failure: everything is discarded
    pub fn fail(&self, conn: &Connection) {
        {
            let mut state = lock(&self.state);
            state.failed = true;
            state.closed = true;
            state.reliable.clear();
            state.unreliable.clear();
            state.pending_acks.clear();
        }
        self.cancel_timers();
        conn.retrier.clear();
    }

    pub fn cancel_timers(&self) {
        self.reliable_timeout.cancel();
        self.unreliable_timeout.cancel();
    }
}

/// An unreliable data packet with as many pending acks in front of its data frames as fit
fn prepend_acks(data_packet: &Packet, acks: &mut Peekable<impl Iterator<Item = Frame>>, capacity: usize) -> Packet {
    let room_for_acks = capacity.saturating_sub(data_packet.payload_size());

    let mut packet = Packet::new(PacketType::DataUnreliable, capacity);
    while let Some(ack) = acks.next_if(|_| packet.payload_size() + Frame::ACK_LEN <= room_for_acks) {
        let _ = packet.push(&ack);
    }
    if !packet.push_slice(data_packet.payload()) {
        debug!("unreliable data does not fit behind acks - this is a bug");
    }
    packet
}
