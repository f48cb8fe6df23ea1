use crate::config::ConnectionOptions;
use crate::connection::Connection;
use crate::packet::{Packet, PacketType};
use crate::packet_id::PacketId;
use crate::util::lock;
use anyhow::bail;
use std::cmp::min;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum HandshakeState {
    Idle,
    WaitingForH0,
    WaitingForH1 { h0_id: PacketId },
    WaitingForH2 { h0_id: PacketId },
    WaitingForH3 { h2_id: PacketId, peer_initial_id: PacketId },
    Complete { h2_id: PacketId },
}

/// The values a side announces in H2 (initiator) or H3 (responder):
///
/// ```ascii
/// 0: sender's short connection id (u16)
/// 2: probe interval in millis (u32)
/// 6: max attempts (u32)
/// ```
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SessionParams {
    pub short_id: u16,
    pub probe_interval: Duration,
    pub max_attempts: u32,
}

impl SessionParams {
    pub const SERIALIZED_LEN: usize = size_of::<u16>() + size_of::<u32>() + size_of::<u32>();

    fn probe_interval_millis(&self) -> u32 {
        min(self.probe_interval.as_millis(), u32::MAX as u128) as u32
    }

    #[must_use]
    pub fn push(&self, packet: &mut Packet) -> bool {
        packet.push(&self.short_id)
            && packet.push(&self.probe_interval_millis())
            && packet.push(&self.max_attempts)
    }

    /// Parses a peer's parameters. Values that the local configuration would reject are an
    ///  error, since they are adopted through negotiation.
    pub fn pop(packet: &mut Packet) -> anyhow::Result<SessionParams> {
        let short_id = packet.pop::<u16>()?;
        let probe_interval = Duration::from_millis(packet.pop::<u32>()? as u64);
        let max_attempts = packet.pop::<u32>()?;

        if short_id == 0 {
            bail!("short connection id 0 is reserved");
        }
        if probe_interval < ConnectionOptions::MIN_PROBE_INTERVAL {
            bail!("probe interval {:?} is below the minimum of {:?}", probe_interval, ConnectionOptions::MIN_PROBE_INTERVAL);
        }
        if max_attempts == 0 {
            bail!("max attempts must be positive");
        }
        Ok(SessionParams {
            short_id,
            probe_interval,
            max_attempts,
        })
    }

    /// both sides work with the stricter of their settings
    pub fn negotiate(&self, peer: &SessionParams) -> (Duration, u32) {
        (
            min(self.probe_interval, peer.probe_interval),
            min(self.max_attempts, peer.max_attempts).max(1),
        )
    }
}

/// The 4-message connection setup. Each side's reliable packet ids start at a random value `I`
///  (initiator) and `R` (responder).
///
/// * H0 (initiator, reliable, id `I`, empty)
/// * H1 (responder, acks H0 with id `I`): `R` as u16
/// * H2 (initiator, reliable, id `I+1`): initiator's [SessionParams]
/// * H3 (responder, acks H2 with id `I+1`): responder's short id and the negotiated settings
///
/// The responder's receiver expects `I+2` next, the initiator's expects `R`. Handshake packets
///  that do not fit the current state are ignored, except for duplicates of H0 and H2 which
///  are answered again because the previous answer may have been lost.
pub struct Handshake {
    role: Role,
    state: Mutex<HandshakeState>,
}

impl Handshake {
    pub fn new(role: Role) -> Handshake {
        let state = match role {
            Role::Initiator => HandshakeState::Idle,
            Role::Responder => HandshakeState::WaitingForH0,
        };
        Handshake {
            role,
            state: Mutex::new(state),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_complete(&self) -> bool {
        matches!(*lock(&self.state), HandshakeState::Complete { .. })
    }

    /// The initiator sends H0; for the responder, this is a no-op
    pub fn start(&self, conn: &Connection, now: Instant) {
        let h0_id = {
            let mut state = lock(&self.state);
            if *state != HandshakeState::Idle {
                return;
            }
            let h0_id = conn.sender.next_packet_id();
            *state = HandshakeState::WaitingForH1 { h0_id };
            h0_id
        };

        debug!("connection {}: sending H0 to {:?}", conn.local_short_id(), conn.remote_addr());
        let sent_id = conn.sender.send_reliably(conn, Packet::new(PacketType::H0, 0), &[conn.remote_addr()], now, true);
        debug_assert_eq!(sent_id, h0_id);
    }

    /// Returns `true` if the packet was a handshake packet, regardless of whether it was valid
    ///  in the current state
    pub fn on_packet(&self, conn: &Connection, packet: &Packet, from: SocketAddr, now: Instant) -> bool {
        if !packet.packet_type().is_handshake() {
            return false;
        }
        trace!("connection {}: received {:?} from {:?}", conn.local_short_id(), packet.header, from);

        let result = match packet.packet_type() {
            PacketType::H0 => self.on_h0(conn, packet),
            PacketType::H1 => self.on_h1(conn, packet, now),
            PacketType::H2 => self.on_h2(conn, packet, now),
            PacketType::H3 => self.on_h3(conn, packet, now),
            _ => Ok(()),
        };
        if let Err(e) = result {
            debug!("connection {}: malformed {:?} - ignoring: {}", conn.local_short_id(), packet.header, e);
        }
        true
    }

    fn own_params(conn: &Connection) -> SessionParams {
        let config = conn.effective_config();
        SessionParams {
            short_id: conn.local_short_id(),
            probe_interval: config.probe_interval,
            max_attempts: config.max_attempts,
        }
    }

    fn send_h1(conn: &Connection, h0_id: PacketId) {
        let mut h1 = Packet::new(PacketType::H1, size_of::<u16>());
        h1.header.packet_id = h0_id;
        if h1.push(&conn.sender.next_packet_id().to_raw()) {
            conn.transmit(&h1, conn.remote_addr());
        }
    }

    fn send_h3(conn: &Connection, h2_id: PacketId) {
        let mut h3 = Packet::new(PacketType::H3, SessionParams::SERIALIZED_LEN);
        h3.header.packet_id = h2_id;
        if Self::own_params(conn).push(&mut h3) {
            conn.transmit(&h3, conn.remote_addr());
        }
    }

    fn on_h0(&self, conn: &Connection, packet: &Packet) -> anyhow::Result<()> {
        let h0_id = {
            let mut state = lock(&self.state);
            match *state {
                HandshakeState::WaitingForH0 => {
                    *state = HandshakeState::WaitingForH2 { h0_id: packet.packet_id() };
                    packet.packet_id()
                }
                HandshakeState::WaitingForH2 { h0_id } if h0_id == packet.packet_id() => {
                    debug!("connection {}: duplicate H0 - resending H1", conn.local_short_id());
                    h0_id
                }
                _ => return Ok(()),
            }
        };
        Self::send_h1(conn, h0_id);
        Ok(())
    }

    fn on_h1(&self, conn: &Connection, packet: &Packet, now: Instant) -> anyhow::Result<()> {
        let peer_initial_id = PacketId::from_raw(packet.clone().pop::<u16>()?);

        let h0_id = {
            let state = lock(&self.state);
            match *state {
                HandshakeState::WaitingForH1 { h0_id } if h0_id == packet.packet_id() => h0_id,
                _ => return Ok(()),
            }
        };
        conn.sender.on_ack(conn, h0_id, 0, now);

        let mut h2 = Packet::new(PacketType::H2, SessionParams::SERIALIZED_LEN);
        if !Self::own_params(conn).push(&mut h2) {
            return Ok(());
        }

        {
            let mut state = lock(&self.state);
            if *state != (HandshakeState::WaitingForH1 { h0_id }) {
                return Ok(());
            }
            let h2_id = conn.sender.next_packet_id();
            *state = HandshakeState::WaitingForH3 { h2_id, peer_initial_id };
        }
        debug!("connection {}: sending H2", conn.local_short_id());
        conn.sender.send_reliably(conn, h2, &[conn.remote_addr()], now, true);
        Ok(())
    }

    fn on_h2(&self, conn: &Connection, packet: &Packet, now: Instant) -> anyhow::Result<()> {
        let peer = SessionParams::pop(&mut packet.clone())?;
        let h2_id = packet.packet_id();

        let is_duplicate = {
            let mut state = lock(&self.state);
            match *state {
                HandshakeState::WaitingForH2 { h0_id } if h0_id.next() == h2_id => {
                    *state = HandshakeState::Complete { h2_id };
                    false
                }
                HandshakeState::Complete { h2_id: completed } if completed == h2_id && self.role == Role::Responder => true,
                _ => return Ok(()),
            }
        };
        if is_duplicate {
            debug!("connection {}: duplicate H2 - resending H3", conn.local_short_id());
            Self::send_h3(conn, h2_id);
            return Ok(());
        }

        let (probe_interval, max_attempts) = Self::own_params(conn).negotiate(&peer);
        conn.set_remote_short_id(peer.short_id);
        conn.set_negotiated(probe_interval, max_attempts);
        Self::send_h3(conn, h2_id);
        conn.on_handshake_complete(h2_id.next(), now);
        Ok(())
    }

    fn on_h3(&self, conn: &Connection, packet: &Packet, now: Instant) -> anyhow::Result<()> {
        let peer = SessionParams::pop(&mut packet.clone())?;

        let (h2_id, peer_initial_id) = {
            let mut state = lock(&self.state);
            match *state {
                HandshakeState::WaitingForH3 { h2_id, peer_initial_id } if h2_id == packet.packet_id() => {
                    *state = HandshakeState::Complete { h2_id };
                    (h2_id, peer_initial_id)
                }
                _ => return Ok(()),
            }
        };

        conn.set_remote_short_id(peer.short_id);
        conn.set_negotiated(peer.probe_interval, peer.max_attempts.max(1));
        conn.sender.on_ack(conn, h2_id, 0, now);
        conn.on_handshake_complete(peer_initial_id, now);
        Ok(())
    }
}
