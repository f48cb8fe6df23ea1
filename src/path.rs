use crate::connection::Connection;
use crate::packet::{Packet, PacketType};
use crate::util::lock;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace};

#[derive(Debug, Copy, Clone)]
struct PendingChallenge {
    nonce: u64,
    candidate: SocketAddr,
}

/// Detects that a peer's address changed and migrates the connection after the new address
///  proved it can receive.
///
/// A packet from an unexpected address triggers a reliable PATH_CHALLENGE with a random nonce,
///  sent on both the old and the new path. The peer echoes the nonce in an unreliable
///  PATH_RESPONSE, and the connection migrates once that response arrives from the candidate
///  address.
pub struct PathValidator {
    pending: Mutex<Option<PendingChallenge>>,
}

impl PathValidator {
    const NONCE_LEN: usize = size_of::<u64>();

    pub fn new() -> PathValidator {
        PathValidator {
            pending: Mutex::new(None),
        }
    }

    pub fn on_foreign_address(&self, conn: &Connection, from: SocketAddr, now: Instant) {
        let nonce = {
            let mut pending = lock(&self.pending);
            if matches!(*pending, Some(p) if p.candidate == from) {
                trace!("path challenge for {:?} is already pending", from);
                return;
            }
            let nonce = rand::random::<u64>();
            *pending = Some(PendingChallenge { nonce, candidate: from });
            nonce
        };

        debug!("connection {}: packet from unexpected address {:?} (expected {:?}) - challenging", conn.local_short_id(), from, conn.remote_addr());
        let mut challenge = Packet::new(PacketType::PathChallenge, Self::NONCE_LEN);
        if !challenge.push(&nonce) {
            return;
        }
        conn.sender.send_reliably(conn, challenge, &[conn.remote_addr(), from], now, true);
    }

    pub fn on_challenge(&self, conn: &Connection, challenge: &Packet, from: SocketAddr) {
        let nonce = match challenge.clone().pop::<u64>() {
            Ok(nonce) => nonce,
            Err(e) => {
                debug!("malformed path challenge from {:?}: {}", from, e);
                return;
            }
        };

        let mut response = Packet::new(PacketType::PathResponse, Self::NONCE_LEN);
        if response.push(&nonce) {
            conn.transmit(&response, from);
        }
    }

    pub fn on_response(&self, conn: &Connection, response: &Packet, from: SocketAddr) {
        let nonce = match response.clone().pop::<u64>() {
            Ok(nonce) => nonce,
            Err(e) => {
                debug!("malformed path response from {:?}: {}", from, e);
                return;
            }
        };

        let is_match = {
            let mut pending = lock(&self.pending);
            let is_match = matches!(*pending, Some(p) if p.nonce == nonce && p.candidate == from);
            if is_match {
                *pending = None;
            }
            is_match
        };

        if is_match {
            info!("connection {} migrated from {:?} to {:?}", conn.local_short_id(), conn.remote_addr(), from);
            conn.set_remote_addr(from);
        }
        else {
            debug!("path response from {:?} does not match a pending challenge - dropping", from);
        }
    }
}
