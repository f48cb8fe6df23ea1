use crate::packet::{Packet, PacketHeader, PacketType};
use aes_gcm::aead::{AeadInPlace, Nonce};
use aes_gcm::{Aes256Gcm, Key, KeyInit};
use anyhow::bail;
use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, trace};

/// Pluggable packet protection. Implementations transform packets in place, changing type and
///  payload, and return `false` if a packet should be discarded.
///
/// The header's short connection id and packet id are set before `on_send` is called and must
///  be left unchanged, since they are needed for routing and acknowledgement.
pub trait Crypto: Send + Sync {
    /// number of bytes that protection adds to a packet's payload
    fn overhead(&self) -> usize;

    fn on_send(&self, packet: &mut Packet) -> bool;

    fn on_receive(&self, packet: &mut Packet) -> bool;

    /// `false` while a session is not established and application data can not be sent yet
    fn can_send(&self) -> bool {
        true
    }
}

/// AES-256-GCM with a pre-shared key. A protected packet's payload is
///
/// ```ascii
/// 0: ciphertext of the original packet type (u8) followed by the original payload
/// *: AES-GCM tag (16 bytes)
/// *: nonce (12 bytes)
/// ```
///
/// Version, short connection id and packet id from the header are authenticated as associated
///  data.
pub struct Aes256GcmCrypto {
    cipher: Aes256Gcm,
    nonce_fixed: u32,
    nonce_incremented: AtomicU64,
}

impl Aes256GcmCrypto {
    const NONCE_LEN: usize = 12;
    const TAG_LEN: usize = 16;

    /// key must be exactly 32 bytes
    pub fn new(key: &[u8]) -> anyhow::Result<Aes256GcmCrypto> {
        if key.len() != 32 {
            bail!("AES-256 key must be 32 bytes, was {}", key.len());
        }
        let key = Key::<Aes256Gcm>::from_slice(key);

        Ok(Aes256GcmCrypto {
            cipher: Aes256Gcm::new(key),
            nonce_fixed: rand::random(),
            nonce_incremented: AtomicU64::new(rand::random()),
        })
    }

    fn unique_nonce(&self) -> [u8; Self::NONCE_LEN] {
        let mut nonce = [0u8; Self::NONCE_LEN];
        nonce[..4].copy_from_slice(&self.nonce_fixed.to_be_bytes());
        nonce[4..].copy_from_slice(&self.nonce_incremented.fetch_add(1, Ordering::AcqRel).to_be_bytes());
        nonce
    }

    fn associated_data(header: &PacketHeader) -> [u8; 5] {
        let short_id = header.short_id.to_be_bytes();
        let packet_id = header.packet_id.to_raw().to_be_bytes();
        [header.version, short_id[0], short_id[1], packet_id[0], packet_id[1]]
    }
}

impl Crypto for Aes256GcmCrypto {
    fn overhead(&self) -> usize {
        size_of::<u8>()          // original packet type
            + Self::TAG_LEN
            + Self::NONCE_LEN
    }

    fn on_send(&self, packet: &mut Packet) -> bool {
        let original_type = packet.packet_type();
        if original_type.is_encrypted() {
            debug!("packet {:?} is already encrypted", packet.header);
            return false;
        }

        let mut buf = Vec::with_capacity(packet.payload_size() + self.overhead());
        buf.push(original_type.into());
        buf.extend_from_slice(packet.payload());

        let nonce = self.unique_nonce();
        let aad = Self::associated_data(&packet.header);
        if let Err(e) = self.cipher.encrypt_in_place(Nonce::<Aes256Gcm>::from_slice(&nonce), &aad, &mut buf) {
            error!("error encrypting packet {:?}: {}", packet.header, e);
            return false;
        }
        buf.extend_from_slice(&nonce);

        packet.header.packet_type = if original_type.is_handshake() {
            PacketType::EncryptedHandshake
        }
        else {
            PacketType::Encrypted
        };
        packet.set_payload(BytesMut::from(buf.as_slice()));
        trace!("encrypted {:?}", packet);
        true
    }

    fn on_receive(&self, packet: &mut Packet) -> bool {
        let marker = packet.packet_type();
        if !marker.is_encrypted() {
            debug!("received unencrypted packet {:?} - dropping", packet.header);
            return false;
        }

        let payload = packet.payload();
        if payload.len() < Self::NONCE_LEN + Self::TAG_LEN + 1 {
            debug!("encrypted packet {:?} is too short", packet.header);
            return false;
        }
        let (ciphertext, nonce) = payload.split_at(payload.len() - Self::NONCE_LEN);
        let nonce = Nonce::<Aes256Gcm>::clone_from_slice(nonce);
        let mut buf = ciphertext.to_vec();

        let aad = Self::associated_data(&packet.header);
        if self.cipher.decrypt_in_place(&nonce, &aad, &mut buf).is_err() {
            debug!("decryption of {:?} failed", packet.header);
            return false;
        }

        let original_type = match PacketType::try_from(buf[0]) {
            Ok(t) => t,
            Err(_) => {
                debug!("decrypted packet has unsupported type {:x}", buf[0]);
                return false;
            }
        };
        if original_type.is_handshake() != (marker == PacketType::EncryptedHandshake) {
            debug!("crypto marker {:?} does not match packet type {:?}", marker, original_type);
            return false;
        }

        packet.header.packet_type = original_type;
        packet.set_payload(BytesMut::from(&buf[1..]));
        true
    }
}
