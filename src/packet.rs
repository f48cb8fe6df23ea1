use crate::packet_id::PacketId;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Debug, Formatter};

/// Packet types are single printable ASCII tags to keep packet dumps readable
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PacketType {
    H0 = b'0',
    H1 = b'1',
    H2 = b'2',
    H3 = b'3',
    Ack = b'A',
    DataReliable = b'R',
    DataUnreliable = b'U',
    Probe = b'P',
    CloseRead = b'C',
    PathChallenge = b'Q',
    PathResponse = b'S',
    /// crypto wrapper for regular packets
    Encrypted = b'E',
    /// crypto wrapper for handshake packets, which allows routing of new connections without
    ///  decrypting everything with an unknown connection id
    EncryptedHandshake = b'K',
}

impl PacketType {
    pub fn is_handshake(&self) -> bool {
        matches!(self, PacketType::H0 | PacketType::H1 | PacketType::H2 | PacketType::H3)
    }

    /// Reliable packets carry a sequential packet id, they are acknowledged by the receiver and
    ///  retransmitted by the sender until they are
    pub fn is_reliable(&self) -> bool {
        matches!(self, PacketType::DataReliable | PacketType::Probe | PacketType::CloseRead | PacketType::PathChallenge)
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, PacketType::Encrypted | PacketType::EncryptedHandshake)
    }
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub version: u8,
    pub short_id: u16,
    pub packet_type: PacketType,
    pub packet_id: PacketId,
}
impl Debug for PacketHeader {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "PCKT{{V{}@{}:{:?}#{}}}", self.version, self.short_id, self.packet_type, self.packet_id)
    }
}

impl PacketHeader {
    pub const PROTOCOL_VERSION_1: u8 = 1;
    pub const SERIALIZED_LEN: usize = size_of::<u8>()  // version
        + size_of::<u16>()                              // short connection id
        + size_of::<u8>()                               // packet type
        + size_of::<u16>();                             // packet id

    pub fn new(short_id: u16, packet_type: PacketType, packet_id: PacketId) -> PacketHeader {
        PacketHeader {
            version: Self::PROTOCOL_VERSION_1,
            short_id,
            packet_type,
            packet_id,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u16(self.short_id);
        buf.put_u8(self.packet_type.into());
        buf.put_u16(self.packet_id.to_raw());
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<PacketHeader> {
        let version = buf.try_get_u8()?;
        if version != Self::PROTOCOL_VERSION_1 {
            bail!("unsupported protocol version {}", version);
        }
        let short_id = buf.try_get_u16()?;
        let raw_type = buf.try_get_u8()?;
        let packet_type = match PacketType::try_from(raw_type) {
            Ok(t) => t,
            Err(_) => bail!("unsupported packet type {:x}", raw_type),
        };
        let packet_id = PacketId::from_raw(buf.try_get_u16()?);

        Ok(PacketHeader {
            version,
            short_id,
            packet_type,
            packet_id,
        })
    }
}

/// A typed field that can be appended to / consumed from a packet's payload. Fields are written
///  in network byte order; the order of `push` calls on the sending side must mirror the order
///  of `pop` calls on the receiving side.
pub trait WireField: Sized {
    fn wire_len(&self) -> usize;
    fn put(&self, buf: &mut BytesMut);
    fn take(buf: &mut BytesMut) -> anyhow::Result<Self>;
}

macro_rules! wire_field_for_int {
    ($t:ty, $put:ident, $get:ident) => {
        impl WireField for $t {
            fn wire_len(&self) -> usize {
                size_of::<$t>()
            }
            fn put(&self, buf: &mut BytesMut) {
                buf.$put(*self);
            }
            fn take(buf: &mut BytesMut) -> anyhow::Result<Self> {
                Ok(buf.$get()?)
            }
        }
    };
}
wire_field_for_int!(u8, put_u8, try_get_u8);
wire_field_for_int!(u16, put_u16, try_get_u16);
wire_field_for_int!(u32, put_u32, try_get_u32);
wire_field_for_int!(u64, put_u64, try_get_u64);
wire_field_for_int!(u128, put_u128, try_get_u128);

/// variable length data, prefixed with its length as u16
impl WireField for Vec<u8> {
    fn wire_len(&self) -> usize {
        size_of::<u16>() + self.len()
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.len() as u16);
        buf.put_slice(self);
    }

    fn take(buf: &mut BytesMut) -> anyhow::Result<Self> {
        let len = buf.try_get_u16()? as usize;
        if buf.remaining() < len {
            bail!("length prefix {} exceeds remaining payload {}", len, buf.remaining());
        }
        Ok(buf.split_to(len).to_vec())
    }
}

/// A packet as it is handled inside the protocol engine: values are pushed at the tail of the
///  payload and popped from its head. `capacity` is the maximum payload size.
#[derive(Clone)]
pub struct Packet {
    pub header: PacketHeader,
    payload: BytesMut,
    capacity: usize,
}
/// packets are equal if header and payload are equal, regardless of their capacity
impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.header == other.header && self.payload == other.payload
    }
}
impl Eq for Packet {}

impl Debug for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}[{} bytes]", self.header, self.payload.len())
    }
}

impl Packet {
    pub fn new(packet_type: PacketType, capacity: usize) -> Packet {
        Packet {
            header: PacketHeader::new(0, packet_type, PacketId::default()),
            payload: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn from_parts(header: PacketHeader, payload: BytesMut) -> Packet {
        let capacity = payload.len();
        Packet {
            header,
            payload,
            capacity,
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn packet_id(&self) -> PacketId {
        self.header.packet_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    pub fn remaining_capacity(&self) -> usize {
        self.capacity.saturating_sub(self.payload.len())
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Appends a field at the end of the payload. Returns `false` without changing the packet if
    ///  the field does not fit.
    #[must_use]
    pub fn push<T: WireField>(&mut self, value: &T) -> bool {
        if value.wire_len() > self.remaining_capacity() {
            return false;
        }
        value.put(&mut self.payload);
        true
    }

    /// Appends raw bytes without a length prefix
    #[must_use]
    pub fn push_slice(&mut self, data: &[u8]) -> bool {
        if data.len() > self.remaining_capacity() {
            return false;
        }
        self.payload.put_slice(data);
        true
    }

    /// Consumes a field from the start of the payload
    pub fn pop<T: WireField>(&mut self) -> anyhow::Result<T> {
        T::take(&mut self.payload)
    }

    pub fn take_payload(&mut self) -> BytesMut {
        self.payload.split()
    }

    /// Replaces the payload, e.g. after encryption. Capacity grows if necessary so the new
    ///  payload is always accepted.
    pub fn set_payload(&mut self, payload: BytesMut) {
        self.capacity = self.capacity.max(payload.len());
        self.payload = payload;
    }

    pub fn serialized_len(&self) -> usize {
        PacketHeader::SERIALIZED_LEN + self.payload.len()
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        self.header.ser(buf);
        buf.put_slice(&self.payload);
    }

    /// parses a datagram as a whole, the payload is everything after the header
    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Packet> {
        let header = PacketHeader::deser(buf)?;
        let payload = BytesMut::from(buf.copy_to_bytes(buf.remaining()).as_ref());
        Ok(Packet::from_parts(header, payload))
    }
}
