use crate::packet::{Packet, WireField};
use crate::packet_id::PacketId;
use anyhow::bail;
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = b'D',
    CloseWrite = b'W',
    /// An ack frame's id is the acknowledged packet id, its data is the ack delay in millis (u16)
    Ack = b'A',
}

/// A sub-record inside a packet. Several frames can share a packet to amortize header overhead.
///
/// ```ascii
/// 0: frame type (u8)
/// 1: frame id (u16)
/// 3: data length (u16)
/// 5: data
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub frame_id: u16,
    pub data: Vec<u8>,
}

impl Frame {
    pub const HEADER_LEN: usize = size_of::<u8>() + size_of::<u16>() + size_of::<u16>();
    pub const ACK_LEN: usize = Self::HEADER_LEN + size_of::<u16>();

    pub fn data(frame_id: u16, data: &[u8]) -> Frame {
        Frame {
            frame_type: FrameType::Data,
            frame_id,
            data: data.to_vec(),
        }
    }

    pub fn close_write(frame_id: u16) -> Frame {
        Frame {
            frame_type: FrameType::CloseWrite,
            frame_id,
            data: Vec::new(),
        }
    }

    pub fn ack(acked_id: PacketId, delay_millis: u16) -> Frame {
        Frame {
            frame_type: FrameType::Ack,
            frame_id: acked_id.to_raw(),
            data: delay_millis.to_be_bytes().to_vec(),
        }
    }

    /// (acked packet id, ack delay in millis) for an ack frame
    pub fn ack_fields(&self) -> anyhow::Result<(PacketId, u16)> {
        if self.frame_type != FrameType::Ack {
            bail!("not an ack frame: {:?}", self.frame_type);
        }
        let delay = (&mut self.data.as_slice()).try_get_u16()?;
        Ok((PacketId::from_raw(self.frame_id), delay))
    }

    /// pops all frames until the packet's payload is exhausted
    pub fn pop_all(packet: &mut Packet) -> anyhow::Result<Vec<Frame>> {
        let mut result = Vec::new();
        while !packet.is_empty() {
            result.push(packet.pop::<Frame>()?);
        }
        Ok(result)
    }
}

impl WireField for Frame {
    fn wire_len(&self) -> usize {
        Self::HEADER_LEN + self.data.len()
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type.into());
        buf.put_u16(self.frame_id);
        buf.put_u16(self.data.len() as u16);
        buf.put_slice(&self.data);
    }

    fn take(buf: &mut BytesMut) -> anyhow::Result<Self> {
        let raw_type = buf.try_get_u8()?;
        let frame_type = match FrameType::try_from(raw_type) {
            Ok(t) => t,
            Err(_) => bail!("unsupported frame type {:x}", raw_type),
        };
        let frame_id = buf.try_get_u16()?;
        let len = buf.try_get_u16()? as usize;
        if buf.remaining() < len {
            bail!("frame length {} exceeds remaining payload {}", len, buf.remaining());
        }
        let data = buf.split_to(len).to_vec();

        Ok(Frame {
            frame_type,
            frame_id,
            data,
        })
    }
}
