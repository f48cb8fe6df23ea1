use std::fmt::{Display, Formatter};

/// A 16-bit packet id. Ids wrap around, so they have no total order: comparison is done with
///  [PacketId::greater_than], which looks at the sign of the 16-bit difference.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct PacketId(u16);

impl Display for PacketId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PacketId {
    const HALF_RANGE: u16 = 0x8000;

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> PacketId {
        PacketId(self.0.wrapping_add(1))
    }

    pub fn plus(&self, offset: u16) -> PacketId {
        PacketId(self.0.wrapping_add(offset))
    }

    /// Number of increments needed to get from `other` to `self`, modulo 2^16
    pub fn distance_from(&self, other: PacketId) -> u16 {
        self.0.wrapping_sub(other.0)
    }

    /// Wraparound-aware 'greater than'. For two different ids, exactly one of them is greater
    ///  than the other: the two are exactly half the id space apart, the numerically bigger
    ///  raw value wins.
    pub fn greater_than(&self, other: PacketId) -> bool {
        id_greater_than(self.0, other.0)
    }
}

pub fn id_greater_than(a: u16, b: u16) -> bool {
    let diff = a.wrapping_sub(b);
    match diff {
        0 => false,
        PacketId::HALF_RANGE => a > b,
        d => d < PacketId::HALF_RANGE,
    }
}
