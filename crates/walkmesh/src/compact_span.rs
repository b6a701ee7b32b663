use crate::region::RegionId;

/// A walkable span in a [`CompactHeightfield`](crate::compact_heightfield::CompactHeightfield).
/// Packed for memory efficiency.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactSpan {
    /// The lower extent of the span. (Measured from the heightfield's base.)
    pub y: u16,
    /// The id of the region the span belongs to. (Or [`RegionId::NONE`] if not in a region.)
    pub region: RegionId,
    /// 24 bits: packed neighbor connection data
    /// 8 bits: the height of the span
    data: u32,
}

impl Default for CompactSpan {
    fn default() -> Self {
        Self {
            y: 0,
            region: RegionId::NONE,
            // All directions start out not connected.
            data: 0x00FF_FFFF,
        }
    }
}

impl CompactSpan {
    /// The value stored for a direction without a neighbor.
    pub const NOT_CONNECTED: u8 = 0x3f;

    /// Sets the neighbor connection data for the given direction.
    /// `None` if the neighbor is not connected.
    #[inline]
    pub fn set_con(&mut self, direction: u8, neighbor: impl Into<Option<u8>>) {
        let shift = (direction as u32 & 0x3) * 6;
        let value =
            neighbor.into().unwrap_or(Self::NOT_CONNECTED) as u32 & Self::NOT_CONNECTED as u32;
        self.data = (self.data & !(0x3f << shift)) | (value << shift);
    }

    /// Returns the index of the neighbor span in the neighbor column, relative to the column's first span.
    /// `None` if the neighbor is not connected.
    #[inline]
    pub fn con(&self, direction: u8) -> Option<u8> {
        let shift = (direction as u32 & 0x3) * 6;
        let value = ((self.data >> shift) & Self::NOT_CONNECTED as u32) as u8;
        (value != Self::NOT_CONNECTED).then_some(value)
    }

    /// Returns the height of the span, i.e. the free space above [`CompactSpan::y`].
    #[inline]
    pub fn height(&self) -> u8 {
        (self.data >> 24) as u8
    }

    /// Sets the height of the span.
    #[inline]
    pub fn set_height(&mut self, height: u8) {
        self.data = (self.data & 0x00FF_FFFF) | ((height as u32) << 24);
    }

    /// Returns an iterator over all connected directions and the neighbor's relative index.
    #[inline]
    pub fn connections(&self) -> impl Iterator<Item = (u8, u8)> + '_ {
        (0..4).filter_map(|dir| self.con(dir).map(|con| (dir, con)))
    }
}
