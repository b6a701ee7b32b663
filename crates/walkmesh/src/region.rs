bitflags::bitflags! {
    /// The id of the region a span of a [`CompactHeightfield`](crate::CompactHeightfield) belongs to.
    ///
    /// The lower 15 bits hold the id itself, the highest bit marks regions that belong to the border of a tile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionId: u16 {
        /// The default region, which is used for spans that are not in a region, i.e. not walkable.
        const NONE = 0;

        /// Heightfield border flag.
        /// If a heightfield region ID has this bit set, then the region is a border
        /// region and its spans are considered un-walkable.
        /// (Used during the region and contour build process.)
        const BORDER_REGION = 0x8000;

        /// The largest possible region id.
        const MAX = 0x7fff;
    }
}

impl RegionId {
    /// Returns the id without the [`RegionId::BORDER_REGION`] flag.
    #[inline]
    pub fn id(self) -> u16 {
        (self & Self::MAX).bits()
    }

    /// Returns whether this is a region along the border of the heightfield.
    #[inline]
    pub fn is_border(self) -> bool {
        self.contains(Self::BORDER_REGION)
    }

    /// Returns the next region id.
    #[inline]
    pub(crate) fn next(self) -> Self {
        Self::from_bits_retain(self.bits().wrapping_add(1))
    }
}

impl From<u16> for RegionId {
    fn from(value: u16) -> Self {
        Self::from_bits_retain(value)
    }
}

impl From<RegionId> for u16 {
    fn from(value: RegionId) -> Self {
        value.bits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_flag_is_separate_from_id() {
        let region = RegionId::from(5) | RegionId::BORDER_REGION;
        assert!(region.is_border());
        assert_eq!(region.id(), 5);
        assert!(!RegionId::from(5).is_border());
        assert_eq!(RegionId::NONE.next(), RegionId::from(1));
    }
}
