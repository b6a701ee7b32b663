use crate::{CompactHeightfield, RegionId, region_merge::RegionError};

impl CompactHeightfield {
    /// Builds region data for the heightfield by partitioning it into non-overlapping layers.
    ///
    /// The heightfield is first swept into monotone regions, which are then merged into layers
    /// that never stack on top of themselves. This is well suited for tiled navmeshes with small tiles.
    ///
    /// - `border_size`: The size of the non-navigable border around the heightfield. [Limits: >=0] [Units: vx]
    /// - `min_region_area`: The minimum number of cells allowed to form isolated island areas. [Limits: >=0] [Units: vx]
    pub fn build_layer_regions(
        &mut self,
        border_size: u16,
        min_region_area: u16,
    ) -> Result<(), RegionError> {
        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let region_id = self.sweep_monotone_regions(border_size, &mut src_reg)?;
        self.border_size = border_size;

        // Merge monotone regions to layers and remove small regions.
        self.max_region =
            self.merge_and_filter_layer_regions(min_region_area as usize, region_id, &mut src_reg);

        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        Ok(())
    }
}
