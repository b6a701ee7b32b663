use crate::{CompactHeightfield, RegionId, region_merge::RegionError};

/// The region seen below a row segment during a sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum SweepNeighbor {
    #[default]
    None,
    Unique(RegionId),
    /// The segment touches more than one region in the previous row.
    Ambiguous,
}

#[derive(Debug, Clone, Copy, Default)]
struct SweepSpan {
    /// The region the segment is remapped to
    id: RegionId,
    /// Number of spans connecting the segment to its neighbor region
    samples: u16,
    neighbor: SweepNeighbor,
}

impl CompactHeightfield {
    /// Builds region data for the heightfield using simple monotone partitioning.
    ///
    /// Monotone partitioning is fast and always produces regions without holes or overlaps,
    /// but the regions can be long and thin.
    ///
    /// See [`CompactHeightfield::build_regions`] for the meaning of the parameters.
    /// Unlike watershed partitioning, this does not need the distance field.
    pub fn build_regions_monotone(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), RegionError> {
        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let region_id = self.sweep_monotone_regions(border_size, &mut src_reg)?;
        self.border_size = border_size;

        // Merge regions and filter out small regions.
        let (max_region, _overlaps) = self.merge_and_filter_regions(
            min_region_area as usize,
            merge_region_area as usize,
            region_id,
            &mut src_reg,
        );
        // Monotone partitioning does not generate overlapping regions.
        self.max_region = max_region;

        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        Ok(())
    }

    /// Sweeps the heightfield row by row, starting a new region for each row segment
    /// unless the segment continues exactly one region of the previous row.
    ///
    /// Returns the next free region id.
    pub(crate) fn sweep_monotone_regions(
        &self,
        border_size: u16,
        src_reg: &mut [RegionId],
    ) -> Result<RegionId, RegionError> {
        let mut id = RegionId::from(1);

        // Mark border regions.
        if border_size > 0 {
            id = self.paint_border_regions(border_size, id, src_reg);
        }

        let mut sweeps: Vec<SweepSpan> =
            Vec::with_capacity(self.width.max(self.height) as usize + 1);
        let mut prev: Vec<u16> = Vec::with_capacity(256);

        let max_x = self.width.saturating_sub(border_size);
        let max_z = self.height.saturating_sub(border_size);

        // Sweep one line at a time.
        for z in border_size..max_z {
            // Collect spans from this row.
            prev.clear();
            prev.resize(id.bits() as usize + 1, 0);
            sweeps.clear();
            // Row-local id 0 means "no region".
            sweeps.push(SweepSpan::default());

            for x in border_size..max_x {
                for i in self.cell_at(x, z).index_range() {
                    let area = self.areas[i];
                    if !area.is_walkable() {
                        continue;
                    }

                    // -x
                    let mut previd = self
                        .neighbor(x as i32, z as i32, i, 0)
                        .filter(|(_, _, a_index)| {
                            !src_reg[*a_index].is_border() && self.areas[*a_index] == area
                        })
                        .map_or(0, |(_, _, a_index)| src_reg[a_index].bits() as usize);

                    if previd == 0 {
                        previd = sweeps.len();
                        sweeps.push(SweepSpan::default());
                    }

                    // -z
                    if let Some((_, _, a_index)) = self.neighbor(x as i32, z as i32, i, 3) {
                        let nr = src_reg[a_index];
                        if nr != RegionId::NONE && !nr.is_border() && self.areas[a_index] == area {
                            let sweep = &mut sweeps[previd];
                            match sweep.neighbor {
                                SweepNeighbor::None => {
                                    sweep.neighbor = SweepNeighbor::Unique(nr);
                                    sweep.samples += 1;
                                    prev[nr.bits() as usize] += 1;
                                }
                                SweepNeighbor::Unique(neighbor) if neighbor == nr => {
                                    sweep.samples += 1;
                                    prev[nr.bits() as usize] += 1;
                                }
                                _ => sweep.neighbor = SweepNeighbor::Ambiguous,
                            }
                        }
                    }

                    src_reg[i] = RegionId::from(previd as u16);
                }
            }

            // Create unique ID.
            for sweep in sweeps.iter_mut().skip(1) {
                // If the neighbour is set and there is only one continuous connection to it,
                // the sweep will be merged with the previous one, else new region is created.
                match sweep.neighbor {
                    SweepNeighbor::Unique(neighbor)
                        if prev[neighbor.bits() as usize] == sweep.samples =>
                    {
                        sweep.id = neighbor;
                    }
                    _ => {
                        if id.bits() > RegionId::MAX.bits() {
                            return Err(RegionError::TooManyRegions);
                        }
                        sweep.id = id;
                        id = id.next();
                    }
                }
            }

            // Remap IDs
            for x in border_size..max_x {
                for i in self.cell_at(x, z).index_range() {
                    let region = src_reg[i];
                    if region != RegionId::NONE
                        && !region.is_border()
                        && (region.bits() as usize) < sweeps.len()
                    {
                        src_reg[i] = sweeps[region.bits() as usize].id;
                    }
                }
            }
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3, Vec3A};

    use crate::{Aabb3d, HeightfieldBuilder, TriMesh, span::AreaType};

    use super::*;

    fn quad_field(size: f32) -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(size, 4.0, size),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        let trimesh = TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 1.0, 0.0),
                Vec3A::new(0.0, 1.0, size),
                Vec3A::new(size, 1.0, size),
                Vec3A::new(size, 1.0, 0.0),
            ],
            indices: vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
            area_types: vec![AreaType::DEFAULT_WALKABLE; 2],
        };
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        heightfield.into_compact(2, 1).unwrap()
    }

    #[test]
    fn rectangle_is_one_monotone_region() {
        let mut field = quad_field(8.0);
        field.build_regions_monotone(0, 1, 0).unwrap();
        assert_eq!(field.max_region, RegionId::from(1));
        assert!(field.spans.iter().all(|span| span.region == RegionId::from(1)));
    }

    #[test]
    fn notch_splits_rows() {
        let mut field = quad_field(8.0);
        // A wall along x = 4 for z >= 4 splits the upper rows into two segments.
        for (x, z, i) in field.iter_spans().collect::<Vec<_>>() {
            if x == 4 && z >= 4 {
                field.areas[i] = AreaType::NOT_WALKABLE;
            }
        }
        let mut src_reg = vec![RegionId::NONE; field.spans.len()];
        let next = field.sweep_monotone_regions(0, &mut src_reg).unwrap();
        let lower = src_reg[field.cell_at(0, 0).index() as usize];
        let upper_left = src_reg[field.cell_at(0, 6).index() as usize];
        let upper_right = src_reg[field.cell_at(6, 6).index() as usize];
        assert_ne!(upper_left, upper_right);
        assert_ne!(lower, upper_left);
        assert_ne!(lower, upper_right);
        assert_eq!(next, RegionId::from(4));
    }

    #[test]
    fn sweep_skips_border() {
        let field = quad_field(8.0);
        let mut src_reg = vec![RegionId::NONE; field.spans.len()];
        field.sweep_monotone_regions(2, &mut src_reg).unwrap();
        assert!(src_reg[field.cell_at(0, 0).index() as usize].is_border());
        let inner = src_reg[field.cell_at(4, 4).index() as usize];
        assert!(!inner.is_border());
        assert_eq!(inner, RegionId::from(5));
    }
}
