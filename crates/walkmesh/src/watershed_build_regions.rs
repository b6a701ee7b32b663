use crate::{CompactHeightfield, RegionId, region_merge::RegionError};

impl CompactHeightfield {
    /// Builds region data for the heightfield using watershed partitioning.
    ///
    /// Non-null regions will consist of connected, non-overlapping walkable spans that form a single contour.
    /// Contours will form simple polygons.
    ///
    /// If multiple regions form an area that is smaller than `min_region_area`, then all spans will be
    /// re-assigned to [`RegionId::NONE`].
    ///
    /// Watershed partitioning can result in smaller than necessary regions, especially in diagonal corridors.
    /// `merge_region_area` helps reduce unnecessarily small regions.
    ///
    /// The region data will be available via the [`CompactHeightfield::max_region`]
    /// and [`CompactSpan::region`](crate::CompactSpan::region) fields.
    ///
    /// The distance field must be created using [`CompactHeightfield::build_distance_field`] before attempting to build regions.
    ///
    /// - `border_size`: The size of the non-navigable border around the heightfield. [Limits: >=0] [Units: vx]
    /// - `min_region_area`: The minimum number of cells allowed to form isolated island areas. [Limits: >=0] [Units: vx]
    /// - `merge_region_area`: Any regions with a span count smaller than this value will, if possible,
    ///   be merged with larger regions. [Limits: >=0] [Units: vx]
    pub fn build_regions(
        &mut self,
        border_size: u16,
        min_region_area: u16,
        merge_region_area: u16,
    ) -> Result<(), RegionError> {
        const LOG_NB_STACKS: usize = 3;
        const NB_STACKS: usize = 1 << LOG_NB_STACKS;
        let mut level_stacks: [Vec<LevelStackEntry>; NB_STACKS] = [const { Vec::new() }; NB_STACKS];
        for stack in &mut level_stacks {
            stack.reserve(256);
        }

        let mut stack: Vec<LevelStackEntry> = Vec::with_capacity(256);

        let mut src_reg = vec![RegionId::NONE; self.spans.len()];
        let mut src_dist = vec![0_u16; self.spans.len()];

        let mut region_id = RegionId::from(1);
        let mut level = self.max_distance.saturating_add(1) & !1;

        // expand_iters defines how much the watershed "overflows" and simplifies the regions.
        let expand_iters = 8;

        if border_size > 0 {
            region_id = self.paint_border_regions(border_size, region_id, &mut src_reg);
        }
        self.border_size = border_size;

        let mut s_id = -1_i32;
        while level > 0 {
            level = level.saturating_sub(2);
            s_id = (s_id + 1) & (NB_STACKS as i32 - 1);

            if s_id == 0 {
                self.sort_cells_by_level(level, &src_reg, &mut level_stacks, 1);
            } else {
                // copy left overs from last level
                let (src, dst) = level_stacks.split_at_mut(s_id as usize);
                append_stacks(&src[s_id as usize - 1], &mut dst[0], &src_reg);
            }

            self.expand_regions(
                expand_iters,
                level,
                &mut src_reg,
                &mut src_dist,
                &mut level_stacks[s_id as usize],
                false,
            );

            // Mark new regions with IDs.
            for j in 0..level_stacks[s_id as usize].len() {
                let entry = level_stacks[s_id as usize][j].clone();
                let Some(i) = entry.index else {
                    continue;
                };
                if src_reg[i] != RegionId::NONE {
                    continue;
                }
                if self.flood_region(entry, level, region_id, &mut src_reg, &mut src_dist, &mut stack)
                {
                    if region_id == RegionId::MAX {
                        return Err(RegionError::TooManyRegions);
                    }
                    region_id = region_id.next();
                }
            }
        }

        // Expand current regions until no empty connected cells found.
        self.expand_regions(
            expand_iters * 8,
            0,
            &mut src_reg,
            &mut src_dist,
            &mut stack,
            true,
        );

        // Merge regions and filter out small regions.
        let (max_region, overlaps) = self.merge_and_filter_regions(
            min_region_area as usize,
            merge_region_area as usize,
            region_id,
            &mut src_reg,
        );
        self.max_region = max_region;

        if !overlaps.is_empty() {
            tracing::warn!("Watershed partitioning produced {} overlapping regions.", overlaps.len());
        }

        // Write the result out.
        for (span, region) in self.spans.iter_mut().zip(src_reg) {
            span.region = region;
        }
        Ok(())
    }

    /// Paints the four border strips of the heightfield with their own border regions.
    /// Returns the next free region id.
    pub(crate) fn paint_border_regions(
        &self,
        border_size: u16,
        mut region_id: RegionId,
        src_reg: &mut [RegionId],
    ) -> RegionId {
        // Make sure border will not overflow.
        let border_width = border_size.min(self.width);
        let border_height = border_size.min(self.height);
        let rects = [
            (0, border_width, 0, self.height),
            (self.width - border_width, self.width, 0, self.height),
            (0, self.width, 0, border_height),
            (0, self.width, self.height - border_height, self.height),
        ];
        for (min_x, max_x, min_z, max_z) in rects {
            self.paint_rect_region(
                min_x,
                max_x,
                min_z,
                max_z,
                region_id | RegionId::BORDER_REGION,
                src_reg,
            );
            region_id = region_id.next();
        }
        region_id
    }

    fn paint_rect_region(
        &self,
        min_x: u16,
        max_x: u16,
        min_z: u16,
        max_z: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
    ) {
        for z in min_z..max_z {
            for x in min_x..max_x {
                for i in self.cell_at(x, z).index_range() {
                    if self.areas[i].is_walkable() {
                        src_reg[i] = region;
                    }
                }
            }
        }
    }

    fn sort_cells_by_level(
        &self,
        start_level: u16,
        src_reg: &[RegionId],
        stacks: &mut [Vec<LevelStackEntry>],
        log_levels_per_stack: u16,
    ) {
        let start_level = start_level >> log_levels_per_stack;
        for stack in stacks.iter_mut() {
            stack.clear();
        }

        // put all cells in the level range into the appropriate stacks
        for (x, z, i) in self.iter_spans() {
            if !self.areas[i].is_walkable() || src_reg[i] != RegionId::NONE {
                continue;
            }
            let level = self.dist[i] >> log_levels_per_stack;
            let s_id = start_level.saturating_sub(level) as usize;
            if s_id >= stacks.len() {
                continue;
            }
            stacks[s_id].push(LevelStackEntry {
                x,
                z,
                index: Some(i),
            });
        }
    }

    fn expand_regions(
        &self,
        max_iter: u16,
        level: u16,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
        fill_stack: bool,
    ) {
        if fill_stack {
            // Find cells revealed by the raised level.
            stack.clear();
            for (x, z, i) in self.iter_spans() {
                if self.dist[i] >= level
                    && src_reg[i] == RegionId::NONE
                    && self.areas[i].is_walkable()
                {
                    stack.push(LevelStackEntry {
                        x,
                        z,
                        index: Some(i),
                    });
                }
            }
        } else {
            // use cells in the input stack
            // mark all cells which already have a region
            for entry in stack.iter_mut() {
                if entry.index.is_some_and(|i| src_reg[i] != RegionId::NONE) {
                    entry.index = None;
                }
            }
        }

        let mut dirty_entries = Vec::new();
        let mut iter = 0;
        while !stack.is_empty() {
            let mut failed = 0;
            dirty_entries.clear();

            for entry in stack.iter_mut() {
                let Some(i) = entry.index else {
                    failed += 1;
                    continue;
                };

                let mut r = src_reg[i];
                let mut d2 = u16::MAX;
                let area = self.areas[i];
                for dir in 0..4 {
                    let Some((_, _, a_index)) =
                        self.neighbor(entry.x as i32, entry.z as i32, i, dir)
                    else {
                        continue;
                    };
                    if self.areas[a_index] != area {
                        continue;
                    }
                    let a_region = src_reg[a_index];
                    let a_dist = src_dist[a_index].saturating_add(2);
                    if a_region != RegionId::NONE && !a_region.is_border() && a_dist < d2 {
                        r = a_region;
                        d2 = a_dist;
                    }
                }
                if r != RegionId::NONE {
                    // Mark as used
                    entry.index = None;
                    dirty_entries.push(DirtyEntry {
                        index: i,
                        region: r,
                        distance2: d2,
                    });
                } else {
                    failed += 1;
                }
            }
            // Copy entries that differ between src and dst to keep them in sync.
            for dirty_entry in &dirty_entries {
                src_reg[dirty_entry.index] = dirty_entry.region;
                src_dist[dirty_entry.index] = dirty_entry.distance2;
            }

            if failed == stack.len() {
                break;
            }

            if level > 0 {
                iter += 1;
                if iter >= max_iter {
                    break;
                }
            }
        }
    }

    /// Floods a new region starting at `start`, claiming every connected span of the same area
    /// whose distance is at least `level - 2`.
    ///
    /// Returns whether any span was claimed.
    fn flood_region(
        &self,
        start: LevelStackEntry,
        level: u16,
        region: RegionId,
        src_reg: &mut [RegionId],
        src_dist: &mut [u16],
        stack: &mut Vec<LevelStackEntry>,
    ) -> bool {
        let Some(start_index) = start.index else {
            return false;
        };
        let area = self.areas[start_index];

        // Flood fill mark region.
        stack.clear();
        stack.push(start);
        src_reg[start_index] = region;
        src_dist[start_index] = 0;

        let lev = level.saturating_sub(2);
        let mut count = 0;

        while let Some(entry) = stack.pop() {
            let Some(ci) = entry.index else {
                continue;
            };
            let (cx, cz) = (entry.x as i32, entry.z as i32);

            // Check if any of the neighbours already have a valid region set.
            let mut neighbor_region = RegionId::NONE;
            for dir in 0..4 {
                // 8 connected
                let Some((ax, az, a_index)) = self.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                if self.areas[a_index] != area {
                    continue;
                }
                let nr = src_reg[a_index];
                // Do not take borders into account.
                if nr.is_border() {
                    continue;
                }
                if nr != RegionId::NONE && nr != region {
                    neighbor_region = nr;
                    break;
                }

                let dir2 = (dir + 1) & 0x3;
                let Some((_, _, a_index2)) = self.neighbor(ax, az, a_index, dir2) else {
                    continue;
                };
                if self.areas[a_index2] != area {
                    continue;
                }
                let nr2 = src_reg[a_index2];
                if nr2 != RegionId::NONE && nr2 != region {
                    neighbor_region = nr2;
                    break;
                }
            }
            if neighbor_region != RegionId::NONE {
                src_reg[ci] = RegionId::NONE;
                continue;
            }

            count += 1;

            // Expand neighbours.
            for dir in 0..4 {
                let Some((ax, az, a_index)) = self.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                if self.areas[a_index] != area {
                    continue;
                }
                if self.dist[a_index] >= lev && src_reg[a_index] == RegionId::NONE {
                    src_reg[a_index] = region;
                    src_dist[a_index] = 0;
                    stack.push(LevelStackEntry {
                        x: ax as u16,
                        z: az as u16,
                        index: Some(a_index),
                    });
                }
            }
        }

        count > 0
    }
}

fn append_stacks(
    src_stack: &[LevelStackEntry],
    dst_stack: &mut Vec<LevelStackEntry>,
    src_reg: &[RegionId],
) {
    for entry in src_stack {
        let Some(i) = entry.index else {
            continue;
        };
        if src_reg[i] != RegionId::NONE {
            continue;
        }
        dst_stack.push(entry.clone());
    }
}

#[derive(Clone, Debug)]
struct LevelStackEntry {
    x: u16,
    z: u16,
    index: Option<usize>,
}

#[derive(Clone, Debug)]
struct DirtyEntry {
    index: usize,
    region: RegionId,
    distance2: u16,
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3, Vec3A};

    use crate::{Aabb3d, HeightfieldBuilder, TriMesh, span::AreaType};

    use super::*;

    fn quad_field(size_x: f32, size_z: f32) -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(size_x, 4.0, size_z),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        let trimesh = TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 1.0, 0.0),
                Vec3A::new(0.0, 1.0, size_z),
                Vec3A::new(size_x, 1.0, size_z),
                Vec3A::new(size_x, 1.0, 0.0),
            ],
            indices: vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
            area_types: vec![AreaType::DEFAULT_WALKABLE; 2],
        };
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        heightfield.into_compact(2, 1).unwrap()
    }

    #[test]
    fn flat_square_becomes_single_region() {
        let mut field = quad_field(12.0, 12.0);
        field.build_distance_field();
        field.build_regions(0, 2, 200).unwrap();
        assert_eq!(field.max_region, RegionId::from(1));
        assert!(field.spans.iter().all(|span| span.region == RegionId::from(1)));
    }

    #[test]
    fn border_is_painted_with_border_regions() {
        let mut field = quad_field(12.0, 12.0);
        field.build_distance_field();
        field.build_regions(2, 2, 20).unwrap();
        assert_eq!(field.border_size, 2);
        let corner = field.cell_at(0, 0).index() as usize;
        let edge = field.cell_at(11, 6).index() as usize;
        let center = field.cell_at(6, 6).index() as usize;
        assert!(field.spans[corner].region.is_border());
        assert!(field.spans[edge].region.is_border());
        assert!(!field.spans[center].region.is_border());
        assert_ne!(field.spans[center].region, RegionId::NONE);
    }

    #[test]
    fn tiny_islands_are_removed() {
        let mut field = quad_field(12.0, 12.0);
        // Cut off a single span from the rest of the surface.
        for (x, z, i) in field.iter_spans().collect::<Vec<_>>() {
            if (x == 4 || x == 6 || z == 4 || z == 6) && (4..=6).contains(&x) && (4..=6).contains(&z)
            {
                field.areas[i] = AreaType::NOT_WALKABLE;
            }
        }
        field.build_distance_field();
        field.build_regions(0, 4, 20).unwrap();
        let island = field.cell_at(5, 5).index() as usize;
        assert_eq!(field.spans[island].region, RegionId::NONE);
        let outer = field.cell_at(0, 0).index() as usize;
        assert_ne!(field.spans[outer].region, RegionId::NONE);
    }
}
