//! The distance field used by watershed partitioning.
//!
//! Every span stores its distance to the closest border of its area. Borders are walkable surface
//! edges as well as transitions between different area types. Distances are measured with a chamfer
//! metric: 2 per axis step, 3 per diagonal step.

use crate::CompactHeightfield;

impl CompactHeightfield {
    /// Prepare for region partitioning, by calculating distance field along the walkable surface.
    ///
    /// Fills [`CompactHeightfield::dist`] and [`CompactHeightfield::max_distance`].
    pub fn build_distance_field(&mut self) {
        let mut src = vec![u16::MAX; self.spans.len()];
        self.max_distance = self.calculate_distance_field(&mut src);
        let mut dst = vec![0_u16; self.spans.len()];
        self.box_blur(1, &src, &mut dst);
        self.dist = dst;
    }

    /// Computes the raw distance field into `distances` and returns the largest distance.
    fn calculate_distance_field(&self, distances: &mut [u16]) -> u16 {
        // Mark boundary cells.
        for (x, z, i) in self.iter_spans() {
            let area = self.areas[i];
            let same_area_neighbors = (0..4)
                .filter_map(|dir| self.neighbor(x as i32, z as i32, i, dir))
                .filter(|(_, _, neighbor)| self.areas[*neighbor] == area)
                .count();
            if same_area_neighbors != 4 {
                distances[i] = 0;
            }
        }
        self.sweep_chamfer_distance(distances);
        distances.iter().copied().max().unwrap_or(0)
    }

    /// Propagates distances from the spans with distance 0 over the whole field with two raster sweeps.
    pub(crate) fn sweep_chamfer_distance(&self, distances: &mut [u16]) {
        // Pass 1: (-1, 0), (-1, -1), (0, -1), (1, -1)
        for z in 0..self.height as i32 {
            for x in 0..self.width as i32 {
                for i in self.cell_at(x as u16, z as u16).index_range() {
                    self.relax_distance(distances, x, z, i, [(0, 3), (3, 2)]);
                }
            }
        }
        // Pass 2: (1, 0), (1, 1), (0, 1), (-1, 1)
        for z in (0..self.height as i32).rev() {
            for x in (0..self.width as i32).rev() {
                for i in self.cell_at(x as u16, z as u16).index_range() {
                    self.relax_distance(distances, x, z, i, [(2, 1), (1, 0)]);
                }
            }
        }
    }

    /// For each `(axis, diagonal)` pair, looks at the neighbor along `axis` (cost 2) and from there
    /// at its neighbor along `diagonal` (cost 3).
    fn relax_distance(
        &self,
        distances: &mut [u16],
        x: i32,
        z: i32,
        index: usize,
        directions: [(u8, u8); 2],
    ) {
        for (axis, diagonal) in directions {
            let Some((ax, az, a_index)) = self.neighbor(x, z, index, axis) else {
                continue;
            };
            let new_distance = distances[a_index].saturating_add(2);
            if new_distance < distances[index] {
                distances[index] = new_distance;
            }
            let Some((_, _, aa_index)) = self.neighbor(ax, az, a_index, diagonal) else {
                continue;
            };
            let new_distance = distances[aa_index].saturating_add(3);
            if new_distance < distances[index] {
                distances[index] = new_distance;
            }
        }
    }

    /// Smooths the distance field with a 3x3 box filter.
    /// Spans at or below `threshold` distance from a border keep their value.
    fn box_blur(&self, threshold: u16, src: &[u16], dst: &mut [u16]) {
        let threshold = threshold * 2;
        for (x, z, i) in self.iter_spans() {
            let center = src[i];
            if center <= threshold {
                dst[i] = center;
                continue;
            }
            let mut sum = center as u32;
            for dir in 0..4 {
                let Some((ax, az, a_index)) = self.neighbor(x as i32, z as i32, i, dir) else {
                    sum += center as u32 * 2;
                    continue;
                };
                sum += src[a_index] as u32;
                let diagonal = (dir + 1) & 0x3;
                match self.neighbor(ax, az, a_index, diagonal) {
                    Some((_, _, aa_index)) => sum += src[aa_index] as u32,
                    None => sum += center as u32,
                }
            }
            dst[i] = ((sum + 5) / 9) as u16;
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3, Vec3A};

    use crate::{Aabb3d, AreaType, HeightfieldBuilder, TriMesh};

    use super::*;

    fn flat_field(size: f32) -> CompactHeightfield {
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
            area_types: vec![AreaType(1); 2],
        };
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        heightfield.into_compact(2, 1).unwrap()
    }

    #[test]
    fn distance_grows_towards_the_center() {
        let mut field = flat_field(9.0);
        field.build_distance_field();
        let dist = |x, z| field.dist[field.cell_at(x, z).index() as usize];
        assert_eq!(dist(0, 4), 0);
        assert_eq!(dist(1, 4), 2);
        assert!(dist(4, 4) > dist(2, 4));
        // The raw distance at the center is 4 axis steps away from the border.
        assert_eq!(field.max_distance, 8);
    }

    #[test]
    fn area_transitions_are_borders() {
        let mut field = flat_field(9.0);
        let center = field.cell_at(4, 4).index() as usize;
        field.areas[center] = AreaType(2);
        field.build_distance_field();
        assert_eq!(field.dist[center], 0);
        assert_eq!(field.dist[field.cell_at(5, 4).index() as usize], 0);
    }
}
