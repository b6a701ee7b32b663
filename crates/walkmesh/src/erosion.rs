use crate::{CompactHeightfield, span::AreaType};

impl CompactHeightfield {
    /// Erode the walkable area by agent radius.
    ///
    /// Every walkable span closer than `walkable_radius` to a non-walkable span or
    /// to the edge of the walkable surface becomes [`AreaType::NOT_WALKABLE`].
    ///
    /// - `walkable_radius`: The radius of erosion. [Limits: 0 < value < 255] [Units: vx]
    pub fn erode_walkable_area(&mut self, walkable_radius: u16) {
        let mut distance_to_boundary = vec![u16::MAX; self.spans.len()];

        // Mark boundary cells.
        for (x, z, span_index) in self.iter_spans() {
            if !self.areas[span_index].is_walkable() {
                distance_to_boundary[span_index] = 0;
                continue;
            }
            // Check that there is a non-null adjacent span in each of the 4 cardinal directions.
            let neighbor_count = (0..4)
                .filter_map(|dir| self.neighbor(x as i32, z as i32, span_index, dir))
                .filter(|(_, _, neighbor)| self.areas[*neighbor].is_walkable())
                .count();
            // At least one missing neighbour, so this is a boundary cell.
            if neighbor_count != 4 {
                distance_to_boundary[span_index] = 0;
            }
        }

        self.sweep_chamfer_distance(&mut distance_to_boundary);

        let min_boundary_distance = walkable_radius.saturating_mul(2).min(u8::MAX as u16);
        for (area, distance) in self.areas.iter_mut().zip(distance_to_boundary) {
            if distance.min(u8::MAX as u16) < min_boundary_distance {
                *area = AreaType::NOT_WALKABLE;
            }
        }
    }

    /// Applies a median filter to walkable area types (based on area id), removing noise.
    ///
    /// Each walkable span takes the median area of itself and its 8 neighbors.
    /// Missing or non-walkable neighbors count as the span's own area.
    pub fn median_filter_walkable_area(&mut self) {
        let mut areas = self.areas.clone();
        for (x, z, i) in self.iter_spans() {
            let area = self.areas[i];
            if !area.is_walkable() {
                continue;
            }
            let mut neighborhood = [area; 9];
            for dir in 0..4 {
                let Some((ax, az, a_index)) = self.neighbor(x as i32, z as i32, i, dir) else {
                    continue;
                };
                if self.areas[a_index].is_walkable() {
                    neighborhood[dir as usize * 2] = self.areas[a_index];
                }
                let diagonal = (dir + 1) & 0x3;
                let Some((_, _, aa_index)) = self.neighbor(ax, az, a_index, diagonal) else {
                    continue;
                };
                if self.areas[aa_index].is_walkable() {
                    neighborhood[dir as usize * 2 + 1] = self.areas[aa_index];
                }
            }
            insertion_sort(&mut neighborhood);
            areas[i] = neighborhood[4];
        }
        self.areas = areas;
    }
}

fn insertion_sort(values: &mut [AreaType]) {
    for i in 1..values.len() {
        let value = values[i];
        let mut j = i;
        while j > 0 && values[j - 1] > value {
            values[j] = values[j - 1];
            j -= 1;
        }
        values[j] = value;
    }
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3, Vec3A};

    use crate::{Aabb3d, HeightfieldBuilder, TriMesh};

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

    fn area_at(field: &CompactHeightfield, x: u16, z: u16) -> AreaType {
        field.areas[field.cell_at(x, z).index() as usize]
    }

    #[test]
    fn erosion_removes_border_ring() {
        let mut field = flat_field(10.0);
        field.erode_walkable_area(1);
        // Border spans have distance 0, their inner neighbors have distance 2 which equals the threshold.
        assert_eq!(area_at(&field, 0, 0), AreaType::NOT_WALKABLE);
        assert_eq!(area_at(&field, 0, 5), AreaType::NOT_WALKABLE);
        assert_eq!(area_at(&field, 1, 5), AreaType(1));
        assert_eq!(area_at(&field, 5, 5), AreaType(1));
    }

    #[test]
    fn larger_radius_erodes_further() {
        let mut field = flat_field(10.0);
        field.erode_walkable_area(2);
        assert_eq!(area_at(&field, 1, 5), AreaType::NOT_WALKABLE);
        assert_eq!(area_at(&field, 2, 5), AreaType(1));
        // The inner corner is two axis steps away from the border on both axes.
        assert_eq!(area_at(&field, 2, 2), AreaType(1));
    }

    #[test]
    fn median_filter_removes_single_outlier() {
        let mut field = flat_field(5.0);
        let center = field.cell_at(2, 2).index() as usize;
        field.areas[center] = AreaType(9);
        field.median_filter_walkable_area();
        assert_eq!(field.areas[center], AreaType(1));
        assert!(field.areas.iter().all(|area| *area == AreaType(1)));
    }

    #[test]
    fn insertion_sort_sorts() {
        let mut values = [AreaType(3), AreaType(1), AreaType(2), AreaType(1)];
        insertion_sort(&mut values);
        assert_eq!(
            values,
            [AreaType(1), AreaType(1), AreaType(2), AreaType(3)]
        );
    }
}
