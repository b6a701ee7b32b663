//! Stamping area types into a [`CompactHeightfield`] with simple shapes.

use glam::{IVec3, Vec2, Vec3, Vec3A, Vec3Swizzles as _};

use crate::{Aabb3d, AreaType, CompactHeightfield};

/// Describes how an area stamp changes the [`AreaType`] of a span.
///
/// The new area is `(value & mask) | (old & !mask)`, so only the bits in `mask` are taken from `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct AreaModification {
    /// The bits to set
    pub value: u8,
    /// Which bits of the old area to replace
    pub mask: u8,
}

impl AreaModification {
    /// Creates a modification that only touches the bits in `mask`.
    pub const fn new(value: u8, mask: u8) -> Self {
        Self { value, mask }
    }

    /// Applies the modification to an area.
    #[inline]
    pub fn apply(&self, area: AreaType) -> AreaType {
        AreaType((self.value & self.mask) | (area.0 & !self.mask))
    }
}

impl From<AreaType> for AreaModification {
    fn from(area: AreaType) -> Self {
        Self {
            value: area.0,
            mask: u8::MAX,
        }
    }
}

/// A convex polygon on the xz-plane, extruded between two heights. Used to mark areas with
/// [`CompactHeightfield::mark_convex_poly_area`].
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ConvexVolume {
    /// The outline of the volume. Only the x and z components are used.
    pub vertices: Vec<Vec3A>,
    /// The height of the floor of the volume
    pub min_y: f32,
    /// The height of the ceiling of the volume
    pub max_y: f32,
    /// The area to stamp into spans within the volume
    pub area: AreaModification,
}

impl ConvexVolume {
    /// Creates a new convex volume.
    pub fn new(
        vertices: Vec<Vec3A>,
        min_y: f32,
        max_y: f32,
        area: impl Into<AreaModification>,
    ) -> Self {
        Self {
            vertices,
            min_y,
            max_y,
            area: area.into(),
        }
    }

    /// Returns the AABB of the volume, or `None` if it has no vertices.
    pub fn aabb(&self) -> Option<Aabb3d> {
        let mut aabb = Aabb3d::from_verts(&self.vertices)?;
        aabb.min.y = self.min_y;
        aabb.max.y = self.max_y;
        Some(aabb)
    }

    /// Returns a copy of the volume with the outline moved outwards by `distance`.
    /// Negative distances shrink the outline.
    ///
    /// Sharp corners are beveled with two vertices instead of being extended into a long miter.
    /// Returns `None` if the outline has fewer than 3 vertices.
    pub fn offset(&self, distance: f32) -> Option<Self> {
        const MITER_LIMIT: f32 = 1.20;
        let n = self.vertices.len();
        if n < 3 {
            return None;
        }
        // Work on an outline with positive signed area on the xz-plane, for which the
        // left-hand normals of the edges point inwards.
        let mut outline = self.vertices.clone();
        let signed_area: f32 = (0..n)
            .map(|i| {
                let a = outline[i].xz();
                let b = outline[(i + 1) % n].xz();
                a.perp_dot(b)
            })
            .sum();
        if signed_area < 0.0 {
            outline.reverse();
        }

        let mut vertices = Vec::with_capacity(n * 2);
        for i in 0..n {
            let a = outline[(i + n - 1) % n];
            let b = outline[i];
            let c = outline[(i + 1) % n];

            let previous_dir = (b.xz() - a.xz()).normalize_or_zero();
            let current_dir = (c.xz() - b.xz()).normalize_or_zero();
            // The y component of the cross product.
            let cross = current_dir.x * previous_dir.y - previous_dir.x * current_dir.y;

            // Perpendicular vectors to AB and BC.
            let previous_normal = Vec2::new(-previous_dir.y, previous_dir.x);
            let current_normal = Vec2::new(-current_dir.y, current_dir.x);

            // Average the two segment normals.
            let mut miter = (previous_normal + current_normal) * 0.5;
            let miter_length_squared = miter.length_squared();
            let bevel = miter_length_squared * MITER_LIMIT * MITER_LIMIT < 1.0;
            if miter_length_squared > 1e-6 {
                miter /= miter_length_squared;
            }

            if bevel && cross < 0.0 {
                let d = (1.0 - previous_dir.dot(current_dir)) * 0.5;
                let first = b.xz() + (-previous_normal + previous_dir * d) * distance;
                let second = b.xz() + (-current_normal - current_dir * d) * distance;
                vertices.push(Vec3A::new(first.x, b.y, first.y));
                vertices.push(Vec3A::new(second.x, b.y, second.y));
            } else {
                let moved = b.xz() - miter * distance;
                vertices.push(Vec3A::new(moved.x, b.y, moved.y));
            }
        }

        Some(Self {
            vertices,
            min_y: self.min_y,
            max_y: self.max_y,
            area: self.area,
        })
    }
}

impl CompactHeightfield {
    /// Applies the area modification to all walkable spans whose floor lies inside the box.
    pub fn mark_box_area(&mut self, aabb: Aabb3d, area: impl Into<AreaModification>) {
        let area = area.into();
        let Some((min, max)) = self.grid_footprint(aabb) else {
            return;
        };
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                self.modify_column(x, z, min.y, max.y, area);
            }
        }
    }

    /// Applies the area modification of the volume to all walkable spans whose column center lies
    /// inside the polygon and whose floor lies between the volume's heights.
    pub fn mark_convex_poly_area(&mut self, volume: &ConvexVolume) {
        // Compute the bounding box of the polygon
        let Some(aabb) = volume.aabb() else {
            // The volume is empty
            return;
        };
        let Some((min, max)) = self.grid_footprint(aabb) else {
            return;
        };
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                let point = self.column_center(x, z);
                if point_in_poly(point, &volume.vertices) {
                    self.modify_column(x, z, min.y, max.y, volume.area);
                }
            }
        }
    }

    /// Applies the area modification to all walkable spans inside an upright cylinder
    /// standing on `position`.
    pub fn mark_cylinder_area(
        &mut self,
        position: Vec3,
        radius: f32,
        height: f32,
        area: impl Into<AreaModification>,
    ) {
        let area = area.into();
        let aabb = Aabb3d {
            min: Vec3::new(position.x - radius, position.y, position.z - radius),
            max: Vec3::new(position.x + radius, position.y + height, position.z + radius),
        };
        let Some((min, max)) = self.grid_footprint(aabb) else {
            return;
        };
        let radius_squared = radius * radius;
        for z in min.z..=max.z {
            for x in min.x..=max.x {
                let point = self.column_center(x, z);
                if point.distance_squared(position.xz()) < radius_squared {
                    self.modify_column(x, z, min.y, max.y, area);
                }
            }
        }
    }

    /// Maps an AABB to the range of cells it covers, clamped to the grid.
    /// The y components are in span height units and not clamped.
    /// Returns `None` if the AABB lies entirely outside the grid.
    fn grid_footprint(&self, aabb: Aabb3d) -> Option<(IVec3, IVec3)> {
        let to_grid = |v: Vec3| {
            let v = v - self.aabb.min;
            IVec3::new(
                (v.x / self.cell_size) as i32,
                (v.y / self.cell_height) as i32,
                (v.z / self.cell_size) as i32,
            )
        };
        let mut min = to_grid(aabb.min);
        let mut max = to_grid(aabb.max);

        // Early-out if the shape lies entirely outside the grid.
        if max.x < 0 || min.x >= self.width as i32 || max.z < 0 || min.z >= self.height as i32 {
            return None;
        }

        // Clamp the footprint to the grid
        min.x = min.x.max(0);
        max.x = max.x.min(self.width as i32 - 1);
        min.z = min.z.max(0);
        max.z = max.z.min(self.height as i32 - 1);
        Some((min, max))
    }

    #[inline]
    fn column_center(&self, x: i32, z: i32) -> Vec2 {
        self.aabb.min.xz() + (Vec2::new(x as f32, z as f32) + 0.5) * self.cell_size
    }

    fn modify_column(&mut self, x: i32, z: i32, min_y: i32, max_y: i32, area: AreaModification) {
        for i in self.cell_at(x as u16, z as u16).index_range() {
            // Skip if span is removed.
            if !self.areas[i].is_walkable() {
                continue;
            }
            let y = self.spans[i].y as i32;
            // Skip if y extents don't overlap.
            if y < min_y || y > max_y {
                continue;
            }
            self.areas[i] = area.apply(self.areas[i]);
        }
    }
}

/// Crossing number test on the xz-plane.
fn point_in_poly(point: Vec2, vertices: &[Vec3A]) -> bool {
    let Some(last) = vertices.last() else {
        return false;
    };
    let mut inside = false;
    let mut j = last.xz();
    for vertex in vertices {
        let i = vertex.xz();
        if ((i.y > point.y) != (j.y > point.y))
            && (point.x < (j.x - i.x) * (point.y - i.y) / (j.y - i.y) + i.x)
        {
            inside = !inside;
        }
        j = i;
    }
    inside
}

#[cfg(test)]
mod tests {
    use glam::UVec3;

    use crate::{HeightfieldBuilder, TriMesh};

    use super::*;

    fn flat_field() -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(10.0, 4.0, 10.0),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        let trimesh = TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 1.0, 0.0),
                Vec3A::new(0.0, 1.0, 10.0),
                Vec3A::new(10.0, 1.0, 10.0),
                Vec3A::new(10.0, 1.0, 0.0),
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

    fn square(min: f32, max: f32) -> Vec<Vec3A> {
        vec![
            Vec3A::new(min, 0.0, min),
            Vec3A::new(min, 0.0, max),
            Vec3A::new(max, 0.0, max),
            Vec3A::new(max, 0.0, min),
        ]
    }

    #[test]
    fn area_modification_respects_mask() {
        let modification = AreaModification::new(0b1010, 0b0011);
        assert_eq!(modification.apply(AreaType(0b1101)), AreaType(0b1110));
        let full: AreaModification = AreaType(7).into();
        assert_eq!(full.apply(AreaType(200)), AreaType(7));
    }

    #[test]
    fn marks_convex_polygon() {
        let mut field = flat_field();
        field.mark_convex_poly_area(&ConvexVolume::new(square(2.0, 5.0), 0.0, 4.0, AreaType(5)));
        assert_eq!(area_at(&field, 3, 3), AreaType(5));
        assert_eq!(area_at(&field, 2, 4), AreaType(5));
        assert_eq!(area_at(&field, 5, 3), AreaType(1));
        assert_eq!(area_at(&field, 8, 8), AreaType(1));
    }

    #[test]
    fn volume_below_spans_does_not_mark() {
        let mut field = flat_field();
        field.mark_convex_poly_area(&ConvexVolume::new(square(2.0, 5.0), -4.0, -1.0, AreaType(5)));
        assert!(field.areas.iter().all(|area| *area == AreaType(1)));
    }

    #[test]
    fn marks_box_and_cylinder() {
        let mut field = flat_field();
        field.mark_box_area(
            Aabb3d {
                min: Vec3::new(0.0, 0.0, 0.0),
                max: Vec3::new(1.5, 3.0, 1.5),
            },
            AreaType(3),
        );
        assert_eq!(area_at(&field, 1, 1), AreaType(3));
        assert_eq!(area_at(&field, 2, 1), AreaType(1));

        field.mark_cylinder_area(Vec3::new(7.0, 0.0, 7.0), 1.0, 3.0, AreaType(4));
        assert_eq!(area_at(&field, 6, 6), AreaType(4));
        assert_eq!(area_at(&field, 7, 7), AreaType(4));
        assert_eq!(area_at(&field, 8, 8), AreaType(1));
    }

    #[test]
    fn does_not_mark_unwalkable_spans() {
        let mut field = flat_field();
        let index = field.cell_at(3, 3).index() as usize;
        field.areas[index] = AreaType::NOT_WALKABLE;
        field.mark_convex_poly_area(&ConvexVolume::new(square(2.0, 5.0), 0.0, 4.0, AreaType(5)));
        assert_eq!(field.areas[index], AreaType::NOT_WALKABLE);
    }

    #[test]
    fn offset_grows_regardless_of_winding() {
        for vertices in [square(0.0, 2.0), square(0.0, 2.0).into_iter().rev().collect()] {
            let volume = ConvexVolume::new(vertices, 0.0, 1.0, AreaType(1));
            let grown = volume.offset(0.5).unwrap();
            // Right angles are beveled.
            assert_eq!(grown.vertices.len(), 8);
            let aabb = Aabb3d::from_verts(&grown.vertices).unwrap();
            assert!((aabb.min.x + 0.5).abs() < 1e-5);
            assert!((aabb.max.z - 2.5).abs() < 1e-5);
            assert!(point_in_poly(Vec2::new(-0.25, 1.0), &grown.vertices));
            assert!(!point_in_poly(Vec2::new(-0.25, 1.0), &volume.vertices));
        }
    }
}
