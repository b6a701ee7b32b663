//! Voxelization of analytic volumes into a [`Heightfield`].
//!
//! Instead of clipping polygons, every column inside the footprint of the shape is intersected with
//! the shape along a vertical line through the column center. The resulting height interval becomes a span.

use glam::{Vec2, Vec3, Vec3Swizzles as _};

use crate::{
    Aabb3d,
    heightfield::{Heightfield, SpanInsertionError},
    span::AreaType,
};

impl Heightfield {
    /// Rasterizes a sphere.
    pub fn rasterize_sphere(
        &mut self,
        center: Vec3,
        radius: f32,
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let bounds = Aabb3d::new(center, Vec3::splat(radius));
        self.rasterize_volume(bounds, area, flag_merge_threshold, |point| {
            intersect_sphere(point, center, radius)
        })
    }

    /// Rasterizes a capsule, i.e. all points within `radius` of the segment from `start` to `end`.
    pub fn rasterize_capsule(
        &mut self,
        start: Vec3,
        end: Vec3,
        radius: f32,
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let bounds = Aabb3d {
            min: start.min(end) - radius,
            max: start.max(end) + radius,
        };
        self.rasterize_volume(bounds, area, flag_merge_threshold, |point| {
            let parts = [
                intersect_sphere(point, start, radius),
                intersect_sphere(point, end, radius),
                intersect_cylinder(point, start, end, radius),
            ];
            union(parts)
        })
    }

    /// Rasterizes a cylinder with flat caps at `start` and `end`. The axis may point in any direction.
    pub fn rasterize_cylinder(
        &mut self,
        start: Vec3,
        end: Vec3,
        radius: f32,
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let bounds = Aabb3d {
            min: start.min(end) - radius,
            max: start.max(end) + radius,
        };
        self.rasterize_volume(bounds, area, flag_merge_threshold, |point| {
            intersect_cylinder(point, start, end, radius)
        })
    }

    /// Rasterizes an oriented box. `half_edges` are the three mutually orthogonal vectors
    /// pointing from the center to the faces of the box.
    pub fn rasterize_box(
        &mut self,
        center: Vec3,
        half_edges: [Vec3; 3],
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let extent = half_edges
            .iter()
            .fold(Vec3::ZERO, |extent, edge| extent + edge.abs());
        let bounds = Aabb3d::new(center, extent);
        self.rasterize_volume(bounds, area, flag_merge_threshold, |point| {
            intersect_box(point, center, &half_edges)
        })
    }

    /// Rasterizes a closed convex hull given by its triangles.
    /// Columns are intersected with every triangle and the span covers all hits.
    pub fn rasterize_convex(
        &mut self,
        vertices: &[Vec3],
        triangles: &[[u32; 3]],
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let Some(bounds) = Aabb3d::from_verts(vertices) else {
            return Ok(());
        };
        self.rasterize_volume(bounds, area, flag_merge_threshold, |point| {
            let hits = triangles.iter().filter_map(|triangle| {
                let [a, b, c] = triangle.map(|i| vertices.get(i as usize).copied());
                intersect_triangle(point, a?, b?, c?)
            });
            union(hits.map(|y| Some((y, y))))
        })
    }

    /// Calls `intersect` for the center of every column inside `bounds` and adds the returned height range.
    fn rasterize_volume(
        &mut self,
        bounds: Aabb3d,
        area: AreaType,
        flag_merge_threshold: u16,
        mut intersect: impl FnMut(Vec2) -> Option<(f32, f32)>,
    ) -> Result<(), SpanInsertionError> {
        if !bounds.intersects(&self.aabb) {
            return Ok(());
        }
        let inverse_cell_size = 1.0 / self.cell_size;
        let x0 = ((bounds.min.x - self.aabb.min.x) * inverse_cell_size).floor() as i32;
        let x1 = ((bounds.max.x - self.aabb.min.x) * inverse_cell_size).floor() as i32;
        let z0 = ((bounds.min.z - self.aabb.min.z) * inverse_cell_size).floor() as i32;
        let z1 = ((bounds.max.z - self.aabb.min.z) * inverse_cell_size).floor() as i32;
        let x0 = x0.max(0);
        let z0 = z0.max(0);
        let x1 = x1.min(self.width as i32 - 1);
        let z1 = z1.min(self.height as i32 - 1);

        for z in z0..=z1 {
            for x in x0..=x1 {
                let point = self.aabb.min.xz()
                    + (Vec2::new(x as f32, z as f32) + 0.5) * self.cell_size;
                let Some((min_y, max_y)) = intersect(point) else {
                    continue;
                };
                self.add_height_range(
                    x as u16,
                    z as u16,
                    min_y,
                    max_y,
                    area,
                    flag_merge_threshold,
                )?;
            }
        }
        Ok(())
    }
}

/// Smallest interval containing all given intervals.
fn union(intervals: impl IntoIterator<Item = Option<(f32, f32)>>) -> Option<(f32, f32)> {
    intervals
        .into_iter()
        .flatten()
        .reduce(|(a_min, a_max), (b_min, b_max)| (a_min.min(b_min), a_max.max(b_max)))
}

/// Intersects the vertical line through `point` with a sphere.
fn intersect_sphere(point: Vec2, center: Vec3, radius: f32) -> Option<(f32, f32)> {
    let distance_squared = point.distance_squared(center.xz());
    let discriminant = radius * radius - distance_squared;
    if discriminant < 0.0 {
        return None;
    }
    let half = discriminant.sqrt();
    Some((center.y - half, center.y + half))
}

/// Intersects the vertical line through `point` with a cylinder with flat caps.
fn intersect_cylinder(point: Vec2, start: Vec3, end: Vec3, radius: f32) -> Option<(f32, f32)> {
    let axis = end - start;
    let length = axis.length();
    if length <= f32::EPSILON {
        return None;
    }
    let axis = axis / length;
    // Points on the line are `offset + y * Vec3::Y`, relative to `start`.
    let offset = Vec3::new(point.x - start.x, -start.y, point.y - start.z);
    let along = offset.dot(axis);

    // Component of the line perpendicular to the axis: `perp_dir * y + perp_offset`.
    let perp_dir = Vec3::Y - axis.y * axis;
    let perp_offset = offset - along * axis;
    let a = perp_dir.length_squared();
    let b = 2.0 * perp_dir.dot(perp_offset);
    let c = perp_offset.length_squared() - radius * radius;

    // Line parameters where the line is inside the infinite cylinder.
    let (mut y_min, mut y_max) = if a <= f32::EPSILON {
        // The line is parallel to the axis.
        if c > 0.0 {
            return None;
        }
        (f32::MIN, f32::MAX)
    } else {
        let discriminant = b * b - 4.0 * a * c;
        if discriminant < 0.0 {
            return None;
        }
        let root = discriminant.sqrt();
        ((-b - root) / (2.0 * a), (-b + root) / (2.0 * a))
    };

    // Clip against the caps: the projection onto the axis, `along + y * axis.y`, must be within [0, length].
    if axis.y.abs() <= f32::EPSILON {
        if !(0.0..=length).contains(&along) {
            return None;
        }
    } else {
        let t0 = (0.0 - along) / axis.y;
        let t1 = (length - along) / axis.y;
        y_min = y_min.max(t0.min(t1));
        y_max = y_max.min(t0.max(t1));
    }
    (y_min <= y_max).then_some((y_min, y_max))
}

/// Intersects the vertical line through `point` with an oriented box using slabs.
fn intersect_box(point: Vec2, center: Vec3, half_edges: &[Vec3; 3]) -> Option<(f32, f32)> {
    let offset = Vec3::new(point.x - center.x, -center.y, point.y - center.z);
    let mut y_min = f32::MIN;
    let mut y_max = f32::MAX;
    for edge in half_edges {
        let extent = edge.length();
        if extent <= f32::EPSILON {
            return None;
        }
        let normal = *edge / extent;
        // Distance along the normal is `along + y * normal.y` and must be within [-extent, extent].
        let along = offset.dot(normal);
        if normal.y.abs() <= f32::EPSILON {
            if along.abs() > extent {
                return None;
            }
            continue;
        }
        let t0 = (-extent - along) / normal.y;
        let t1 = (extent - along) / normal.y;
        y_min = y_min.max(t0.min(t1));
        y_max = y_max.min(t0.max(t1));
    }
    (y_min <= y_max).then_some((y_min, y_max))
}

/// Returns the height at which the vertical line through `point` hits the triangle, if it does.
fn intersect_triangle(point: Vec2, a: Vec3, b: Vec3, c: Vec3) -> Option<f32> {
    let v0 = b.xz() - a.xz();
    let v1 = c.xz() - a.xz();
    let v2 = point - a.xz();
    let denominator = v0.perp_dot(v1);
    if denominator.abs() <= f32::EPSILON {
        // The triangle is vertical, the walls are covered by the other triangles.
        return None;
    }
    let u = v2.perp_dot(v1) / denominator;
    let v = v0.perp_dot(v2) / denominator;
    const EPS: f32 = 1e-4;
    if u < -EPS || v < -EPS || u + v > 1.0 + EPS {
        return None;
    }
    Some(a.y + u * (b.y - a.y) + v * (c.y - a.y))
}

#[cfg(test)]
mod tests {
    use crate::HeightfieldBuilder;

    use super::*;

    fn heightfield() -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::splat(10.0),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    #[test]
    fn sphere_spans_shrink_towards_the_rim() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_sphere(Vec3::new(5.0, 5.0, 5.0), 3.0, AreaType(1), 1)
            .unwrap();
        let center = heightfield.span_at(5, 5).unwrap();
        let rim = heightfield.span_at(7, 5).unwrap();
        assert!(center.max() - center.min() > rim.max() - rim.min());
        assert!(heightfield.span_at(9, 9).is_none());
    }

    #[test]
    fn vertical_cylinder_is_a_straight_column() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_cylinder(
                Vec3::new(5.0, 2.0, 5.0),
                Vec3::new(5.0, 6.0, 5.0),
                1.5,
                AreaType(1),
                1,
            )
            .unwrap();
        for (x, z) in [(4, 4), (5, 5), (4, 5)] {
            let span = heightfield.span_at(x, z).unwrap();
            assert_eq!((span.min(), span.max()), (2, 6));
        }
        assert!(heightfield.span_at(7, 5).is_none());
    }

    #[test]
    fn horizontal_capsule_has_rounded_ends() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_capsule(
                Vec3::new(2.5, 5.0, 5.5),
                Vec3::new(7.5, 5.0, 5.5),
                2.0,
                AreaType(1),
                1,
            )
            .unwrap();
        let middle = heightfield.span_at(5, 5).unwrap();
        assert_eq!((middle.min(), middle.max()), (3, 7));
        // Beyond the segment only the spherical caps remain.
        let cap = heightfield.span_at(9, 5).unwrap();
        assert!(cap.max() - cap.min() < middle.max() - middle.min());
    }

    #[test]
    fn axis_aligned_box() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_box(
                Vec3::new(5.0, 3.0, 5.0),
                [Vec3::X * 2.0, Vec3::Y, Vec3::Z * 2.0],
                AreaType(1),
                1,
            )
            .unwrap();
        let span = heightfield.span_at(4, 4).unwrap();
        assert_eq!((span.min(), span.max()), (2, 4));
        assert!(heightfield.span_at(8, 4).is_none());
    }

    #[test]
    fn convex_tetrahedron() {
        let mut heightfield = heightfield();
        let vertices = [
            Vec3::new(2.0, 1.0, 2.0),
            Vec3::new(8.0, 1.0, 2.0),
            Vec3::new(5.0, 1.0, 8.0),
            Vec3::new(5.0, 7.0, 4.0),
        ];
        let triangles = [[0, 2, 1], [0, 1, 3], [1, 2, 3], [2, 0, 3]];
        heightfield
            .rasterize_convex(&vertices, &triangles, AreaType(1), 1)
            .unwrap();
        // The line through (5.5, 4.5) enters through the base and leaves through a side at y = 4.75.
        let span = heightfield.span_at(5, 4).unwrap();
        assert_eq!((span.min(), span.max()), (1, 5));
        assert!(heightfield.span_at(0, 9).is_none());
    }

    #[test]
    fn shapes_outside_of_bounds_are_skipped() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_sphere(Vec3::new(50.0, 5.0, 5.0), 3.0, AreaType(1), 1)
            .unwrap();
        assert!(heightfield.allocated_spans.is_empty());
    }
}
