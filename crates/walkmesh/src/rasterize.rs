//! Voxelization of triangles into a [`Heightfield`].
//!
//! Each triangle is clipped against the rows and then the columns of the grid.
//! Every non-empty fragment becomes a span covering the fragment's height range.

use glam::Vec3A;
use thiserror::Error;

use crate::{
    heightfield::{Heightfield, SpanInsertion, SpanInsertionError},
    math::TriangleVertices as _,
    span::{AreaType, Span, SpanBuilder},
    trimesh::TriMesh,
};

/// The clipped polygon never grows past this many vertices: a triangle gains at most one vertex per clip.
const MAX_CLIPPED_VERTICES: usize = 12;

impl Heightfield {
    /// Rasterizes all triangles of a [`TriMesh`] into the heightfield.
    /// The area of each triangle is taken from [`TriMesh::area_types`].
    ///
    /// `flag_merge_threshold` is the maximum difference between the ceilings of two overlapping spans
    /// for which the higher area type wins. [Units: vx]
    pub fn rasterize_triangles(
        &mut self,
        trimesh: &TriMesh,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        if trimesh.area_types.len() != trimesh.indices.len() {
            return Err(RasterizationError::AreaTypeCountMismatch {
                triangles: trimesh.indices.len(),
                area_types: trimesh.area_types.len(),
            });
        }
        for (triangle, area) in trimesh.indices.iter().zip(trimesh.area_types.iter()) {
            let mut vertices = [Vec3A::ZERO; 3];
            for (vertex, index) in vertices.iter_mut().zip(triangle.to_array()) {
                *vertex = *trimesh.vertices.get(index as usize).ok_or(
                    RasterizationError::VertexIndexOutOfBounds {
                        index,
                        vertex_count: trimesh.vertices.len(),
                    },
                )?;
            }
            self.rasterize_triangle(vertices, *area, flag_merge_threshold)?;
        }
        Ok(())
    }

    /// Rasterizes a single triangle into the heightfield.
    ///
    /// Triangles outside of the heightfield's bounds and triangles without area are skipped.
    pub fn rasterize_triangle(
        &mut self,
        vertices: [Vec3A; 3],
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), RasterizationError> {
        // Collinear within float precision, relative to the edge lengths.
        let [a, b, c] = vertices;
        let (ab, ac) = (b - a, c - a);
        if ab.cross(ac).length_squared()
            <= f32::EPSILON * f32::EPSILON * ab.length_squared() * ac.length_squared()
        {
            return Ok(());
        }
        let triangle_aabb = vertices.aabb();
        if !triangle_aabb.intersects(&self.aabb) {
            return Ok(());
        }

        let min = Vec3A::from(self.aabb.min);
        let inverse_cell_size = 1.0 / self.cell_size;
        let width = self.width as i32;
        let height = self.height as i32;

        // Calculate the footprint of the triangle on the grid's z-axis.
        // Use -1 rather than 0 to cut the polygon properly at the start of the tile.
        let z0 = ((triangle_aabb.min.z - min.z) * inverse_cell_size) as i32;
        let z1 = ((triangle_aabb.max.z - min.z) * inverse_cell_size) as i32;
        let z0 = z0.clamp(-1, height - 1);
        let z1 = z1.clamp(0, height - 1);

        let mut remaining: Vec<Vec3A> = Vec::with_capacity(MAX_CLIPPED_VERTICES);
        remaining.extend_from_slice(&vertices);
        let mut row = Vec::with_capacity(MAX_CLIPPED_VERTICES);
        let mut rest = Vec::with_capacity(MAX_CLIPPED_VERTICES);
        let mut cell = Vec::with_capacity(MAX_CLIPPED_VERTICES);
        let mut row_rest = Vec::with_capacity(MAX_CLIPPED_VERTICES);

        for z in z0..=z1 {
            // Clip the polygon to the row, keeping the rest for the next row.
            let cell_z = min.z + z as f32 * self.cell_size;
            divide_poly(
                &remaining,
                &mut row,
                &mut rest,
                cell_z + self.cell_size,
                Axis::Z,
            );
            std::mem::swap(&mut remaining, &mut rest);
            if row.len() < 3 || z < 0 {
                continue;
            }

            // Find the horizontal bounds of the row.
            let (min_x, max_x) = row
                .iter()
                .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.x), hi.max(v.x)));
            let x0 = ((min_x - min.x) * inverse_cell_size) as i32;
            let x1 = ((max_x - min.x) * inverse_cell_size) as i32;
            if x1 < 0 || x0 >= width {
                continue;
            }
            let x0 = x0.clamp(-1, width - 1);
            let x1 = x1.clamp(0, width - 1);

            for x in x0..=x1 {
                // Clip the row polygon to the column, keeping the rest for the next column.
                let cell_x = min.x + x as f32 * self.cell_size;
                divide_poly(&row, &mut cell, &mut row_rest, cell_x + self.cell_size, Axis::X);
                std::mem::swap(&mut row, &mut row_rest);
                if cell.len() < 3 || x < 0 {
                    continue;
                }

                let (span_min, span_max) = cell
                    .iter()
                    .fold((f32::MAX, f32::MIN), |(lo, hi), v| (lo.min(v.y), hi.max(v.y)));
                self.add_height_range(
                    x as u16,
                    z as u16,
                    span_min,
                    span_max,
                    area,
                    flag_merge_threshold,
                )?;
            }
        }
        Ok(())
    }

    /// Adds a span covering the world-space height range `[min_y, max_y]` to the column at `x`, `z`.
    /// Ranges fully below or above the heightfield are skipped, the others are clamped to it.
    pub(crate) fn add_height_range(
        &mut self,
        x: u16,
        z: u16,
        min_y: f32,
        max_y: f32,
        area: AreaType,
        flag_merge_threshold: u16,
    ) -> Result<(), SpanInsertionError> {
        let bounds_height = self.aabb.max.y - self.aabb.min.y;
        let span_min = min_y - self.aabb.min.y;
        let span_max = max_y - self.aabb.min.y;
        if span_max < 0.0 || span_min > bounds_height {
            return Ok(());
        }
        let span_min = span_min.max(0.0);
        let span_max = span_max.min(bounds_height);

        let inverse_cell_height = 1.0 / self.cell_height;
        let max_height = Span::MAX_HEIGHT as i32;
        let span_min = ((span_min * inverse_cell_height).floor() as i32).clamp(0, max_height);
        let span_max =
            ((span_max * inverse_cell_height).ceil() as i32).clamp(span_min + 1, max_height);
        if span_min >= span_max {
            return Ok(());
        }

        self.add_span(SpanInsertion {
            x,
            z,
            flag_merge_threshold,
            span: SpanBuilder {
                min: span_min as u16,
                max: span_max as u16,
                area,
                next: None,
            }
            .build(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    X,
    Z,
}

impl Axis {
    #[inline]
    fn of(self, v: Vec3A) -> f32 {
        match self {
            Axis::X => v.x,
            Axis::Z => v.z,
        }
    }
}

/// Divides a convex polygon into two convex polygons on both sides of an axis-aligned line.
///
/// `below` receives the part with coordinates smaller than `axis_offset`, `above` the rest.
/// Both keep the winding of the input.
fn divide_poly(
    polygon: &[Vec3A],
    below: &mut Vec<Vec3A>,
    above: &mut Vec<Vec3A>,
    axis_offset: f32,
    axis: Axis,
) {
    below.clear();
    above.clear();
    let n = polygon.len();
    if n == 0 {
        return;
    }
    debug_assert!(n <= MAX_CLIPPED_VERTICES);

    // How far positive or negative away from the separating axis is each vertex.
    let mut deltas = [0.0; MAX_CLIPPED_VERTICES];
    for (delta, vertex) in deltas.iter_mut().zip(polygon) {
        *delta = axis_offset - axis.of(*vertex);
    }

    let mut a = n - 1;
    for b in 0..n {
        let a_below = deltas[a] >= 0.0;
        let b_below = deltas[b] >= 0.0;
        if a_below != b_below {
            // The edge crosses the line, add the intersection to both polygons.
            let s = deltas[a] / (deltas[a] - deltas[b]);
            let intersection = polygon[a] + (polygon[b] - polygon[a]) * s;
            below.push(intersection);
            above.push(intersection);
            // Add the b point to the polygon it belongs to, unless it lies on the line.
            if deltas[b] > 0.0 {
                below.push(polygon[b]);
            } else if deltas[b] < 0.0 {
                above.push(polygon[b]);
            }
        } else {
            // Same side: add b to the polygon it belongs to. Points on the line go to both.
            if deltas[b] >= 0.0 {
                below.push(polygon[b]);
                if deltas[b] != 0.0 {
                    a = b;
                    continue;
                }
            }
            above.push(polygon[b]);
        }
        a = b;
    }
}

/// Errors that can occur while rasterizing geometry into a [`Heightfield`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RasterizationError {
    /// Happens when the trimesh has a different number of area types than triangles.
    #[error("trimesh has {triangles} triangles but {area_types} area types")]
    AreaTypeCountMismatch {
        /// The number of triangles
        triangles: usize,
        /// The number of area types
        area_types: usize,
    },
    /// Happens when a triangle references a vertex that does not exist.
    #[error("triangle references vertex {index}, but there are only {vertex_count} vertices")]
    VertexIndexOutOfBounds {
        /// The offending index
        index: u32,
        /// The number of vertices in the trimesh
        vertex_count: usize,
    },
    /// Happens when a span could not be inserted.
    #[error(transparent)]
    SpanInsertion(#[from] SpanInsertionError),
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3};

    use crate::{Aabb3d, HeightfieldBuilder};

    use super::*;

    fn heightfield() -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(10.0, 10.0, 10.0),
            },
            cell_size: 1.0,
            cell_height: 0.5,
        }
        .build()
        .unwrap()
    }

    fn quad(y: f32, min: f32, max: f32) -> TriMesh {
        TriMesh {
            vertices: vec![
                Vec3A::new(min, y, min),
                Vec3A::new(min, y, max),
                Vec3A::new(max, y, max),
                Vec3A::new(max, y, min),
            ],
            indices: vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
            area_types: vec![AreaType::DEFAULT_WALKABLE; 2],
        }
    }

    #[test]
    fn divide_poly_splits_square() {
        let square = [
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 2.0),
            Vec3A::new(2.0, 0.0, 2.0),
            Vec3A::new(2.0, 0.0, 0.0),
        ];
        let mut below = Vec::new();
        let mut above = Vec::new();
        divide_poly(&square, &mut below, &mut above, 1.0, Axis::X);
        assert_eq!(below.len(), 4);
        assert_eq!(above.len(), 4);
        assert!(below.iter().all(|v| v.x <= 1.0));
        assert!(above.iter().all(|v| v.x >= 1.0));
    }

    #[test]
    fn divide_poly_keeps_polygon_on_one_side() {
        let triangle = [
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 1.0),
            Vec3A::new(1.0, 0.0, 0.0),
        ];
        let mut below = Vec::new();
        let mut above = Vec::new();
        divide_poly(&triangle, &mut below, &mut above, 5.0, Axis::Z);
        assert_eq!(below.len(), 3);
        assert!(above.is_empty());
    }

    #[test]
    fn rasterizes_flat_quad_into_one_span_per_column() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangles(&quad(1.0, 2.0, 6.0), 1)
            .unwrap();
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let spans: Vec<_> = heightfield.column_spans(x, z).collect();
                if (2..6).contains(&x) && (2..6).contains(&z) {
                    assert_eq!(spans.len(), 1, "column {x},{z}");
                    assert_eq!(spans[0].min(), 2);
                    assert_eq!(spans[0].max(), 3);
                    assert_eq!(spans[0].area(), AreaType::DEFAULT_WALKABLE);
                } else {
                    assert!(spans.is_empty(), "column {x},{z} should be empty");
                }
            }
        }
    }

    #[test]
    fn skips_geometry_outside_of_bounds() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangles(&quad(1.0, 20.0, 30.0), 1)
            .unwrap();
        heightfield
            .rasterize_triangles(&quad(-5.0, 2.0, 6.0), 1)
            .unwrap();
        assert!(heightfield.allocated_spans.is_empty());
    }

    #[test]
    fn tiny_triangle_still_produces_a_span() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangle(
                [
                    Vec3A::new(3.5, 1.0, 3.5),
                    Vec3A::new(3.5, 1.0, 3.5001),
                    Vec3A::new(3.5001, 1.0, 3.5),
                ],
                AreaType::DEFAULT_WALKABLE,
                1,
            )
            .unwrap();
        assert_eq!(heightfield.allocated_spans.len(), 1);
        assert_eq!(heightfield.column_spans(3, 3).count(), 1);
    }

    #[test]
    fn degenerate_triangle_produces_no_spans() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangle(
                [
                    Vec3A::new(1.0, 1.0, 1.0),
                    Vec3A::new(5.0, 1.0, 5.0),
                    Vec3A::new(3.0, 1.0, 3.0),
                ],
                AreaType::DEFAULT_WALKABLE,
                1,
            )
            .unwrap();
        assert!(heightfield.allocated_spans.is_empty());
    }

    #[test]
    fn rejects_mismatched_area_types() {
        let mut heightfield = heightfield();
        let mut trimesh = quad(1.0, 2.0, 6.0);
        trimesh.area_types.pop();
        assert_eq!(
            heightfield.rasterize_triangles(&trimesh, 1),
            Err(RasterizationError::AreaTypeCountMismatch {
                triangles: 2,
                area_types: 1
            })
        );
    }

    #[test]
    fn sloped_triangle_spans_cover_height_range() {
        let mut heightfield = heightfield();
        heightfield
            .rasterize_triangle(
                [
                    Vec3A::new(0.0, 0.0, 0.0),
                    Vec3A::new(0.0, 4.0, 4.0),
                    Vec3A::new(4.0, 0.0, 0.0),
                ],
                AreaType(3),
                1,
            )
            .unwrap();
        let span = heightfield.span_at(0, 3).unwrap();
        // The column at z in [3, 4) is crossed by heights 3 to 4, i.e. voxels 6 to 8.
        assert_eq!(span.min(), 6);
        assert_eq!(span.max(), 8);
    }
}
