//! The triangle soup that is fed into [`Heightfield`](crate::Heightfield) rasterization.

use glam::{UVec3, Vec3A};

use crate::{
    math::{Aabb3d, TriangleIndices as _},
    span::AreaType,
};

/// A mesh used as input for [`Heightfield`](crate::Heightfield) rasterization.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TriMesh {
    /// The vertices composing the mesh.
    /// Follows the convention of a triangle list.
    pub vertices: Vec<Vec3A>,

    /// The indices composing the mesh.
    /// Follows the convention of a triangle list, wound counter-clockwise when seen from above.
    pub indices: Vec<UVec3>,

    /// The area types of the trimesh. Each index corresponds 1:1 to the [`TriMesh::indices`].
    pub area_types: Vec<AreaType>,
}

impl TriMesh {
    /// Creates a trimesh from vertices and triangles, all of them with the area [`AreaType::NOT_WALKABLE`].
    /// Use [`TriMesh::mark_walkable_triangles`] to flag the walkable ones afterwards.
    pub fn new(vertices: Vec<Vec3A>, indices: Vec<UVec3>) -> Self {
        let area_types = vec![AreaType::NOT_WALKABLE; indices.len()];
        Self {
            vertices,
            indices,
            area_types,
        }
    }

    /// Extends the trimesh with the vertices and indices of another trimesh.
    /// The indices of `other` will be offset by the number of vertices in `self`.
    ///
    /// # Panics
    ///
    /// Panics if the combined vertex count does not fit into a `u32`.
    pub fn extend(&mut self, other: TriMesh) {
        let Ok(next_vertex_index) = u32::try_from(self.vertices.len()) else {
            panic!("Cannot extend a trimesh with more than 2^32 vertices");
        };
        self.vertices.extend(other.vertices);
        self.indices
            .extend(other.indices.iter().map(|i| i + next_vertex_index));
        self.area_types.extend(other.area_types);
    }

    /// Computes the AABB of the trimesh.
    /// Returns `None` if the trimesh is empty.
    pub fn compute_aabb(&self) -> Option<Aabb3d> {
        Aabb3d::from_verts(&self.vertices)
    }

    /// Marks the triangles as walkable based on the threshold angle.
    ///
    /// A triangle becomes [`AreaType::DEFAULT_WALKABLE`] if the angle between its normal and the up axis
    /// is smaller than the threshold. Triangles that are not walkable keep their area type.
    ///
    /// # Arguments
    ///
    /// * `threshold_rad` - The threshold angle in radians.
    ///
    pub fn mark_walkable_triangles(&mut self, threshold_rad: f32) {
        let threshold_cos = threshold_rad.cos();
        for (indices, area) in self.indices.iter().zip(self.area_types.iter_mut()) {
            let normal = indices.normal(&self.vertices);
            if normal.y > threshold_cos {
                *area = AreaType::DEFAULT_WALKABLE;
            }
        }
    }

    /// Clears the area of triangles that are too steep to walk on.
    ///
    /// This is the inverse of [`TriMesh::mark_walkable_triangles`]: a triangle becomes [`AreaType::NOT_WALKABLE`]
    /// if the angle between its normal and the up axis is not smaller than the threshold.
    /// Walkable triangles keep their area type.
    pub fn clear_unwalkable_triangles(&mut self, threshold_rad: f32) {
        let threshold_cos = threshold_rad.cos();
        for (indices, area) in self.indices.iter().zip(self.area_types.iter_mut()) {
            let normal = indices.normal(&self.vertices);
            if normal.y <= threshold_cos {
                *area = AreaType::NOT_WALKABLE;
            }
        }
    }

    /// Returns the vertices of the triangle at the given index, or `None` if any index is out of bounds.
    pub fn triangle(&self, index: usize) -> Option<[Vec3A; 3]> {
        let indices = self.indices.get(index)?;
        Some([
            *self.vertices.get(indices.x as usize)?,
            *self.vertices.get(indices.y as usize)?,
            *self.vertices.get(indices.z as usize)?,
        ])
    }
}
