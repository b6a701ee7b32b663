//! The boundary to whatever stores the geometry a navmesh is built from.
//!
//! The build only ever asks for the triangles overlapping a rectangle on the xz-plane,
//! so providers are free to back [`InputGeometry`] with a spatial index.

use glam::Vec3A;

use crate::{
    math::{Aabb2d, Aabb3d, TriangleVertices as _},
    mark_area::ConvexVolume,
    span::AreaType,
    trimesh::TriMesh,
};

/// Source geometry for navmesh builds.
pub trait InputGeometry {
    /// The bounds of all triangles, or `None` if there are none.
    fn bounds(&self) -> Option<Aabb3d>;

    /// Returns the triangles whose footprint on the xz-plane overlaps `rect`, with their area types.
    fn triangles_in_rect(&self, rect: Aabb2d) -> TriMesh;

    /// Volumes whose spans get their area overwritten after rasterization.
    fn convex_volumes(&self) -> &[ConvexVolume] {
        &[]
    }

    /// Off-mesh connections. These are not used by the build and are handed through to the result.
    fn off_mesh_connections(&self) -> &[OffMeshConnection] {
        &[]
    }
}

/// A user-placed link between two points of the navmesh, such as a jump or a ladder.
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct OffMeshConnection {
    /// The start of the connection. [Units: wu]
    pub start: Vec3A,
    /// The end of the connection. [Units: wu]
    pub end: Vec3A,
    /// The radius around the endpoints within which the connection can be entered. [Units: wu]
    pub radius: f32,
    /// Whether the connection can be traversed from `end` to `start` as well.
    pub bidirectional: bool,
    /// The area of the connection.
    pub area: AreaType,
    /// User flags of the connection.
    pub flags: u16,
}

impl InputGeometry for TriMesh {
    fn bounds(&self) -> Option<Aabb3d> {
        self.compute_aabb()
    }

    fn triangles_in_rect(&self, rect: Aabb2d) -> TriMesh {
        let mut remap = vec![None; self.vertices.len()];
        let mut result = TriMesh::default();
        for (index, (indices, area)) in self.indices.iter().zip(&self.area_types).enumerate() {
            let Some(triangle) = self.triangle(index) else {
                continue;
            };
            if !rect.intersects(&triangle.aabb().into()) {
                continue;
            }
            let mut remapped = [0; 3];
            for (target, source) in remapped.iter_mut().zip(indices.to_array()) {
                *target = *remap[source as usize].get_or_insert_with(|| {
                    result.vertices.push(self.vertices[source as usize]);
                    result.vertices.len() as u32 - 1
                });
            }
            result.indices.push(remapped.into());
            result.area_types.push(*area);
        }
        result
    }
}

/// A [`TriMesh`] together with the area volumes and off-mesh connections placed in it.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct InputMesh {
    /// The triangles to rasterize.
    pub trimesh: TriMesh,
    /// See [`InputGeometry::convex_volumes`].
    pub convex_volumes: Vec<ConvexVolume>,
    /// See [`InputGeometry::off_mesh_connections`].
    pub off_mesh_connections: Vec<OffMeshConnection>,
}

impl From<TriMesh> for InputMesh {
    fn from(trimesh: TriMesh) -> Self {
        Self {
            trimesh,
            ..Default::default()
        }
    }
}

impl InputGeometry for InputMesh {
    fn bounds(&self) -> Option<Aabb3d> {
        self.trimesh.bounds()
    }

    fn triangles_in_rect(&self, rect: Aabb2d) -> TriMesh {
        self.trimesh.triangles_in_rect(rect)
    }

    fn convex_volumes(&self) -> &[ConvexVolume] {
        &self.convex_volumes
    }

    fn off_mesh_connections(&self) -> &[OffMeshConnection] {
        &self.off_mesh_connections
    }
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec2};

    use super::*;

    fn two_triangles() -> TriMesh {
        let mut trimesh = TriMesh::new(
            vec![
                Vec3A::new(0.0, 0.0, 0.0),
                Vec3A::new(0.0, 0.0, 1.0),
                Vec3A::new(1.0, 0.0, 0.0),
                Vec3A::new(10.0, 0.0, 10.0),
                Vec3A::new(10.0, 0.0, 11.0),
                Vec3A::new(11.0, 0.0, 10.0),
            ],
            vec![UVec3::new(0, 1, 2), UVec3::new(3, 4, 5)],
        );
        trimesh.area_types[1] = AreaType::DEFAULT_WALKABLE;
        trimesh
    }

    #[test]
    fn rect_query_keeps_overlapping_triangles() {
        let trimesh = two_triangles();
        let found = trimesh.triangles_in_rect(Aabb2d {
            min: Vec2::new(9.0, 9.0),
            max: Vec2::new(20.0, 20.0),
        });
        assert_eq!(found.indices, vec![UVec3::new(0, 1, 2)]);
        assert_eq!(found.vertices, trimesh.vertices[3..].to_vec());
        assert_eq!(found.area_types, vec![AreaType::DEFAULT_WALKABLE]);
    }

    #[test]
    fn rect_query_outside_is_empty() {
        let found = two_triangles().triangles_in_rect(Aabb2d {
            min: Vec2::new(3.0, 3.0),
            max: Vec2::new(4.0, 4.0),
        });
        assert!(found.indices.is_empty());
        assert!(found.vertices.is_empty());
    }

    #[test]
    fn input_mesh_hands_out_its_parts() {
        let input = InputMesh {
            off_mesh_connections: vec![OffMeshConnection {
                start: Vec3A::ZERO,
                end: Vec3A::X,
                radius: 0.5,
                bidirectional: true,
                area: AreaType::DEFAULT_WALKABLE,
                flags: 1,
            }],
            ..InputMesh::from(two_triangles())
        };
        assert_eq!(input.off_mesh_connections().len(), 1);
        assert!(input.convex_volumes().is_empty());
        assert_eq!(input.bounds().map(|aabb| aabb.max.x), Some(11.0));
    }
}
