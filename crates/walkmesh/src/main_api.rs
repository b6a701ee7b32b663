//! Runs the whole build for a single tile.

use thiserror::Error;

use crate::{
    CompactHeightfield, ContourSet, DetailNavmesh, Heightfield, HeightfieldBuilder,
    HeightfieldBuilderError, HeightfieldLayerSet, NavmeshConfig, PolygonNavmesh, TriMesh,
    compact_heightfield::CompactHeightfieldError,
    config::{NavmeshConfigError, PartitionType},
    contours::ContourError,
    detail_mesh::DetailNavmeshError,
    heightfield_layers::HeightfieldLayerError,
    input::{InputGeometry, OffMeshConnection},
    math::Aabb2d,
    poly_mesh::PolygonNavmeshError,
    rasterize::RasterizationError,
    region_merge::RegionError,
};

impl Heightfield {
    /// Rasterizes the triangles of a [`TriMesh`] into the heightfield,
    /// then runs the span filters enabled in `config`.
    ///
    /// The area types of the trimesh are used as they are, so flag the walkable triangles beforehand,
    /// e.g. with [`TriMesh::mark_walkable_triangles`].
    pub fn populate_from_trimesh(
        &mut self,
        trimesh: &TriMesh,
        config: &NavmeshConfig,
    ) -> Result<(), RasterizationError> {
        // flag_merge_threshold and walkable_climb are the same thing in practice.
        self.rasterize_triangles(trimesh, config.walkable_climb)?;

        // Remove unwanted overhangs caused by the conservative rasterization
        // as well as spans where the character cannot possibly stand.
        if config.filter_low_hanging_obstacles {
            self.filter_low_hanging_walkable_obstacles(config.walkable_climb);
        }
        if config.filter_ledge_spans {
            self.filter_ledge_spans(config.walkable_height, config.walkable_climb);
        }
        if config.filter_walkable_low_height_spans {
            self.filter_walkable_low_height_spans(config.walkable_height);
        }
        Ok(())
    }
}

/// The result of [`build_navmesh`], including the intermediate fields.
#[derive(Debug, Clone)]
pub struct Navmesh {
    /// The compact heightfield after area marking and region partitioning.
    pub compact_heightfield: CompactHeightfield,
    /// The contours traced around the regions.
    pub contour_set: ContourSet,
    /// The polygons an agent can walk on.
    pub polygon_mesh: PolygonNavmesh,
    /// The height detail of the polygons. `None` if [`NavmeshConfig::build_detail_mesh`] is off.
    pub detail_mesh: Option<DetailNavmesh>,
    /// The off-mesh connections of the input, untouched.
    pub off_mesh_connections: Vec<OffMeshConnection>,
}

/// Builds a navmesh for the area covered by [`NavmeshConfig::aabb`].
///
/// Triangles steeper than [`NavmeshConfig::walkable_slope_angle`] are made unwalkable before rasterization,
/// all other triangles keep their area.
pub fn build_navmesh(
    input: &impl InputGeometry,
    config: &NavmeshConfig,
) -> Result<Navmesh, NavmeshError> {
    let _span = tracing::info_span!("build_navmesh").entered();
    let mut compact_heightfield = build_compact_heightfield(input, config)?;

    match config.partition {
        PartitionType::Watershed => {
            compact_heightfield.build_distance_field();
            compact_heightfield.build_regions(
                config.border_size,
                config.min_region_area,
                config.merge_region_area,
            )?;
        }
        PartitionType::Monotone => compact_heightfield.build_regions_monotone(
            config.border_size,
            config.min_region_area,
            config.merge_region_area,
        )?,
        PartitionType::Layers => {
            compact_heightfield.build_layer_regions(config.border_size, config.min_region_area)?
        }
    }

    let contour_set = compact_heightfield.build_contours(
        config.max_simplification_error,
        config.max_edge_len,
        config.contour_flags,
    )?;
    let polygon_mesh =
        contour_set.build_polygon_mesh(config.max_vertices_per_polygon as usize)?;
    let detail_mesh = if config.build_detail_mesh {
        Some(DetailNavmesh::new(
            &polygon_mesh,
            &compact_heightfield,
            config.detail_sample_dist,
            config.detail_sample_max_error,
        )?)
    } else {
        None
    };
    tracing::debug!(
        polygons = polygon_mesh.polygon_count(),
        vertices = polygon_mesh.vertices.len(),
        "built navmesh"
    );

    Ok(Navmesh {
        compact_heightfield,
        contour_set,
        polygon_mesh,
        detail_mesh,
        off_mesh_connections: input.off_mesh_connections().to_vec(),
    })
}

/// Builds the heightfield layers for the area covered by [`NavmeshConfig::aabb`].
///
/// This replaces the region, contour and polygon stages of [`build_navmesh`].
pub fn build_layers(
    input: &impl InputGeometry,
    config: &NavmeshConfig,
) -> Result<HeightfieldLayerSet, NavmeshError> {
    let _span = tracing::info_span!("build_layers").entered();
    let compact_heightfield = build_compact_heightfield(input, config)?;
    Ok(compact_heightfield.build_heightfield_layers(config.border_size, config.walkable_height)?)
}

/// Runs rasterization, filtering, compaction and area marking.
fn build_compact_heightfield(
    input: &impl InputGeometry,
    config: &NavmeshConfig,
) -> Result<CompactHeightfield, NavmeshError> {
    config.validate()?;

    let mut heightfield = HeightfieldBuilder {
        aabb: config.aabb,
        cell_size: config.cell_size,
        cell_height: config.cell_height,
    }
    .build()?;

    let mut trimesh = input.triangles_in_rect(Aabb2d::from(config.aabb));
    trimesh.clear_unwalkable_triangles(config.walkable_slope_angle);
    heightfield.populate_from_trimesh(&trimesh, config)?;
    tracing::debug!(
        triangles = trimesh.indices.len(),
        walkable_spans = heightfield.walkable_span_count(),
        "rasterized input"
    );

    let mut compact_heightfield =
        heightfield.into_compact(config.walkable_height, config.walkable_climb)?;
    compact_heightfield.erode_walkable_area(config.walkable_radius);
    for volume in config.area_volumes.iter().chain(input.convex_volumes()) {
        compact_heightfield.mark_convex_poly_area(volume);
    }
    Ok(compact_heightfield)
}

/// Errors that can occur in [`build_navmesh`] and [`build_layers`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavmeshError {
    /// The config cannot be built with.
    #[error(transparent)]
    Config(#[from] NavmeshConfigError),
    /// The heightfield could not be created.
    #[error(transparent)]
    Heightfield(#[from] HeightfieldBuilderError),
    /// The input could not be rasterized.
    #[error(transparent)]
    Rasterization(#[from] RasterizationError),
    /// The heightfield could not be compacted.
    #[error(transparent)]
    CompactHeightfield(#[from] CompactHeightfieldError),
    /// The walkable area could not be partitioned.
    #[error(transparent)]
    Region(#[from] RegionError),
    /// The regions could not be traced.
    #[error(transparent)]
    Contour(#[from] ContourError),
    /// The contours could not be turned into polygons.
    #[error(transparent)]
    PolygonMesh(#[from] PolygonNavmeshError),
    /// The detail mesh could not be built.
    #[error(transparent)]
    DetailMesh(#[from] DetailNavmeshError),
    /// The heightfield layers could not be built.
    #[error(transparent)]
    Layers(#[from] HeightfieldLayerError),
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3A};

    use super::*;
    use crate::{AreaType, NavmeshConfigBuilder, input::InputMesh, mark_area::ConvexVolume};

    fn floor(size: f32) -> TriMesh {
        let mut trimesh = TriMesh::new(
            vec![
                Vec3A::new(0.0, 0.0, 0.0),
                Vec3A::new(0.0, 0.0, size),
                Vec3A::new(size, 0.0, size),
                Vec3A::new(size, 0.0, 0.0),
            ],
            vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
        );
        trimesh.mark_walkable_triangles(45.0_f32.to_radians());
        trimesh
    }

    fn config_for(trimesh: &TriMesh) -> NavmeshConfig {
        NavmeshConfigBuilder {
            agent_radius: 0.0,
            region_min_size: 1.0,
            aabb: trimesh.compute_aabb().unwrap(),
            ..Default::default()
        }
        .build()
    }

    #[test]
    fn every_partition_yields_a_single_polygon() {
        let trimesh = floor(6.0);
        for partition in [
            PartitionType::Watershed,
            PartitionType::Monotone,
            PartitionType::Layers,
        ] {
            let config = NavmeshConfig {
                partition,
                ..config_for(&trimesh)
            };
            let navmesh = build_navmesh(&trimesh, &config).unwrap();
            assert_eq!(navmesh.contour_set.contours.len(), 1, "{partition:?}");
            assert_eq!(navmesh.polygon_mesh.polygon_count(), 1, "{partition:?}");
            let detail = navmesh.detail_mesh.unwrap();
            assert_eq!(detail.meshes.len(), 1);
        }
    }

    #[test]
    fn heightfield_size_matches_the_config() {
        let trimesh = floor(6.0);
        let config = config_for(&trimesh);
        let navmesh = build_navmesh(&trimesh, &config).unwrap();
        assert_eq!(navmesh.compact_heightfield.width, config.width);
        assert_eq!(navmesh.compact_heightfield.height, config.height);
    }

    #[test]
    fn detail_mesh_can_be_skipped() {
        let trimesh = floor(6.0);
        let config = NavmeshConfig {
            build_detail_mesh: false,
            ..config_for(&trimesh)
        };
        let navmesh = build_navmesh(&trimesh, &config).unwrap();
        assert!(navmesh.detail_mesh.is_none());
        assert_eq!(navmesh.polygon_mesh.polygon_count(), 1);
    }

    #[test]
    fn unflagged_triangles_produce_nothing() {
        let mut trimesh = floor(6.0);
        trimesh.area_types.fill(AreaType::NOT_WALKABLE);
        let navmesh = build_navmesh(&trimesh, &config_for(&trimesh)).unwrap();
        assert!(navmesh.compact_heightfield.spans.is_empty());
        assert_eq!(navmesh.polygon_mesh.polygon_count(), 0);
    }

    #[test]
    fn convex_volumes_of_the_input_are_stamped() {
        let trimesh = floor(6.0);
        let config = config_for(&trimesh);
        let input = InputMesh {
            convex_volumes: vec![ConvexVolume::new(
                vec![
                    Vec3A::new(-1.0, 0.0, -1.0),
                    Vec3A::new(-1.0, 0.0, 7.0),
                    Vec3A::new(7.0, 0.0, 7.0),
                    Vec3A::new(7.0, 0.0, -1.0),
                ],
                -1.0,
                1.0,
                AreaType(7),
            )],
            ..InputMesh::from(trimesh)
        };
        let navmesh = build_navmesh(&input, &config).unwrap();
        assert!(navmesh.polygon_mesh.polygon_count() > 0);
        assert!(navmesh.polygon_mesh.areas.iter().all(|&area| area == AreaType(7)));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let trimesh = floor(6.0);
        let config = NavmeshConfig {
            max_vertices_per_polygon: 2,
            ..config_for(&trimesh)
        };
        assert!(matches!(
            build_navmesh(&trimesh, &config),
            Err(NavmeshError::Config(_))
        ));
    }

    #[test]
    fn flat_floor_is_a_single_layer() {
        let trimesh = floor(6.0);
        let layers = build_layers(&trimesh, &config_for(&trimesh)).unwrap();
        assert_eq!(layers.layers.len(), 1);
    }
}
