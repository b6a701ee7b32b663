use thiserror::Error;

use crate::{Aabb3d, BuildContoursFlags, ConvexVolume};

/// Specifies a configuration to use when building a navmesh. Usually built using [`NavmeshConfigBuilder`].
///
/// This is an aggregation of the parameters used by the different stages of the build.
/// Not all parameters are used for all builds.
///
/// Units are either voxels (vx) or world units (wu). The size of a voxel is given by
/// [`NavmeshConfig::cell_size`] on the xz-plane and [`NavmeshConfig::cell_height`] along the y-axis.
///
/// > Note:
/// >
/// > First you should decide the size of your agent's logical cylinder.
/// > If your game world uses meters as units, a reasonable starting point for a human-sized agent
/// > might be a radius of 0.4 and a height of 2.0.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshConfig {
    /// The width of the field along the x-axis. `[Limit: >= 0] [Units: vx]`
    ///
    /// Informational only. The heightfield is sized from [`NavmeshConfig::aabb`] and [`NavmeshConfig::cell_size`],
    /// which [`NavmeshConfigBuilder`] keeps in sync with this value.
    pub width: u16,

    /// The height of the field along the z-axis. `[Limit: >= 0] [Units: vx]`
    ///
    /// Informational only, like [`NavmeshConfig::width`].
    pub height: u16,

    /// The width/height size of tiles on the xz-plane. `[Limit: >= 0] [Units: vx]`
    ///
    /// This field is only used when building multi-tile meshes.
    pub tile_size: u16,

    /// The size of the non-navigable border around the heightfield. `[Limit: >=0] [Units: vx]`
    ///
    /// This is the closest the walkable area should come to the xz-plane AABB of the field.
    /// Tiles are built with a border so that their edges line up with their neighbors.
    /// It does not have any impact on the borders around internal obstructions.
    pub border_size: u16,

    /// The xz-plane cell size to use for fields. `[Limit: > 0] [Units: wu]`.
    ///
    /// This value is usually derived from the agent radius r. A recommended starting value is either r/2 or r/3.
    /// Smaller values increase the resolution and detail of the navmesh, but also the build time.
    /// The practical minimum is usually around 0.05.
    pub cell_size: f32,

    /// The y-axis cell size to use for fields. `[Limit: > 0] [Units: wu]`
    ///
    /// A good starting point is half of [`NavmeshConfig::cell_size`].
    /// Decrease it if small holes appear around height discontinuities such as stairs or curbs.
    pub cell_height: f32,

    /// The field's AABB [Units: wu]
    pub aabb: Aabb3d,

    /// The maximum slope that is considered walkable. `[Limits: 0 <= value < 0.5*π] [Units: Radians]`
    ///
    /// This is the maximum angle between the surface normal of a triangle and the world's up vector.
    /// The practical upper limit is usually around `85.0.to_radians()`.
    pub walkable_slope_angle: f32,

    /// Minimum floor to 'ceiling' height that will still allow the floor area to
    /// be considered walkable. `[Limit: >= 3] [Units: vx]`
    ///
    /// Calculated as `(agent_height / cell_height).ceil()`.
    /// Permits detection of overhangs in the source geometry that make the geometry below un-walkable.
    pub walkable_height: u16,

    /// Maximum ledge height that is considered to still be traversable. `[Limit: >=0] [Units: vx]`
    ///
    /// Calculated as `(max_climb / cell_height).floor()`.
    /// Allows the mesh to flow over low lying obstructions such as curbs and up/down stairways.
    pub walkable_climb: u16,

    /// The distance to erode/shrink the walkable area of the heightfield away from
    /// obstructions.  `[Limit: >=0] [Units: vx]`
    ///
    /// Calculated as `(agent_radius / cell_size).ceil()`.
    /// With a non-zero radius, an agent only needs to check whether its center point lies on the navmesh.
    /// A radius of zero is allowed, but then callers need to collide the agent with the navmesh edges themselves.
    pub walkable_radius: u16,

    /// The maximum allowed length for contour edges along the border of the mesh. `[Limit: >=0] [Units: vx]`
    ///
    /// Long outer edges can create long thin triangles. Extra vertices are inserted as needed to keep
    /// contour edges below this length. A good value is something like `walkable_radius * 8`.
    /// A value of zero disables this feature.
    pub max_edge_len: u16,

    /// The maximum distance a simplified contour's border edges should deviate
    /// the original raw contour. `[Limit: >=0] [Units: vx]`
    ///
    /// Good values are in the range `[1.1, 1.5]`, with 1.3 being a good starting point.
    /// Lower values start to produce sawtooth edges, higher values cut corners.
    /// Only applies to the xz-plane.
    pub max_simplification_error: f32,

    /// The minimum number of cells allowed to form isolated island areas. `[Limit: >=0] [Units: vx]`
    ///
    /// Regions with fewer spans that do not touch the tile border are removed.
    /// This is useful for removing useless regions that form on geometry such as table tops, box tops, etc.
    pub min_region_area: u16,

    /// Any regions with a span count smaller than this value will, if possible,
    /// be merged with larger regions. `[Limit: >=0] [Units: vx]`
    pub merge_region_area: u16,

    /// The maximum number of vertices allowed for polygons generated during the
    /// contour to polygon conversion process. `[Limit: >= 3]`
    pub max_vertices_per_polygon: u16,

    /// Sets the sampling distance to use when generating the detail mesh.
    /// (For height detail only.) `[Limits: 0 or >= 0.9] [Units: wu]`
    pub detail_sample_dist: f32,

    /// The maximum distance the detail mesh surface should deviate from heightfield
    /// data. (For height detail only.) `[Limit: >=0] [Units: wu]`
    pub detail_sample_max_error: f32,

    /// Flags controlling the [`ContourSet`](crate::ContourSet) generation process.
    pub contour_flags: BuildContoursFlags,

    /// How the walkable area is partitioned into regions.
    pub partition: PartitionType,

    /// Whether unwalkable spans right above walkable ones become walkable, see [`Heightfield::filter_low_hanging_walkable_obstacles`](crate::Heightfield::filter_low_hanging_walkable_obstacles).
    pub filter_low_hanging_obstacles: bool,

    /// Whether spans on ledges become unwalkable, see [`Heightfield::filter_ledge_spans`](crate::Heightfield::filter_ledge_spans).
    pub filter_ledge_spans: bool,

    /// Whether spans with too little headroom become unwalkable, see [`Heightfield::filter_walkable_low_height_spans`](crate::Heightfield::filter_walkable_low_height_spans).
    pub filter_walkable_low_height_spans: bool,

    /// Whether to build a [`DetailNavmesh`](crate::DetailNavmesh).
    pub build_detail_mesh: bool,

    /// Volumes that define areas with specific areas.
    pub area_volumes: Vec<ConvexVolume>,
}

impl Default for NavmeshConfig {
    fn default() -> Self {
        NavmeshConfigBuilder::default().build()
    }
}

impl NavmeshConfig {
    /// Checks the config for values no build can work with.
    pub fn validate(&self) -> Result<(), NavmeshConfigError> {
        if !(self.cell_size > 0.0) || !(self.cell_height > 0.0) {
            return Err(NavmeshConfigError::InvalidCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        if !(0.0..std::f32::consts::FRAC_PI_2).contains(&self.walkable_slope_angle) {
            return Err(NavmeshConfigError::InvalidSlope(self.walkable_slope_angle));
        }
        if self.max_vertices_per_polygon < 3 {
            return Err(NavmeshConfigError::TooFewVerticesPerPolygon(
                self.max_vertices_per_polygon,
            ));
        }
        if self.aabb.min.cmpgt(self.aabb.max).any() {
            return Err(NavmeshConfigError::InvalidAabb);
        }
        Ok(())
    }
}

/// The algorithm used to partition the walkable area into regions.
///
/// - Watershed produces the nicest tessellation, but is the slowest and can create holes and overlaps.
/// - Monotone is the fastest and never creates holes or overlaps, but can create long thin polygons.
/// - Layers is in between. It works best with tiled navmeshes with small tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub enum PartitionType {
    /// Regions are grown from the distance field, see [`CompactHeightfield::build_regions`](crate::CompactHeightfield::build_regions).
    #[default]
    Watershed,
    /// Regions are swept row by row, see [`CompactHeightfield::build_regions_monotone`](crate::CompactHeightfield::build_regions_monotone).
    Monotone,
    /// Regions are non-overlapping layers, see [`CompactHeightfield::build_layer_regions`](crate::CompactHeightfield::build_layer_regions).
    Layers,
}

/// A builder for [`NavmeshConfig`]. The config has lots of interdependent configurations,
/// so this builder provides a convenient way to set all the necessary parameters in world units.
/// The default values are chosen to be reasonable for an agent resembling and adult human.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct NavmeshConfigBuilder {
    /// The xz-plane cell size to use for fields. `[Limit: > 0] [Units: wu]`.
    ///
    /// See [`NavmeshConfig::cell_size`].
    pub cell_size: f32,
    /// The y-axis cell size to use for fields. `[Limit: > 0] [Units: wu]`
    ///
    /// See [`NavmeshConfig::cell_height`].
    pub cell_height: f32,
    /// The height of the agent. `[Limit: > 0] [Units: wu]`
    ///
    /// It's often a good idea to add a little bit of padding to the height. For example,
    /// an agent that is 1.8 world units tall might want to set this value to 2.0 units.
    pub agent_height: f32,
    /// The radius of the agent. `[Limit: > 0] [Units: wu]`
    pub agent_radius: f32,
    /// The highest ledge the agent can step up or down. `[Limit: >= 0] [Units: wu]`
    pub agent_max_climb: f32,
    /// The steepest slope the agent can walk on. `[Limits: 0 <= value < 0.5*π] [Units: Radians]`
    pub agent_max_slope: f32,
    /// The side length of the smallest island that is kept. `[Limit: >= 0] [Units: vx]`
    pub region_min_size: f32,
    /// The side length below which regions are merged into their neighbors. `[Limit: >= 0] [Units: vx]`
    pub region_merge_size: f32,
    /// The maximum length of contour edges along the border of the mesh. `[Limit: >= 0] [Units: wu]`
    pub edge_max_len: f32,
    /// See [`NavmeshConfig::max_simplification_error`]. `[Units: vx]`
    pub edge_max_error: f32,
    /// See [`NavmeshConfig::max_vertices_per_polygon`].
    pub verts_per_poly: u16,
    /// The detail sampling distance in cells. Values below 0.9 disable edge and interior sampling. `[Units: vx]`
    pub detail_sample_dist: f32,
    /// The maximum detail mesh error in cell heights. `[Units: vx]`
    pub detail_sample_max_error: f32,
    /// See [`NavmeshConfig::tile_size`].
    pub tile_size: u16,
    /// The bounds of the input geometry. `[Units: wu]`
    pub aabb: Aabb3d,
    /// See [`NavmeshConfig::contour_flags`].
    pub contour_flags: BuildContoursFlags,
    /// See [`NavmeshConfig::partition`].
    pub partition: PartitionType,
    /// Whether the config is used for tiles. Tiles get a border and are sized by [`NavmeshConfigBuilder::tile_size`].
    pub tiling: bool,
    /// See [`NavmeshConfig::build_detail_mesh`].
    pub build_detail_mesh: bool,
    /// See [`NavmeshConfig::area_volumes`].
    pub area_volumes: Vec<ConvexVolume>,
}

impl Default for NavmeshConfigBuilder {
    fn default() -> Self {
        Self {
            cell_size: 0.3,
            cell_height: 0.2,
            agent_height: 2.0,
            agent_radius: 0.6,
            agent_max_climb: 0.9,
            agent_max_slope: 45.0_f32.to_radians(),
            region_min_size: 8.0,
            region_merge_size: 20.0,
            edge_max_len: 12.0,
            edge_max_error: 1.3,
            verts_per_poly: 6,
            detail_sample_dist: 6.0,
            detail_sample_max_error: 1.0,
            tile_size: 32,
            aabb: Aabb3d::default(),
            contour_flags: BuildContoursFlags::default(),
            partition: PartitionType::default(),
            tiling: false,
            build_detail_mesh: true,
            area_volumes: Vec::new(),
        }
    }
}

impl NavmeshConfigBuilder {
    /// Builds a [`NavmeshConfig`] from the current configuration.
    pub fn build(self) -> NavmeshConfig {
        let walkable_radius = (self.agent_radius / self.cell_size).ceil() as u16;
        // Reserve enough padding.
        let border_size = if self.tiling { walkable_radius + 3 } else { 0 };
        let (width, height) = if self.tiling {
            let size = self.tile_size + border_size * 2;
            (size, size)
        } else {
            let size = self.aabb.size() / self.cell_size;
            ((size.x + 0.5) as u16, (size.z + 0.5) as u16)
        };
        NavmeshConfig {
            width,
            height,
            tile_size: self.tile_size,
            border_size,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            aabb: self.aabb,
            walkable_slope_angle: self.agent_max_slope,
            walkable_height: (self.agent_height / self.cell_height).ceil() as u16,
            walkable_climb: (self.agent_max_climb / self.cell_height).floor() as u16,
            walkable_radius,
            max_edge_len: (self.edge_max_len / self.cell_size) as u16,
            max_simplification_error: self.edge_max_error,
            min_region_area: (self.region_min_size * self.region_min_size) as u16,
            merge_region_area: (self.region_merge_size * self.region_merge_size) as u16,
            max_vertices_per_polygon: self.verts_per_poly,
            detail_sample_dist: if self.detail_sample_dist < 0.9 {
                0.0
            } else {
                self.cell_size * self.detail_sample_dist
            },
            detail_sample_max_error: self.cell_height * self.detail_sample_max_error,
            contour_flags: self.contour_flags,
            partition: self.partition,
            filter_low_hanging_obstacles: true,
            filter_ledge_spans: true,
            filter_walkable_low_height_spans: true,
            build_detail_mesh: self.build_detail_mesh,
            area_volumes: self.area_volumes,
        }
    }
}

/// Errors for configurations no build can work with.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavmeshConfigError {
    /// Cells need a positive size.
    #[error("Cell size and height must be positive, got {cell_size} and {cell_height}")]
    InvalidCellSize {
        /// The configured cell size
        cell_size: f32,
        /// The configured cell height
        cell_height: f32,
    },
    /// The slope must be at least 0 and below 90 degrees.
    #[error("Walkable slope angle must be in [0, π/2), got {0}")]
    InvalidSlope(f32),
    /// A polygon needs at least 3 vertices.
    #[error("Polygons need at least 3 vertices, got {0}")]
    TooFewVerticesPerPolygon(u16),
    /// The minimum of the AABB lies above its maximum.
    #[error("The AABB minimum must not exceed its maximum")]
    InvalidAabb,
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use super::*;

    #[test]
    fn builder_converts_to_voxels() {
        let config = NavmeshConfigBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(30.0, 5.0, 15.0),
            },
            ..Default::default()
        }
        .build();
        assert_eq!((config.width, config.height), (100, 50));
        assert_eq!(config.walkable_height, 10);
        assert_eq!(config.walkable_climb, 4);
        assert_eq!(config.walkable_radius, 2);
        assert_eq!(config.border_size, 0);
        assert_eq!(config.max_edge_len, 40);
        assert_eq!(config.min_region_area, 64);
        assert_eq!(config.merge_region_area, 400);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tiles_get_a_border() {
        let config = NavmeshConfigBuilder {
            tiling: true,
            tile_size: 16,
            ..Default::default()
        }
        .build();
        assert_eq!(config.border_size, config.walkable_radius + 3);
        assert_eq!(config.width, 16 + config.border_size * 2);
        assert_eq!(config.height, config.width);
    }

    #[test]
    fn small_detail_sample_distance_disables_sampling() {
        let config = NavmeshConfigBuilder {
            detail_sample_dist: 0.5,
            ..Default::default()
        }
        .build();
        assert_eq!(config.detail_sample_dist, 0.0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        let mut config = NavmeshConfig::default();
        config.max_vertices_per_polygon = 2;
        assert_eq!(
            config.validate(),
            Err(NavmeshConfigError::TooFewVerticesPerPolygon(2))
        );
        let mut config = NavmeshConfig::default();
        config.walkable_slope_angle = std::f32::consts::FRAC_PI_2;
        assert_eq!(
            config.validate(),
            Err(NavmeshConfigError::InvalidSlope(std::f32::consts::FRAC_PI_2))
        );
        let mut config = NavmeshConfig::default();
        config.cell_size = 0.0;
        assert!(matches!(
            config.validate(),
            Err(NavmeshConfigError::InvalidCellSize { .. })
        ));
    }
}
