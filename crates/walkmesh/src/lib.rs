#![doc = include_str!("../../../readme.md")]

mod compact_cell;
mod compact_heightfield;
mod compact_span;
mod config;
mod contours;
mod detail_mesh;
mod erosion;
mod heightfield;
mod heightfield_layers;
mod input;
mod layer_regions;
mod main_api;
mod mark_area;
pub(crate) mod math;
mod monotone_regions;
mod poly_mesh;
mod pre_filter;
mod rasterize;
mod rasterize_shapes;
mod region;
mod region_merge;
mod span;
mod tiled;
mod trimesh;
mod watershed_build_regions;
mod watershed_distance_field;

pub use compact_cell::CompactCell;
pub use compact_heightfield::{CompactHeightfield, CompactHeightfieldError};
pub use compact_span::CompactSpan;
pub use config::{NavmeshConfig, NavmeshConfigBuilder, NavmeshConfigError, PartitionType};
pub use contours::{
    BuildContoursFlags, Contour, ContourError, ContourSet, ContourVertex, RegionVertexId,
};
pub use detail_mesh::{
    DetailNavmesh, DetailNavmeshError, MAX_DETAIL_TRIANGLES, MAX_DETAIL_VERTICES, SubMesh,
};
pub use heightfield::{
    Heightfield, HeightfieldBuilder, HeightfieldBuilderError, SpanInsertion, SpanInsertionError,
};
pub use heightfield_layers::{HeightfieldLayer, HeightfieldLayerError, HeightfieldLayerSet};
pub use input::{InputGeometry, InputMesh, OffMeshConnection};
pub use main_api::{Navmesh, NavmeshError, build_layers, build_navmesh};
pub use mark_area::{AreaModification, ConvexVolume};
pub use math::{Aabb2d, Aabb3d};
pub use poly_mesh::{NULL_INDEX, PolygonNavmesh, PolygonNavmeshError};
pub use rasterize::RasterizationError;
pub use region::RegionId;
pub use region_merge::RegionError;
pub use span::{AreaType, Span, SpanBuilder, SpanKey, Spans};
pub use tiled::{
    NavmeshTile, TileCoord, TileError, TileEvent, TiledNavmeshConfig, TiledNavmeshError,
};
pub use trimesh::TriMesh;
