//! Builds a navmesh tile by tile on the xz-plane.
//!
//! Tiles are built independently of each other on the rayon thread pool. Each tile is rasterized with a
//! border of [`NavmeshConfig::border_size`] cells so that the edges of neighboring tiles line up.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use glam::{Vec2, Vec3, Vec3Swizzles as _};
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    HeightfieldLayerSet, NavmeshConfig,
    config::NavmeshConfigError,
    input::InputGeometry,
    main_api::{Navmesh, NavmeshError, build_layers, build_navmesh},
    math::{Aabb2d, Aabb3d},
};

/// A tile coordinate on the xz-plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct TileCoord {
    /// The tile index along the x-axis
    pub x: u16,
    /// The tile index along the z-axis
    pub z: u16,
}

/// The tile grid over [`NavmeshConfig::aabb`].
#[derive(Debug, Clone)]
pub struct TiledNavmeshConfig {
    /// The configuration every tile is built with. Its AABB covers all tiles.
    pub config: NavmeshConfig,
    /// Number of tiles along the x-axis
    pub tiles_x: u16,
    /// Number of tiles along the z-axis
    pub tiles_z: u16,
}

/// A single built tile.
#[derive(Debug, Clone)]
pub struct NavmeshTile {
    /// Where the tile is in the grid
    pub coord: TileCoord,
    /// The navmesh of the tile. Only off-mesh connections starting inside the tile are kept.
    pub navmesh: Navmesh,
}

/// Progress notifications of [`TiledNavmeshConfig::build_tiles`] and [`TiledNavmeshConfig::build_layer_tiles`].
#[derive(Debug, Clone, Copy)]
pub enum TileEvent<'a> {
    /// A tile was built.
    Finished {
        /// The tile
        coord: TileCoord,
        /// How many tiles were processed so far, including failed ones
        processed: usize,
        /// The number of tiles in the grid
        total: usize,
    },
    /// A tile failed to build and is left out of the result.
    Failed {
        /// The tile
        coord: TileCoord,
        /// Why the tile failed
        error: &'a TileError,
    },
    /// A tile was not started because the build was cancelled.
    Cancelled {
        /// The tile
        coord: TileCoord,
    },
}

impl TiledNavmeshConfig {
    /// Lays a grid of tiles of [`NavmeshConfig::tile_size`] cells over [`NavmeshConfig::aabb`].
    ///
    /// # Errors
    ///
    /// Returns an error if the tile size is zero or the config is invalid.
    pub fn new(config: NavmeshConfig) -> Result<Self, TiledNavmeshError> {
        config.validate()?;
        if config.tile_size == 0 {
            return Err(TiledNavmeshError::TilingNotEnabled);
        }
        let size = config.aabb.size();
        let tile_world_size = config.tile_size as f32 * config.cell_size;
        let tiles_x = (size.x / tile_world_size).ceil() as u16;
        let tiles_z = (size.z / tile_world_size).ceil() as u16;
        Ok(Self {
            config,
            tiles_x,
            tiles_z,
        })
    }

    /// Returns the total number of tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles_x as usize * self.tiles_z as usize
    }

    /// Returns all tile coordinates, row by row.
    pub fn tile_coords(&self) -> impl Iterator<Item = TileCoord> {
        let tiles_x = self.tiles_x;
        (0..self.tiles_z).flat_map(move |z| (0..tiles_x).map(move |x| TileCoord { x, z }))
    }

    /// The area of the tile without its border.
    pub fn tile_rect(&self, coord: TileCoord) -> Aabb2d {
        let tile_world_size = self.config.tile_size as f32 * self.config.cell_size;
        let min = self.config.aabb.min.xz()
            + Vec2::new(coord.x as f32, coord.z as f32) * tile_world_size;
        Aabb2d {
            min,
            max: min + tile_world_size,
        }
    }

    /// The AABB a tile is rasterized in, including its border.
    pub fn tile_aabb(&self, coord: TileCoord) -> Aabb3d {
        let rect = self.tile_rect(coord);
        let border = self.config.border_size as f32 * self.config.cell_size;
        Aabb3d {
            min: Vec3::new(rect.min.x - border, self.config.aabb.min.y, rect.min.y - border),
            max: Vec3::new(rect.max.x + border, self.config.aabb.max.y, rect.max.y + border),
        }
    }

    /// The config a single tile is built with.
    pub fn tile_config(&self, coord: TileCoord) -> NavmeshConfig {
        let size = self.config.tile_size + self.config.border_size * 2;
        NavmeshConfig {
            aabb: self.tile_aabb(coord),
            width: size,
            height: size,
            ..self.config.clone()
        }
    }

    /// Builds the navmesh of a single tile.
    pub fn build_tile(
        &self,
        coord: TileCoord,
        input: &impl InputGeometry,
    ) -> Result<NavmeshTile, TileError> {
        let _span = tracing::info_span!("build_tile", x = coord.x, z = coord.z).entered();
        let mut navmesh = build_navmesh(input, &self.tile_config(coord))
            .map_err(|source| TileError { coord, source })?;
        let rect = self.tile_rect(coord);
        navmesh.off_mesh_connections.retain(|connection| {
            let start = connection.start.xz();
            start.cmpge(rect.min).all() && start.cmplt(rect.max).all()
        });
        Ok(NavmeshTile { coord, navmesh })
    }

    /// Builds the heightfield layers of a single tile.
    pub fn build_tile_layers(
        &self,
        coord: TileCoord,
        input: &impl InputGeometry,
    ) -> Result<HeightfieldLayerSet, TileError> {
        let _span = tracing::info_span!("build_tile_layers", x = coord.x, z = coord.z).entered();
        build_layers(input, &self.tile_config(coord)).map_err(|source| TileError { coord, source })
    }

    /// Builds all tiles in parallel.
    ///
    /// Tiles that fail are reported through `on_event` and left out of the result.
    /// Once `cancel` is set, tiles that have not started yet are skipped.
    pub fn build_tiles<G, F>(&self, input: &G, cancel: &AtomicBool, on_event: F) -> Vec<NavmeshTile>
    where
        G: InputGeometry + Sync,
        F: Fn(TileEvent<'_>) + Sync,
    {
        self.run_parallel(cancel, on_event, |coord| self.build_tile(coord, input))
    }

    /// Builds the heightfield layers of all tiles in parallel.
    ///
    /// Behaves like [`TiledNavmeshConfig::build_tiles`].
    pub fn build_layer_tiles<G, F>(
        &self,
        input: &G,
        cancel: &AtomicBool,
        on_event: F,
    ) -> Vec<(TileCoord, HeightfieldLayerSet)>
    where
        G: InputGeometry + Sync,
        F: Fn(TileEvent<'_>) + Sync,
    {
        self.run_parallel(cancel, on_event, |coord| {
            self.build_tile_layers(coord, input).map(|layers| (coord, layers))
        })
    }

    fn run_parallel<T, F, B>(&self, cancel: &AtomicBool, on_event: F, build: B) -> Vec<T>
    where
        T: Send,
        F: Fn(TileEvent<'_>) + Sync,
        B: Fn(TileCoord) -> Result<T, TileError> + Sync,
    {
        let total = self.tile_count();
        let processed = AtomicUsize::new(0);
        let coords: Vec<_> = self.tile_coords().collect();
        let tiles: Vec<T> = coords
            .into_par_iter()
            .filter_map(|coord| {
                if cancel.load(Ordering::Relaxed) {
                    on_event(TileEvent::Cancelled { coord });
                    return None;
                }
                let result = build(coord);
                let processed = processed.fetch_add(1, Ordering::Relaxed) + 1;
                match result {
                    Ok(tile) => {
                        on_event(TileEvent::Finished {
                            coord,
                            processed,
                            total,
                        });
                        Some(tile)
                    }
                    Err(error) => {
                        tracing::error!("{error}");
                        on_event(TileEvent::Failed {
                            coord,
                            error: &error,
                        });
                        None
                    }
                }
            })
            .collect();
        tracing::debug!(built = tiles.len(), total, "finished building tiles");
        tiles
    }
}

/// Errors when setting up a [`TiledNavmeshConfig`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TiledNavmeshError {
    /// The tile size is zero.
    #[error("Tiling is not enabled in the config")]
    TilingNotEnabled,
    /// The config cannot be built with.
    #[error(transparent)]
    Config(#[from] NavmeshConfigError),
}

/// A tile that failed to build.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Failed to build tile ({}, {}): {source}", .coord.x, .coord.z)]
pub struct TileError {
    /// The tile that failed
    pub coord: TileCoord,
    /// Why it failed
    #[source]
    pub source: NavmeshError,
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use glam::{UVec3, Vec3A};

    use super::*;
    use crate::{
        AreaType, NavmeshConfigBuilder, TriMesh,
        input::{InputMesh, OffMeshConnection},
    };

    fn floor() -> TriMesh {
        let mut trimesh = TriMesh::new(
            vec![
                Vec3A::new(0.0, 0.0, 0.0),
                Vec3A::new(0.0, 0.0, 10.0),
                Vec3A::new(10.0, 0.0, 10.0),
                Vec3A::new(10.0, 0.0, 0.0),
            ],
            vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
        );
        trimesh.mark_walkable_triangles(45.0_f32.to_radians());
        trimesh
    }

    fn tiled() -> TiledNavmeshConfig {
        let config = NavmeshConfigBuilder {
            tiling: true,
            tile_size: 16,
            aabb: floor().compute_aabb().unwrap(),
            ..Default::default()
        }
        .build();
        TiledNavmeshConfig::new(config).unwrap()
    }

    #[test]
    fn grid_covers_the_aabb() {
        let tiled = tiled();
        assert_eq!((tiled.tiles_x, tiled.tiles_z), (3, 3));
        let coords: Vec<_> = tiled.tile_coords().collect();
        assert_eq!(coords.len(), 9);
        assert_eq!(coords[1], TileCoord { x: 1, z: 0 });
    }

    #[test]
    fn tile_aabb_includes_border() {
        let tiled = tiled();
        let aabb = tiled.tile_aabb(TileCoord { x: 0, z: 0 });
        let border = tiled.config.border_size as f32 * tiled.config.cell_size;
        approx::assert_relative_eq!(aabb.min.x, -border);
        approx::assert_relative_eq!(aabb.max.z, 16.0 * 0.3 + border);
        let config = tiled.tile_config(TileCoord { x: 0, z: 0 });
        assert_eq!(config.width, 16 + 2 * tiled.config.border_size);
    }

    #[test]
    fn tiling_needs_a_tile_size() {
        let mut config = NavmeshConfig::default();
        config.tile_size = 0;
        assert_eq!(
            TiledNavmeshConfig::new(config).unwrap_err(),
            TiledNavmeshError::TilingNotEnabled
        );
    }

    #[test]
    fn builds_all_tiles_in_parallel() {
        let tiled = tiled();
        let events = Mutex::new(Vec::new());
        let tiles = tiled.build_tiles(&floor(), &AtomicBool::new(false), |event| {
            if let TileEvent::Finished { processed, total, .. } = event {
                events.lock().unwrap().push((processed, total));
            }
        });
        assert_eq!(tiles.len(), 9);
        let mut events = events.into_inner().unwrap();
        events.sort();
        assert_eq!(events.last(), Some(&(9, 9)));
        assert_eq!(events.len(), 9);

        let center = tiles
            .iter()
            .find(|tile| tile.coord == TileCoord { x: 1, z: 1 })
            .unwrap();
        assert!(center.navmesh.polygon_mesh.polygon_count() > 0);
    }

    #[test]
    fn cancelled_build_skips_all_tiles() {
        let tiled = tiled();
        let cancelled = AtomicUsize::new(0);
        let tiles = tiled.build_tiles(&floor(), &AtomicBool::new(true), |event| {
            if let TileEvent::Cancelled { .. } = event {
                cancelled.fetch_add(1, Ordering::Relaxed);
            }
        });
        assert!(tiles.is_empty());
        assert_eq!(cancelled.into_inner(), 9);
    }

    #[test]
    fn off_mesh_connections_stay_with_their_start_tile() {
        let tiled = tiled();
        let input = InputMesh {
            off_mesh_connections: vec![OffMeshConnection {
                start: Vec3A::new(6.0, 0.0, 6.0),
                end: Vec3A::new(1.0, 0.0, 1.0),
                radius: 0.5,
                bidirectional: false,
                area: AreaType::DEFAULT_WALKABLE,
                flags: 1,
            }],
            ..InputMesh::from(floor())
        };
        let center = tiled.build_tile(TileCoord { x: 1, z: 1 }, &input).unwrap();
        assert_eq!(center.navmesh.off_mesh_connections.len(), 1);
        let corner = tiled.build_tile(TileCoord { x: 0, z: 0 }, &input).unwrap();
        assert!(corner.navmesh.off_mesh_connections.is_empty());
    }

    #[test]
    fn layer_tiles_are_built() {
        let tiled = tiled();
        let layers = tiled.build_layer_tiles(&floor(), &AtomicBool::new(false), |_| {});
        assert_eq!(layers.len(), 9);
        let (_, center) = layers
            .iter()
            .find(|(coord, _)| *coord == TileCoord { x: 1, z: 1 })
            .unwrap();
        assert_eq!(center.layers.len(), 1);
    }
}
