//! Tiled builds over a floor larger than a single tile.

use std::sync::{
    Mutex,
    atomic::{AtomicBool, Ordering},
};

use glam::{UVec3, Vec3A};
use walkmesh::{
    NavmeshConfigBuilder, PolygonNavmesh, TileCoord, TileEvent, TiledNavmeshConfig, TriMesh,
};

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

fn tiled(trimesh: &TriMesh) -> TiledNavmeshConfig {
    let config = NavmeshConfigBuilder {
        tiling: true,
        tile_size: 16,
        aabb: trimesh.compute_aabb().unwrap(),
        ..Default::default()
    }
    .build();
    TiledNavmeshConfig::new(config).unwrap()
}

#[test]
fn inner_tiles_have_portals_to_their_neighbors() {
    let trimesh = floor(15.0);
    let tiled = tiled(&trimesh);
    let tiles = tiled.build_tiles(&trimesh, &AtomicBool::new(false), |_| {});
    assert_eq!(tiles.len(), tiled.tile_count());

    let center = tiles
        .iter()
        .find(|tile| tile.coord == TileCoord { x: 1, z: 1 })
        .unwrap();
    let mesh = &center.navmesh.polygon_mesh;
    assert!(mesh.polygon_count() > 0);
    let portal_directions: Vec<_> = (0..mesh.polygon_count())
        .flat_map(|i| mesh.neighbors(i).iter().copied())
        .filter(|neighbor| {
            *neighbor != walkmesh::NULL_INDEX && neighbor & PolygonNavmesh::PORTAL_FLAG != 0
        })
        .map(|neighbor| neighbor & !PolygonNavmesh::PORTAL_FLAG)
        .collect();
    for direction in 0..4 {
        assert!(
            portal_directions.contains(&direction),
            "no portal in direction {direction}"
        );
    }
}

#[test]
fn cancelling_mid_build_stops_new_tiles() {
    let trimesh = floor(15.0);
    let tiled = tiled(&trimesh);
    let cancel = AtomicBool::new(false);
    let cancelled = Mutex::new(Vec::new());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(1)
        .build()
        .unwrap();
    let tiles = pool.install(|| {
        tiled.build_tiles(&trimesh, &cancel, |event| match event {
            TileEvent::Finished { .. } => cancel.store(true, Ordering::Relaxed),
            TileEvent::Cancelled { coord } => cancelled.lock().unwrap().push(coord),
            TileEvent::Failed { error, .. } => panic!("{error}"),
        })
    });
    assert_eq!(tiles.len(), 1);
    assert_eq!(cancelled.into_inner().unwrap().len(), tiled.tile_count() - 1);
}
