//! Decomposition of a [`ContourSet`] into convex polygons.

use std::collections::VecDeque;

use glam::{IVec3, U16Vec3};
use thiserror::Error;

use crate::{
    Aabb3d, AreaType, RegionId, RegionVertexId,
    contours::ContourSet,
    math::{intersect, intersect_prop, left, left_on, next, prev, vequal_xz},
};

/// Sentinel for unused vertex and neighbor slots of a polygon.
pub const NULL_INDEX: u16 = 0xffff;

/// Marks a polygon whose parts came from different regions.
const MULTIPLE_REGIONS: RegionId = RegionId::NONE;

const VERTEX_BUCKET_COUNT: usize = 1 << 12;

/// Represents a polygon mesh suitable for use in building a navigation mesh.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct PolygonNavmesh {
    /// The mesh vertices. [Units: vx]
    pub vertices: Vec<U16Vec3>,
    /// Polygon and neighbor data. [Length: `polygon_count * 2 * max_vertices_per_polygon`]
    ///
    /// Each polygon stores `max_vertices_per_polygon` vertex indices, padded with [`NULL_INDEX`],
    /// followed by the same number of neighbor slots. The neighbor slot `i` describes the edge
    /// starting at vertex slot `i`: either the index of the polygon on the other side,
    /// [`NULL_INDEX`] for a solid edge, or `0x8000 | dir` for a portal to the neighboring tile in direction `dir`.
    pub polygons: Vec<u16>,
    /// The region id assigned to each polygon.
    pub regions: Vec<RegionId>,
    /// The flags assigned to each polygon.
    pub flags: Vec<u16>,
    /// The area id assigned to each polygon.
    pub areas: Vec<AreaType>,
    /// The maximum number of vertices per polygon
    pub max_vertices_per_polygon: usize,
    /// The bounding box of the mesh in world space.
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The AABB border size used to generate the source data from which the mesh was derived.
    pub border_size: u16,
    /// The max error of the polygon edges in the mesh.
    pub max_edge_error: f32,
}

impl PolygonNavmesh {
    /// Neighbor slot value marking an edge that leads out of the tile.
    pub const PORTAL_FLAG: u16 = 0x8000;

    /// The number of polygons in the mesh.
    #[inline]
    pub fn polygon_count(&self) -> usize {
        self.regions.len()
    }

    /// The vertex slots of polygon `i`, padded with [`NULL_INDEX`].
    #[inline]
    pub fn polygon(&self, i: usize) -> &[u16] {
        let nvp = self.max_vertices_per_polygon;
        &self.polygons[i * 2 * nvp..i * 2 * nvp + nvp]
    }

    /// The neighbor slots of polygon `i`.
    #[inline]
    pub fn neighbors(&self, i: usize) -> &[u16] {
        let nvp = self.max_vertices_per_polygon;
        &self.polygons[i * 2 * nvp + nvp..(i + 1) * 2 * nvp]
    }

    /// Iterates over the vertex indices of polygon `i`, skipping unused slots.
    pub fn polygon_vertices(&self, i: usize) -> impl Iterator<Item = u16> + '_ {
        self.polygon(i)
            .iter()
            .copied()
            .take_while(|index| *index != NULL_INDEX)
    }

    fn push_polygon(&mut self, vertices: &[u16], region: RegionId, area: AreaType) {
        let nvp = self.max_vertices_per_polygon;
        self.polygons.extend_from_slice(&vertices[..nvp]);
        self.polygons.extend(std::iter::repeat_n(NULL_INDEX, nvp));
        self.regions.push(region);
        self.areas.push(area);
    }

    fn swap_remove_polygon(&mut self, i: usize) {
        let stride = 2 * self.max_vertices_per_polygon;
        let last = self.polygon_count() - 1;
        if i != last {
            self.polygons
                .copy_within(last * stride..(last + 1) * stride, i * stride);
        }
        self.polygons.truncate(last * stride);
        self.regions.swap_remove(i);
        self.areas.swap_remove(i);
    }

    fn can_remove_vertex(&self, rem: u16) -> bool {
        // Count number of polygons to remove.
        let mut touched_vertices = 0;
        let mut remaining_edges = 0;
        for i in 0..self.polygon_count() {
            let nv = count_poly_verts(self.polygon(i));
            let removed = self.polygon(i)[..nv].iter().filter(|v| **v == rem).count();
            if removed > 0 {
                touched_vertices += removed;
                remaining_edges += nv - (removed + 1);
            }
        }
        // There would be too few edges remaining to create a polygon.
        // This can happen for example when a tip of a triangle is marked
        // as deletion, but there are no other polys that share the vertex.
        // In this case, the vertex should not be removed.
        if remaining_edges <= 2 {
            return false;
        }

        // Find edges which share the removed vertex.
        // Each entry is the other vertex of the edge and how many polygons share the edge.
        let mut edges: Vec<(u16, u32)> = Vec::with_capacity(touched_vertices * 2);
        for i in 0..self.polygon_count() {
            let p = self.polygon(i);
            let nv = count_poly_verts(p);

            // Collect edges which touches the removed vertex.
            let mut k = nv - 1;
            for j in 0..nv {
                if p[j] == rem || p[k] == rem {
                    // Arrange edge so that a=rem.
                    let b = if p[k] == rem { p[j] } else { p[k] };
                    // Check if the edge exists
                    if let Some(edge) = edges.iter_mut().find(|(other, _)| *other == b) {
                        // Exists, increment vertex share count.
                        edge.1 += 1;
                    } else {
                        // Add new edge.
                        edges.push((b, 1));
                    }
                }
                k = j;
            }
        }

        // There should be no more than 2 open edges.
        // This catches the case that two non-adjacent polygons
        // are sharing the removed vertex. In that case, do not
        // remove the vertex.
        let open_edges = edges.iter().filter(|(_, shares)| *shares < 2).count();
        open_edges <= 2
    }

    fn remove_vertex(&mut self, rem: u16, max_polygons: usize) -> Result<(), PolygonNavmeshError> {
        let nvp = self.max_vertices_per_polygon;

        let mut edges: Vec<HoleEdge> = Vec::new();
        let mut i = 0;
        while i < self.polygon_count() {
            let p = self.polygon(i);
            let nv = count_poly_verts(p);
            if !p[..nv].contains(&rem) {
                i += 1;
                continue;
            }
            // Collect edges which does not touch the removed vertex.
            let mut k = nv - 1;
            for j in 0..nv {
                if p[j] != rem && p[k] != rem {
                    edges.push(HoleEdge {
                        from: p[k],
                        to: p[j],
                        region: self.regions[i],
                        area: self.areas[i],
                    });
                }
                k = j;
            }
            // Remove the polygon.
            self.swap_remove_polygon(i);
        }

        // Remove vertex.
        self.vertices.remove(rem as usize);

        // Adjust indices to match the removed vertex layout.
        for i in 0..self.polygon_count() {
            let start = i * 2 * nvp;
            let nv = count_poly_verts(self.polygon(i));
            for vertex in &mut self.polygons[start..start + nv] {
                if *vertex > rem {
                    *vertex -= 1;
                }
            }
        }
        for edge in &mut edges {
            if edge.from > rem {
                edge.from -= 1;
            }
            if edge.to > rem {
                edge.to -= 1;
            }
        }

        if edges.is_empty() {
            return Ok(());
        }

        // Start with one vertex, keep appending connected
        // segments to the start and end of the hole.
        let mut hole = VecDeque::with_capacity(edges.len() + 1);
        hole.push_back((edges[0].from, edges[0].region, edges[0].area));

        while !edges.is_empty() {
            let mut matched = false;
            let mut i = 0;
            while i < edges.len() {
                let edge = edges[i];
                let add = match (hole.front(), hole.back()) {
                    (Some(front), _) if front.0 == edge.to => {
                        // The segment matches the beginning of the hole boundary.
                        hole.push_front((edge.from, edge.region, edge.area));
                        true
                    }
                    (_, Some(back)) if back.0 == edge.from => {
                        // The segment matches the end of the hole boundary.
                        hole.push_back((edge.to, edge.region, edge.area));
                        true
                    }
                    _ => false,
                };
                if add {
                    // The edge segment was added, remove it.
                    edges.swap_remove(i);
                    matched = true;
                } else {
                    i += 1;
                }
            }
            if !matched {
                break;
            }
        }

        // Generate temp vertex array for triangulation.
        let hole_positions: Vec<IVec3> = hole
            .iter()
            .map(|(vertex, _, _)| self.vertices[*vertex as usize].as_ivec3())
            .collect();

        // Triangulate the hole.
        let mut tris = Vec::with_capacity(hole.len());
        if !triangulate(&hole_positions, &mut tris) {
            tracing::warn!("Removing a border vertex: triangulation of the hole returned bad results.");
        }

        // Merge the hole triangles back to polygons.
        let mut polys = Vec::with_capacity(tris.len());
        let mut poly_regions = Vec::with_capacity(tris.len());
        let mut poly_areas = Vec::with_capacity(tris.len());
        for t in &tris {
            if t[0] == t[1] || t[0] == t[2] || t[1] == t[2] {
                continue;
            }
            let mut poly = vec![NULL_INDEX; nvp];
            for (slot, corner) in poly.iter_mut().zip(t) {
                *slot = hole[*corner].0;
            }
            polys.push(poly);
            // If this polygon covers multiple region types then mark it as such
            let (r0, r1, r2) = (hole[t[0]].1, hole[t[1]].1, hole[t[2]].1);
            poly_regions.push(if r0 != r1 || r1 != r2 {
                MULTIPLE_REGIONS
            } else {
                r0
            });
            poly_areas.push(hole[t[0]].2);
        }
        if polys.is_empty() {
            return Ok(());
        }

        // Merge polygons.
        if nvp > 3 {
            merge_polygons(&mut polys, &self.vertices, nvp, |pa, pb| {
                if poly_regions[pa] != poly_regions[pb] {
                    poly_regions[pa] = MULTIPLE_REGIONS;
                }
                poly_regions.swap_remove(pb);
                poly_areas.swap_remove(pb);
            });
        }

        // Store polygons.
        for ((poly, region), area) in polys.iter().zip(poly_regions).zip(poly_areas) {
            if self.polygon_count() >= max_polygons {
                return Err(PolygonNavmeshError::TooManyPolygons {
                    max: max_polygons,
                });
            }
            self.push_polygon(poly, region, area);
        }
        Ok(())
    }

    fn build_adjacency(&mut self) {
        #[derive(Clone, Copy)]
        struct Edge {
            vertices: [u16; 2],
            polygons: [usize; 2],
            polygon_edges: [usize; 2],
        }

        let nvp = self.max_vertices_per_polygon;
        let polygon_count = self.polygon_count();
        let mut first_edge = vec![usize::MAX; self.vertices.len()];
        let mut next_edge = Vec::with_capacity(polygon_count * nvp);
        let mut edges: Vec<Edge> = Vec::with_capacity(polygon_count * nvp);

        let edge_vertices = |p: &[u16], j: usize| {
            let v0 = p[j];
            let v1 = if j + 1 >= nvp || p[j + 1] == NULL_INDEX {
                p[0]
            } else {
                p[j + 1]
            };
            (v0, v1)
        };

        for i in 0..polygon_count {
            let p = self.polygon(i);
            for j in 0..count_poly_verts(p) {
                let (v0, v1) = edge_vertices(p, j);
                if v0 < v1 {
                    edges.push(Edge {
                        vertices: [v0, v1],
                        polygons: [i, i],
                        polygon_edges: [j, 0],
                    });
                    // Insert edge
                    next_edge.push(first_edge[v0 as usize]);
                    first_edge[v0 as usize] = edges.len() - 1;
                }
            }
        }

        for i in 0..polygon_count {
            let p = self.polygon(i);
            for j in 0..count_poly_verts(p) {
                let (v0, v1) = edge_vertices(p, j);
                if v0 > v1 {
                    let mut e = first_edge[v1 as usize];
                    while e != usize::MAX {
                        let edge = &mut edges[e];
                        if edge.vertices[1] == v0 && edge.polygons[0] == edge.polygons[1] {
                            edge.polygons[1] = i;
                            edge.polygon_edges[1] = j;
                            break;
                        }
                        e = next_edge[e];
                    }
                }
            }
        }

        // Store adjacency
        for edge in &edges {
            if edge.polygons[0] != edge.polygons[1] {
                let [p0, p1] = edge.polygons;
                self.polygons[p0 * 2 * nvp + nvp + edge.polygon_edges[0]] = p1 as u16;
                self.polygons[p1 * 2 * nvp + nvp + edge.polygon_edges[1]] = p0 as u16;
            }
        }
    }

    /// Marks the unconnected edges that lie on the tile border as portals.
    fn mark_portal_edges(&mut self, width: u16, height: u16) {
        let nvp = self.max_vertices_per_polygon;
        for i in 0..self.polygon_count() {
            let nv = count_poly_verts(self.polygon(i));
            for j in 0..nv {
                let slot = i * 2 * nvp + nvp + j;
                // Skip connected edges.
                if self.polygons[slot] != NULL_INDEX {
                    continue;
                }
                let p = self.polygon(i);
                let nj = if j + 1 >= nv { 0 } else { j + 1 };
                let va = self.vertices[p[j] as usize];
                let vb = self.vertices[p[nj] as usize];

                let dir = if va.x == 0 && vb.x == 0 {
                    Some(0)
                } else if va.z == height && vb.z == height {
                    Some(1)
                } else if va.x == width && vb.x == width {
                    Some(2)
                } else if va.z == 0 && vb.z == 0 {
                    Some(3)
                } else {
                    None
                };
                if let Some(dir) = dir {
                    self.polygons[slot] = Self::PORTAL_FLAG | dir;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct HoleEdge {
    from: u16,
    to: u16,
    region: RegionId,
    area: AreaType,
}

impl ContourSet {
    /// Builds a polygon mesh from the provided contours.
    ///
    /// Each contour is triangulated and the triangles are merged into convex polygons
    /// with at most `max_vertices_per_polygon` vertices. Vertices on the tile border are removed
    /// so that the meshes of neighboring tiles line up.
    ///
    /// - `max_vertices_per_polygon`: The maximum number of vertices per polygon. [Limits: >= 3]
    pub fn build_polygon_mesh(
        &self,
        max_vertices_per_polygon: usize,
    ) -> Result<PolygonNavmesh, PolygonNavmeshError> {
        let _span = tracing::trace_span!("build_polygon_mesh").entered();
        let nvp = max_vertices_per_polygon;
        if nvp < 3 {
            return Err(PolygonNavmeshError::TooFewVerticesPerPolygon(nvp));
        }

        let contours = self
            .contours
            .iter()
            .filter(|contour| contour.vertices.len() >= 3);
        let mut max_vertices = 0;
        let mut max_polygons = 0;
        for contour in contours.clone() {
            max_vertices += contour.vertices.len();
            max_polygons += contour.vertices.len() - 2;
        }
        if max_vertices >= 0xfffe {
            return Err(PolygonNavmeshError::TooManyVertices {
                count: max_vertices,
                max: 0xfffe,
            });
        }

        let mut mesh = PolygonNavmesh {
            vertices: Vec::with_capacity(max_vertices),
            polygons: Vec::with_capacity(max_polygons * nvp * 2),
            regions: Vec::with_capacity(max_polygons),
            flags: Vec::new(),
            areas: Vec::with_capacity(max_polygons),
            max_vertices_per_polygon: nvp,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            border_size: self.border_size,
            max_edge_error: self.max_error,
        };

        let mut remove_vertex = vec![false; max_vertices];
        let mut lookup = VertexLookup::with_capacity(max_vertices);
        let mut indices = Vec::new();
        let mut tris = Vec::new();
        let mut positions = Vec::new();

        for contour in contours {
            // Triangulate contour
            positions.clear();
            positions.extend(contour.vertices.iter().map(|vertex| vertex.position));
            tris.clear();
            if !triangulate(&positions, &mut tris) {
                // Bad triangulation, should not happen.
                tracing::warn!(
                    region = contour.region.bits(),
                    "Bad triangulation of contour, the result may have holes."
                );
            }

            // Add and merge vertices.
            indices.clear();
            for vertex in &contour.vertices {
                let index = lookup.add(&mut mesh.vertices, vertex.position.as_u16vec3());
                if vertex.flags.contains(RegionVertexId::BORDER_VERTEX) {
                    // This vertex should be removed.
                    remove_vertex[index as usize] = true;
                }
                indices.push(index);
            }

            // Build initial polygons.
            let mut polys: Vec<Vec<u16>> = tris
                .iter()
                .filter(|t| t[0] != t[1] && t[0] != t[2] && t[1] != t[2])
                .map(|t| {
                    let mut poly = vec![NULL_INDEX; nvp];
                    for (slot, corner) in poly.iter_mut().zip(t) {
                        *slot = indices[*corner];
                    }
                    poly
                })
                .collect();
            if polys.is_empty() {
                continue;
            }

            // Merge polygons.
            if nvp > 3 {
                merge_polygons(&mut polys, &mesh.vertices, nvp, |_, _| {});
            }

            // Store polygons.
            for poly in &polys {
                mesh.push_polygon(poly, contour.region, contour.area);
                if mesh.polygon_count() > max_polygons {
                    return Err(PolygonNavmeshError::TooManyPolygons { max: max_polygons });
                }
            }
        }

        // Remove edge vertices.
        let mut i = 0;
        while i < mesh.vertices.len() {
            if remove_vertex[i] && mesh.can_remove_vertex(i as u16) {
                mesh.remove_vertex(i as u16, max_polygons)?;
                // Fixup vertex flags
                remove_vertex.remove(i);
                continue;
            }
            i += 1;
        }

        // Calculate adjacency.
        mesh.build_adjacency();

        // Find portal edges
        if mesh.border_size > 0 {
            mesh.mark_portal_edges(self.width, self.height);
        }

        mesh.flags = mesh
            .areas
            .iter()
            .map(|area| u16::from(area.is_walkable()))
            .collect();

        tracing::debug!(
            vertices = mesh.vertices.len(),
            polygons = mesh.polygon_count(),
            "built polygon mesh"
        );
        Ok(mesh)
    }
}

/// Welds vertices that share the same xz-position and are at most 2 voxels apart vertically.
struct VertexLookup {
    first_vertex: Vec<u16>,
    next_vertex: Vec<u16>,
}

impl VertexLookup {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            first_vertex: vec![NULL_INDEX; VERTEX_BUCKET_COUNT],
            next_vertex: Vec::with_capacity(capacity),
        }
    }

    fn add(&mut self, vertices: &mut Vec<U16Vec3>, vertex: U16Vec3) -> u16 {
        let bucket = compute_vertex_hash(vertex.x as i32, 0, vertex.z as i32);
        let mut i = self.first_vertex[bucket];
        while i != NULL_INDEX {
            let v = vertices[i as usize];
            if v.x == vertex.x && v.y.abs_diff(vertex.y) <= 2 && v.z == vertex.z {
                return i;
            }
            i = self.next_vertex[i as usize];
        }

        // Could not find, create new.
        let i = vertices.len() as u16;
        vertices.push(vertex);
        self.next_vertex.push(self.first_vertex[bucket]);
        self.first_vertex[bucket] = i;
        i
    }
}

fn compute_vertex_hash(x: i32, y: i32, z: i32) -> usize {
    const H1: u32 = 0x8da6b343; // Large multiplicative constants;
    const H2: u32 = 0xd8163841; // here arbitrarily chosen primes
    const H3: u32 = 0xcb1ab31f;
    let n = H1
        .wrapping_mul(x as u32)
        .wrapping_add(H2.wrapping_mul(y as u32))
        .wrapping_add(H3.wrapping_mul(z as u32));
    n as usize & (VERTEX_BUCKET_COUNT - 1)
}

#[inline]
fn count_poly_verts(polygon: &[u16]) -> usize {
    polygon
        .iter()
        .take_while(|index| **index != NULL_INDEX)
        .count()
}

#[inline]
fn uleft(a: U16Vec3, b: U16Vec3, c: U16Vec3) -> bool {
    left(a.as_ivec3(), b.as_ivec3(), c.as_ivec3())
}

/// Returns the squared length of the shared edge and the edge indices in both polygons
/// if the two polygons can be merged into a convex polygon with at most `nvp` vertices.
fn get_poly_merge_value(
    pa: &[u16],
    pb: &[u16],
    vertices: &[U16Vec3],
    nvp: usize,
) -> Option<(i32, usize, usize)> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);

    // If the merged polygon would be too big, do not merge.
    if na + nb - 2 > nvp {
        return None;
    }

    // Check if the polygons share an edge.
    let mut shared = None;
    'outer: for i in 0..na {
        let (mut va0, mut va1) = (pa[i], pa[(i + 1) % na]);
        if va0 > va1 {
            std::mem::swap(&mut va0, &mut va1);
        }
        for j in 0..nb {
            let (mut vb0, mut vb1) = (pb[j], pb[(j + 1) % nb]);
            if vb0 > vb1 {
                std::mem::swap(&mut vb0, &mut vb1);
            }
            if va0 == vb0 && va1 == vb1 {
                shared = Some((i, j));
                break 'outer;
            }
        }
    }
    // No common edge, cannot merge.
    let (ea, eb) = shared?;

    // Check to see if the merged polygon would be convex.
    let vertex = |index: u16| vertices[index as usize];
    let va = pa[(ea + na - 1) % na];
    let vb = pa[ea];
    let vc = pb[(eb + 2) % nb];
    if !uleft(vertex(va), vertex(vb), vertex(vc)) {
        return None;
    }

    let va = pb[(eb + nb - 1) % nb];
    let vb = pb[eb];
    let vc = pa[(ea + 2) % na];
    if !uleft(vertex(va), vertex(vb), vertex(vc)) {
        return None;
    }

    let a = vertex(pa[ea]).as_ivec3();
    let b = vertex(pa[(ea + 1) % na]).as_ivec3();
    let dx = a.x - b.x;
    let dz = a.z - b.z;
    Some((dx * dx + dz * dz, ea, eb))
}

fn merge_poly_verts(pa: &[u16], pb: &[u16], ea: usize, eb: usize, nvp: usize) -> Vec<u16> {
    let na = count_poly_verts(pa);
    let nb = count_poly_verts(pb);
    let mut merged = Vec::with_capacity(nvp);
    // Add pa
    merged.extend((0..na - 1).map(|i| pa[(ea + 1 + i) % na]));
    // Add pb
    merged.extend((0..nb - 1).map(|i| pb[(eb + 1 + i) % nb]));
    merged.resize(nvp, NULL_INDEX);
    merged
}

/// Greedily merges the polygon pairs with the longest shared edge until no more merges are possible.
///
/// `on_merge(a, b)` is called after polygon `b` was merged into polygon `a` and swap-removed,
/// so that callers can keep parallel data in sync.
fn merge_polygons(
    polys: &mut Vec<Vec<u16>>,
    vertices: &[U16Vec3],
    nvp: usize,
    mut on_merge: impl FnMut(usize, usize),
) {
    loop {
        // Find best polygons to merge.
        let mut best_merge_value = 0;
        let mut best = None;
        for j in 0..polys.len().saturating_sub(1) {
            for k in j + 1..polys.len() {
                if let Some((value, ea, eb)) = get_poly_merge_value(&polys[j], &polys[k], vertices, nvp)
                    && value > best_merge_value
                {
                    best_merge_value = value;
                    best = Some((j, k, ea, eb));
                }
            }
        }
        let Some((pa, pb, ea, eb)) = best else {
            break;
        };
        // Found best, merge.
        polys[pa] = merge_poly_verts(&polys[pa], &polys[pb], ea, eb, nvp);
        polys.swap_remove(pb);
        on_merge(pa, pb);
    }
}

/// The last bit of an index is used to indicate if the vertex can be removed.
const CAN_REMOVE: u32 = 0x8000_0000;
const INDEX_MASK: u32 = 0x0fff_ffff;

/// Triangulates a simple polygon by ear clipping, always cutting the shortest diagonal first.
///
/// Returns `false` if the polygon could not be fully triangulated.
/// In that case `tris` contains the triangles found until the failure.
fn triangulate(vertices: &[IVec3], tris: &mut Vec<[usize; 3]>) -> bool {
    let mut n = vertices.len();
    let mut indices: Vec<u32> = (0..n as u32).collect();

    for i in 0..n {
        let i1 = next(i, n);
        let i2 = next(i1, n);
        if diagonal(i, i2, vertices, &indices[..n]) {
            indices[i1] |= CAN_REMOVE;
        }
    }

    let position = |index: u32| vertices[(index & INDEX_MASK) as usize];

    while n > 3 {
        let mut min_len = i32::MAX;
        let mut min_i = None;
        for i in 0..n {
            let i1 = next(i, n);
            if indices[i1] & CAN_REMOVE != 0 {
                let p0 = position(indices[i]);
                let p2 = position(indices[next(i1, n)]);
                let dx = p2.x - p0.x;
                let dz = p2.z - p0.z;
                let len = dx * dx + dz * dz;
                if len < min_len {
                    min_len = len;
                    min_i = Some(i);
                }
            }
        }

        if min_i.is_none() {
            // We might get here because the contour has overlapping segments, like this:
            //
            //  A o-o=====o---o B
            //   /  |C   D|    \.
            //  o   o     o     o
            //  :   :     :     :
            // We'll try to recover by loosing up the inCone test a bit so that a diagonal
            // like A-B or C-D can be found and we can continue.
            min_len = i32::MAX;
            for i in 0..n {
                let i1 = next(i, n);
                let i2 = next(i1, n);
                if diagonal_loose(i, i2, vertices, &indices[..n]) {
                    let p0 = position(indices[i]);
                    let p2 = position(indices[i2]);
                    let dx = p2.x - p0.x;
                    let dz = p2.z - p0.z;
                    let len = dx * dx + dz * dz;
                    if len < min_len {
                        min_len = len;
                        min_i = Some(i);
                    }
                }
            }
        }

        let Some(i) = min_i else {
            // The contour is messed up. This sometimes happens
            // if the contour simplification is too aggressive.
            return false;
        };
        let mut i1 = next(i, n);
        let i2 = next(i1, n);

        tris.push([
            (indices[i] & INDEX_MASK) as usize,
            (indices[i1] & INDEX_MASK) as usize,
            (indices[i2] & INDEX_MASK) as usize,
        ]);

        // Removes P[i1] by copying P[i+1]...P[n-1] left one index.
        indices.remove(i1);
        n -= 1;
        if i1 >= n {
            i1 = 0;
        }
        let i = prev(i1, n);
        // Update diagonal flags.
        if diagonal(prev(i, n), i1, vertices, &indices[..n]) {
            indices[i] |= CAN_REMOVE;
        } else {
            indices[i] &= INDEX_MASK;
        }
        if diagonal(i, next(i1, n), vertices, &indices[..n]) {
            indices[i1] |= CAN_REMOVE;
        } else {
            indices[i1] &= INDEX_MASK;
        }
    }

    // Append the remaining triangle.
    tris.push([
        (indices[0] & INDEX_MASK) as usize,
        (indices[1] & INDEX_MASK) as usize,
        (indices[2] & INDEX_MASK) as usize,
    ]);
    true
}

/// Returns true iff the diagonal (i,j) is strictly internal to the polygon in the neighborhood of the i endpoint.
fn in_cone(i: usize, j: usize, vertices: &[IVec3], indices: &[u32], loose: bool) -> bool {
    let n = indices.len();
    let position = |index: usize| vertices[(indices[index] & INDEX_MASK) as usize];
    let pi = position(i);
    let pj = position(j);
    let pi1 = position(next(i, n));
    let pin1 = position(prev(i, n));

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if left_on(pin1, pi, pi1) {
        return if loose {
            left_on(pi, pj, pin1) && left_on(pj, pi, pi1)
        } else {
            left(pi, pj, pin1) && left(pj, pi, pi1)
        };
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

/// Returns true iff (v_i, v_j) is a proper internal *or* external diagonal of P, *ignoring edges incident to v_i and v_j*.
fn diagonalie(i: usize, j: usize, vertices: &[IVec3], indices: &[u32], loose: bool) -> bool {
    let n = indices.len();
    let position = |index: usize| vertices[(indices[index] & INDEX_MASK) as usize];
    let d0 = position(i);
    let d1 = position(j);

    // For each edge (k,k+1) of P
    for k in 0..n {
        let k1 = next(k, n);
        // Skip edges incident to i or j
        if k == i || k1 == i || k == j || k1 == j {
            continue;
        }
        let p0 = position(k);
        let p1 = position(k1);

        if vequal_xz(d0, p0) || vequal_xz(d1, p0) || vequal_xz(d0, p1) || vequal_xz(d1, p1) {
            continue;
        }

        let intersects = if loose {
            intersect_prop(d0, d1, p0, p1)
        } else {
            intersect(d0, d1, p0, p1)
        };
        if intersects {
            return false;
        }
    }
    true
}

/// Returns true iff (v_i, v_j) is a proper internal diagonal of P.
fn diagonal(i: usize, j: usize, vertices: &[IVec3], indices: &[u32]) -> bool {
    in_cone(i, j, vertices, indices, false) && diagonalie(i, j, vertices, indices, false)
}

fn diagonal_loose(i: usize, j: usize, vertices: &[IVec3], indices: &[u32]) -> bool {
    in_cone(i, j, vertices, indices, true) && diagonalie(i, j, vertices, indices, true)
}

/// Errors that can occur while building a [`PolygonNavmesh`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolygonNavmeshError {
    /// The contours have more vertices than a polygon mesh can index.
    #[error("Too many vertices: {count} (max: {max})")]
    TooManyVertices {
        /// The number of contour vertices
        count: usize,
        /// The maximum number of vertices
        max: usize,
    },
    /// More polygons were created than the contours can produce.
    #[error("Too many polygons (max: {max})")]
    TooManyPolygons {
        /// The maximum number of polygons
        max: usize,
    },
    /// A polygon needs at least 3 vertices.
    #[error("A polygon needs at least 3 vertices, but the maximum was set to {0}")]
    TooFewVerticesPerPolygon(usize),
}

#[cfg(test)]
mod tests {
    use crate::{Contour, ContourVertex};

    use super::*;

    fn contour(points: &[(i32, i32)], region: u16) -> Contour {
        Contour {
            vertices: points
                .iter()
                .map(|(x, z)| ContourVertex {
                    position: IVec3::new(*x, 1, *z),
                    flags: RegionVertexId::NONE,
                })
                .collect(),
            raw_vertices: Vec::new(),
            region: RegionId::from(region),
            area: AreaType::DEFAULT_WALKABLE,
        }
    }

    fn contour_set(contours: Vec<Contour>) -> ContourSet {
        ContourSet {
            contours,
            aabb: Aabb3d::default(),
            cell_size: 1.0,
            cell_height: 1.0,
            width: 20,
            height: 20,
            border_size: 0,
            max_error: 1.3,
        }
    }

    #[test]
    fn triangulates_convex_polygon() {
        let vertices: Vec<_> = [(0, 0), (0, 4), (4, 4), (4, 0)]
            .into_iter()
            .map(|(x, z)| IVec3::new(x, 0, z))
            .collect();
        let mut tris = Vec::new();
        assert!(triangulate(&vertices, &mut tris));
        assert_eq!(tris.len(), 2);
    }

    #[test]
    fn triangulates_concave_polygon() {
        // An L-shape.
        let vertices: Vec<_> = [(0, 0), (0, 4), (2, 4), (2, 2), (4, 2), (4, 0)]
            .into_iter()
            .map(|(x, z)| IVec3::new(x, 0, z))
            .collect();
        let mut tris = Vec::new();
        assert!(triangulate(&vertices, &mut tris));
        assert_eq!(tris.len(), 4);
    }

    #[test]
    fn square_becomes_single_polygon() {
        let cset = contour_set(vec![contour(&[(0, 0), (0, 4), (4, 4), (4, 0)], 1)]);
        let mesh = cset.build_polygon_mesh(6).unwrap();
        assert_eq!(mesh.polygon_count(), 1);
        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.polygon_vertices(0).count(), 4);
        assert!(mesh.neighbors(0).iter().all(|n| *n == NULL_INDEX));
        assert_eq!(mesh.flags, vec![1]);
        assert_eq!(mesh.regions, vec![RegionId::from(1)]);
    }

    #[test]
    fn triangles_only_mesh_keeps_triangles() {
        let cset = contour_set(vec![contour(&[(0, 0), (0, 4), (4, 4), (4, 0)], 1)]);
        let mesh = cset.build_polygon_mesh(3).unwrap();
        assert_eq!(mesh.polygon_count(), 2);
        // The two triangles share the diagonal.
        let connected = (0..2).all(|i| mesh.neighbors(i).iter().any(|n| *n != NULL_INDEX));
        assert!(connected);
    }

    #[test]
    fn adjacent_regions_are_connected() {
        let cset = contour_set(vec![
            contour(&[(0, 0), (0, 4), (4, 4), (4, 0)], 1),
            contour(&[(4, 0), (4, 4), (8, 4), (8, 0)], 2),
        ]);
        let mesh = cset.build_polygon_mesh(6).unwrap();
        assert_eq!(mesh.polygon_count(), 2);
        // Shared vertices are welded.
        assert_eq!(mesh.vertices.len(), 6);
        assert!(mesh.neighbors(0).contains(&1));
        assert!(mesh.neighbors(1).contains(&0));
    }

    #[test]
    fn merged_polygons_are_convex() {
        let cset = contour_set(vec![contour(
            &[(0, 0), (0, 6), (3, 6), (3, 3), (6, 3), (6, 0)],
            1,
        )]);
        let mesh = cset.build_polygon_mesh(6).unwrap();
        assert!(mesh.polygon_count() >= 2);
        for i in 0..mesh.polygon_count() {
            let polygon: Vec<_> = mesh
                .polygon_vertices(i)
                .map(|v| mesh.vertices[v as usize].as_ivec3())
                .collect();
            let n = polygon.len();
            for j in 0..n {
                assert!(left_on(polygon[j], polygon[(j + 1) % n], polygon[(j + 2) % n]));
            }
        }
    }

    #[test]
    fn too_few_vertices_per_polygon_is_an_error() {
        let cset = contour_set(Vec::new());
        assert_eq!(
            cset.build_polygon_mesh(2),
            Err(PolygonNavmeshError::TooFewVerticesPerPolygon(2))
        );
    }

    #[test]
    fn border_portals_are_marked() {
        let mut cset = contour_set(vec![contour(&[(0, 0), (0, 20), (20, 20), (20, 0)], 1)]);
        cset.border_size = 2;
        let mesh = cset.build_polygon_mesh(6).unwrap();
        let portals: Vec<_> = mesh
            .neighbors(0)
            .iter()
            .filter(|n| **n != NULL_INDEX)
            .map(|n| n & !PolygonNavmesh::PORTAL_FLAG)
            .collect();
        assert_eq!(portals.len(), 4);
        for dir in 0..4 {
            assert!(portals.contains(&dir));
        }
    }
}
