//! Height detail for the polygons of a [`PolygonNavmesh`].

use std::collections::VecDeque;

use glam::{U16Vec3, Vec3, Vec3A, Vec3Swizzles as _};
use thiserror::Error;

use crate::{
    CompactHeightfield, RegionId,
    math::{
        dir_offset, dir_offset_x, dir_offset_z, distance_squared_between_point_and_line_vec2,
        distance_squared_between_point_and_line_vec3, next, prev,
    },
    poly_mesh::PolygonNavmesh,
};

/// The maximum number of vertices of a single detail sub-mesh.
pub const MAX_DETAIL_VERTICES: usize = 127;
/// The maximum number of triangles of a single detail sub-mesh.
/// Delaunay triangulation produces at most `2n-2-k` triangles (n=num verts, k=num hull verts).
pub const MAX_DETAIL_TRIANGLES: usize = 255;
const MAX_VERTICES_PER_EDGE: usize = 32;
const UNSET_HEIGHT: u16 = 0xffff;

/// Contains triangle meshes that represent detailed height data associated
/// with the polygons in its associated polygon mesh object.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct DetailNavmesh {
    /// The sub-mesh data, one per polygon of the source polygon mesh.
    pub meshes: Vec<SubMesh>,
    /// The mesh vertices in world space.
    pub vertices: Vec<Vec3>,
    /// The mesh triangles. The indices are relative to the [`SubMesh::base_vertex_index`] of their sub-mesh.
    pub triangles: Vec<[u8; 3]>,
    /// Per triangle, 2 bits per edge marking whether the edge lies on the hull of the polygon.
    /// Edge `ab` uses bit 0, edge `bc` bit 2, and edge `ca` bit 4.
    pub triangle_flags: Vec<u8>,
}

/// The range of vertices and triangles of a [`DetailNavmesh`] belonging to one polygon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct SubMesh {
    /// The index of the first vertex of the sub-mesh
    pub base_vertex_index: u32,
    /// The number of vertices in the sub-mesh
    pub vertex_count: u32,
    /// The index of the first triangle of the sub-mesh
    pub base_triangle_index: u32,
    /// The number of triangles in the sub-mesh
    pub triangle_count: u32,
}

impl DetailNavmesh {
    /// Marks a triangle edge as lying on the boundary of its polygon.
    pub const EDGE_BOUNDARY: u8 = 0x1;

    /// Builds a detail mesh from the provided polygon mesh.
    ///
    /// - `sample_distance`: Sets the distance to use when sampling the heightfield. [Limits: >=0] [Units: wu]
    /// - `sample_max_error`: The maximum distance the detail mesh surface should deviate from heightfield data. [Limits: >=0] [Units: wu]
    pub fn new(
        mesh: &PolygonNavmesh,
        heightfield: &CompactHeightfield,
        sample_distance: f32,
        sample_max_error: f32,
    ) -> Result<Self, DetailNavmeshError> {
        let _span = tracing::trace_span!("build_detail_mesh").entered();
        let mut dmesh = DetailNavmesh::default();
        if mesh.vertices.is_empty() || mesh.polygon_count() == 0 {
            return Ok(dmesh);
        }
        let chf = heightfield;
        let cs = mesh.cell_size;
        let ch = mesh.cell_height;
        let orig = Vec3A::from(mesh.aabb.min);
        let height_search_radius = 1.max(mesh.max_edge_error.ceil() as u32);

        let mut bounds = Vec::with_capacity(mesh.polygon_count());
        let mut max_patch_width = 0;
        let mut max_patch_height = 0;
        let mut poly_vertex_count = 0;

        // Find max size for a polygon area.
        for i in 0..mesh.polygon_count() {
            let mut b = Bounds {
                xmin: chf.width,
                xmax: 0,
                zmin: chf.height,
                zmax: 0,
            };
            for vertex in mesh.polygon_vertices(i) {
                let v = mesh.vertices[vertex as usize];
                b.xmin = b.xmin.min(v.x);
                b.xmax = b.xmax.max(v.x);
                b.zmin = b.zmin.min(v.z);
                b.zmax = b.zmax.max(v.z);
                poly_vertex_count += 1;
            }
            b.xmin = b.xmin.saturating_sub(1);
            b.xmax = chf.width.min(b.xmax + 1);
            b.zmin = b.zmin.saturating_sub(1);
            b.zmax = chf.height.min(b.zmax + 1);
            if b.xmin < b.xmax && b.zmin < b.zmax {
                max_patch_width = max_patch_width.max(b.width());
                max_patch_height = max_patch_height.max(b.height());
            }
            bounds.push(b);
        }

        let mut patch = HeightPatch {
            data: vec![UNSET_HEIGHT; max_patch_width as usize * max_patch_height as usize],
            ..Default::default()
        };
        let mut scratch = DetailScratch::default();
        let mut poly = Vec::with_capacity(mesh.max_vertices_per_polygon);
        let mut queue = VecDeque::new();

        dmesh.meshes = Vec::with_capacity(mesh.polygon_count());
        dmesh.vertices = Vec::with_capacity(poly_vertex_count + poly_vertex_count / 2);
        dmesh.triangles = Vec::with_capacity(poly_vertex_count * 2);
        dmesh.triangle_flags = Vec::with_capacity(poly_vertex_count * 2);

        for (i, b) in bounds.iter().enumerate() {
            // Store polygon vertices for processing.
            let indices: Vec<u16> = mesh.polygon_vertices(i).collect();
            poly.clear();
            poly.extend(indices.iter().map(|index| {
                let v = mesh.vertices[*index as usize].as_vec3();
                Vec3A::new(v.x * cs, v.y * ch, v.z * cs)
            }));

            // Get the height data from the area of the polygon.
            patch.xmin = b.xmin;
            patch.zmin = b.zmin;
            patch.width = b.width();
            patch.height = b.height();
            patch
                .fill_from(
                    chf,
                    &indices,
                    &mesh.vertices,
                    mesh.border_size,
                    &mut queue,
                    mesh.regions[i],
                )
                .ok_or(DetailNavmeshError::NoSeedSpan { polygon: i })?;

            // Build detail mesh.
            scratch.build_polygon_detail(
                &poly,
                sample_distance,
                sample_max_error,
                height_search_radius,
                chf,
                &patch,
            )?;

            // Store detail submesh
            dmesh.meshes.push(SubMesh {
                base_vertex_index: dmesh.vertices.len() as u32,
                vertex_count: scratch.vertices.len() as u32,
                base_triangle_index: dmesh.triangles.len() as u32,
                triangle_count: scratch.triangles.len() as u32,
            });

            // Move detail verts to world space.
            dmesh.vertices.extend(scratch.vertices.iter().map(|vertex| {
                let mut vertex = *vertex + orig;
                // Lift the surface by one voxel so it sits on top of the spans.
                vertex.y += chf.cell_height;
                Vec3::from(vertex)
            }));
            for triangle in &scratch.triangles {
                dmesh.triangles.push([
                    triangle.vertices.x as u8,
                    triangle.vertices.y as u8,
                    triangle.vertices.z as u8,
                ]);
                dmesh.triangle_flags.push(triangle.flags);
            }
        }

        tracing::debug!(
            vertices = dmesh.vertices.len(),
            triangles = dmesh.triangles.len(),
            "built detail mesh"
        );
        Ok(dmesh)
    }

    /// Iterates over the world space triangles of the sub-mesh of polygon `polygon`.
    pub fn sub_mesh_triangles(&self, polygon: usize) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        let sub_mesh = self.meshes[polygon];
        let base = sub_mesh.base_vertex_index as usize;
        let start = sub_mesh.base_triangle_index as usize;
        let end = start + sub_mesh.triangle_count as usize;
        self.triangles[start..end]
            .iter()
            .map(move |triangle| triangle.map(|index| self.vertices[base + index as usize]))
    }
}

#[derive(Debug, Clone, Copy)]
struct DetailTriangle {
    vertices: U16Vec3,
    flags: u8,
}

/// The face on one side of a Delaunay edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Face {
    Undefined,
    Hull,
    Triangle(usize),
}

#[derive(Debug, Clone, Copy)]
struct DelaunayEdge {
    s: usize,
    t: usize,
    left: Face,
    right: Face,
}

impl DelaunayEdge {
    fn update_left_face(&mut self, s: usize, t: usize, face: Face) {
        if self.s == s && self.t == t && self.left == Face::Undefined {
            self.left = face;
        } else if self.t == s && self.s == t && self.right == Face::Undefined {
            self.right = face;
        }
    }
}

/// Buffers reused between the polygons of a detail mesh build.
#[derive(Debug, Default)]
struct DetailScratch {
    vertices: Vec<Vec3A>,
    triangles: Vec<DetailTriangle>,
    edges: Vec<DelaunayEdge>,
    hull: Vec<usize>,
    /// Grid position and height of interior samples, and whether they were added yet.
    samples: Vec<(i32, u16, i32, bool)>,
}

impl DetailScratch {
    fn build_polygon_detail(
        &mut self,
        input: &[Vec3A],
        sample_dist: f32,
        sample_max_error: f32,
        height_search_radius: u32,
        chf: &CompactHeightfield,
        patch: &HeightPatch,
    ) -> Result<(), DetailNavmeshError> {
        let nin = input.len();
        let mut edge = [Vec3A::ZERO; MAX_VERTICES_PER_EDGE + 1];

        self.vertices.clear();
        self.vertices.extend_from_slice(input);
        self.edges.clear();
        self.triangles.clear();
        self.hull.clear();

        let cs = chf.cell_size;
        let ics = 1.0 / cs;
        let ch = chf.cell_height;

        // Calculate minimum extents of the polygon based on input data.
        let min_extent_squared = poly_min_extent_squared(&self.vertices);

        // Tessellate outlines.
        // This is done in separate pass in order to ensure
        // seamless height values across the poly boundaries.
        if sample_dist > 0.0 {
            let mut j = nin - 1;
            for i in 0..nin {
                let mut vj = input[j];
                let mut vi = input[i];
                let mut swapped = false;
                // Make sure the segments are always handled in same order
                // using lexological sort or else there will be seams.
                if (vj.x - vi.x).abs() < 1.0e-6 {
                    if vj.z > vi.z {
                        std::mem::swap(&mut vj, &mut vi);
                        swapped = true;
                    }
                } else if vj.x > vi.x {
                    std::mem::swap(&mut vj, &mut vi);
                    swapped = true;
                }
                // Create samples along the edge.
                let dij = vi - vj;
                let d = dij.xz().length();
                let mut nn = 1 + (d / sample_dist).floor() as usize;
                if nn >= MAX_VERTICES_PER_EDGE {
                    nn = MAX_VERTICES_PER_EDGE - 1;
                }
                if self.vertices.len() + nn >= MAX_DETAIL_VERTICES {
                    nn = (MAX_DETAIL_VERTICES - 1)
                        .saturating_sub(self.vertices.len())
                        .max(1);
                }

                for (k, pos) in edge.iter_mut().enumerate().take(nn + 1) {
                    let u = k as f32 / nn as f32;
                    *pos = vj + dij * u;
                    pos.y = patch.height_at(*pos, ics, ch, height_search_radius) as f32 * ch;
                }
                // Simplify samples.
                let mut idx = [0; MAX_VERTICES_PER_EDGE];
                idx[1] = nn;
                let mut nidx = 2;
                let mut k = 0;
                while k < nidx - 1 {
                    let a = idx[k];
                    let b = idx[k + 1];
                    let va = edge[a];
                    let vb = edge[b];
                    // Find maximum deviation along the segment.
                    let mut maxd = 0.0;
                    let mut maxi = None;
                    for (m, point) in edge.iter().enumerate().take(b).skip(a + 1) {
                        let dev = distance_squared_between_point_and_line_vec3(*point, (va, vb));
                        if dev > maxd {
                            maxd = dev;
                            maxi = Some(m);
                        }
                    }
                    // If the max deviation is larger than accepted error,
                    // add new point, else continue to next segment.
                    match maxi {
                        Some(maxi) if maxd > sample_max_error * sample_max_error => {
                            idx.copy_within(k + 1..nidx, k + 2);
                            idx[k + 1] = maxi;
                            nidx += 1;
                        }
                        _ => k += 1,
                    }
                }

                self.hull.push(j);
                // Add new vertices.
                let new_vertices = &idx[1..nidx - 1];
                if swapped {
                    for index in new_vertices.iter().rev() {
                        self.hull.push(self.vertices.len());
                        self.vertices.push(edge[*index]);
                    }
                } else {
                    for index in new_vertices {
                        self.hull.push(self.vertices.len());
                        self.vertices.push(edge[*index]);
                    }
                }
                j = i;
            }
        } else {
            self.hull.extend(0..nin);
        }

        // If the polygon minimum extent is small (sliver or small triangle), do not try to add internal points.
        if min_extent_squared < (sample_dist * 2.0) * (sample_dist * 2.0) {
            self.triangulate_hull(nin);
            self.set_triangle_flags();
            return Ok(());
        }

        // Tessellate the base mesh.
        // We're using the hull triangulation instead of the Delaunay one as it tends to
        // create a bit better triangulation for long thin triangles when there
        // are no internal points.
        self.triangulate_hull(nin);

        if self.triangles.is_empty() {
            // Could not triangulate the poly, make sure there is some valid data there.
            tracing::warn!(
                vertices = self.vertices.len(),
                "Could not triangulate polygon for the detail mesh"
            );
            return Ok(());
        }

        if sample_dist > 0.0 {
            // Create sample locations in a grid.
            let (min, max) = input
                .iter()
                .fold((input[0], input[0]), |(min, max), v| (min.min(*v), max.max(*v)));
            let x0 = (min.x / sample_dist).floor() as i32;
            let x1 = (max.x / sample_dist).ceil() as i32;
            let z0 = (min.z / sample_dist).floor() as i32;
            let z1 = (max.z / sample_dist).ceil() as i32;
            self.samples.clear();
            for z in z0..z1 {
                for x in x0..x1 {
                    let pt = Vec3A::new(
                        x as f32 * sample_dist,
                        (max.y + min.y) * 0.5,
                        z as f32 * sample_dist,
                    );
                    // Make sure the samples are not too close to the edges.
                    if dist_to_poly(input, pt) > -sample_dist / 2.0 {
                        continue;
                    }
                    let y = patch.height_at(pt, ics, ch, height_search_radius);
                    self.samples.push((x, y, z, false));
                }
            }

            // Add the samples starting from the one that has the most
            // error. The procedure stops when all samples are added
            // or when the max error is within treshold.
            for _ in 0..self.samples.len() {
                if self.vertices.len() >= MAX_DETAIL_VERTICES {
                    break;
                }

                // Find sample with most error.
                let mut best_point = Vec3A::ZERO;
                let mut best_distance = 0.0;
                let mut best_index = None;
                for (i, (x, y, z, added)) in self.samples.iter().enumerate() {
                    if *added {
                        continue;
                    }
                    // The sample location is jittered to get rid of some bad triangulations
                    // which are caused by symmetrical data from the grid structure.
                    let pt = Vec3A::new(
                        *x as f32 * sample_dist + jitter_x(i) * cs * 0.1,
                        *y as f32 * ch,
                        *z as f32 * sample_dist + jitter_z(i) * cs * 0.1,
                    );
                    let Some(d) = dist_to_tri_mesh(pt, &self.vertices, &self.triangles) else {
                        // did not hit the mesh.
                        continue;
                    };
                    if d > best_distance {
                        best_distance = d;
                        best_index = Some(i);
                        best_point = pt;
                    }
                }
                // If the max error is within accepted threshold, stop tessellating.
                let Some(best_index) = best_index.filter(|_| best_distance > sample_max_error)
                else {
                    break;
                };
                // Mark sample as added.
                self.samples[best_index].3 = true;
                // Add the new sample point.
                self.vertices.push(best_point);

                // Create new triangulation.
                // TODO: Insert the point incrementally instead of rebuilding the whole triangulation.
                self.delaunay_hull()?;
            }
        }

        if self.triangles.len() > MAX_DETAIL_TRIANGLES {
            return Err(DetailNavmeshError::TooManyTriangles {
                count: self.triangles.len(),
                max: MAX_DETAIL_TRIANGLES,
            });
        }
        self.set_triangle_flags();
        Ok(())
    }

    /// Triangulates the hull, starting from the ear with the shortest perimeter
    /// and then advancing along whichever side yields the shorter next triangle.
    fn triangulate_hull(&mut self, nin: usize) {
        let hull = &self.hull;
        let nhull = hull.len();
        let vertex = |i: usize| self.vertices[hull[i]].xz();
        let mut start = 0;
        let mut left = 1;
        let mut right = nhull - 1;

        // Start from an ear with shortest perimeter.
        // This tends to favor well formed triangles as starting point.
        let mut dmin = f32::MAX;
        for i in 0..nhull {
            if hull[i] >= nin {
                // Ears are triangles with original vertices as middle vertex while others are actually line segments on edges
                continue;
            }
            let pi = prev(i, nhull);
            let ni = next(i, nhull);
            let pv = vertex(pi);
            let cv = vertex(i);
            let nv = vertex(ni);
            let d = pv.distance(cv) + cv.distance(nv) + nv.distance(pv);
            if d < dmin {
                start = i;
                left = ni;
                right = pi;
                dmin = d;
            }
        }

        let triangle = |a: usize, b: usize, c: usize| DetailTriangle {
            vertices: U16Vec3::new(hull[a] as u16, hull[b] as u16, hull[c] as u16),
            flags: 0,
        };

        // Add first triangle
        self.triangles.push(triangle(start, left, right));

        // Triangulate the polygon by moving left or right,
        // depending on which triangle has shorter perimeter.
        // This heuristic was chose empirically, since it seems
        // handle tessellated straight edges well.
        while next(left, nhull) != right {
            // Check to see if se should advance left or right.
            let nleft = next(left, nhull);
            let nright = prev(right, nhull);

            let cvleft = vertex(left);
            let nvleft = vertex(nleft);
            let cvright = vertex(right);
            let nvright = vertex(nright);
            let dleft = cvleft.distance(nvleft) + nvleft.distance(cvright);
            let dright = cvright.distance(nvright) + cvleft.distance(nvright);
            if dleft < dright {
                self.triangles.push(triangle(left, nleft, right));
                left = nleft;
            } else {
                self.triangles.push(triangle(left, nright, right));
                right = nright;
            }
        }
    }

    /// Rebuilds the triangulation of all vertices as a Delaunay triangulation constrained by the hull.
    fn delaunay_hull(&mut self) -> Result<(), DetailNavmeshError> {
        self.edges.clear();
        self.triangles.clear();
        let max_edges = self.vertices.len() * 10;
        let mut face_count = 0;

        let nhull = self.hull.len();
        let mut j = nhull - 1;
        for i in 0..nhull {
            let (s, t) = (self.hull[j], self.hull[i]);
            add_edge(&mut self.edges, max_edges, s, t, Face::Hull, Face::Undefined)?;
            j = i;
        }

        let mut current_edge = 0;
        while current_edge < self.edges.len() {
            if self.edges[current_edge].left == Face::Undefined {
                complete_facet(
                    &self.vertices,
                    &mut self.edges,
                    max_edges,
                    &mut face_count,
                    current_edge,
                )?;
            }
            if self.edges[current_edge].right == Face::Undefined {
                complete_facet(
                    &self.vertices,
                    &mut self.edges,
                    max_edges,
                    &mut face_count,
                    current_edge,
                )?;
            }
            current_edge += 1;
        }

        // Create tris
        let mut faces: Vec<[Option<usize>; 3]> = vec![[None; 3]; face_count];
        for edge in &self.edges {
            if let Face::Triangle(face) = edge.right {
                let t = &mut faces[face];
                if t[0].is_none() {
                    t[0] = Some(edge.s);
                    t[1] = Some(edge.t);
                } else if t[0] == Some(edge.t) {
                    t[2] = Some(edge.s);
                } else if t[1] == Some(edge.s) {
                    t[2] = Some(edge.t);
                }
            }
            if let Face::Triangle(face) = edge.left {
                let t = &mut faces[face];
                if t[0].is_none() {
                    t[0] = Some(edge.t);
                    t[1] = Some(edge.s);
                } else if t[0] == Some(edge.s) {
                    t[2] = Some(edge.t);
                } else if t[1] == Some(edge.t) {
                    t[2] = Some(edge.s);
                }
            }
        }

        for face in faces {
            if let [Some(a), Some(b), Some(c)] = face {
                self.triangles.push(DetailTriangle {
                    vertices: U16Vec3::new(a as u16, b as u16, c as u16),
                    flags: 0,
                });
            } else {
                tracing::warn!(?face, "Removing dangling face from the detail triangulation");
            }
        }
        Ok(())
    }

    /// Find edges that lie on hull and mark them as such.
    fn set_triangle_flags(&mut self) {
        let hull = &self.hull;
        let boundary = |a: u16, b: u16| {
            if on_hull(a as usize, b as usize, hull) {
                DetailNavmesh::EDGE_BOUNDARY
            } else {
                0
            }
        };
        for triangle in &mut self.triangles {
            let U16Vec3 { x: a, y: b, z: c } = triangle.vertices;
            triangle.flags = boundary(a, b) | boundary(b, c) << 2 | boundary(c, a) << 4;
        }
    }
}

fn on_hull(a: usize, b: usize, hull: &[usize]) -> bool {
    let nhull = hull.len();
    // All internal sampled points come after the hull so we can early out for those.
    if a >= nhull || b >= nhull {
        return false;
    }
    let mut j = nhull - 1;
    for i in 0..nhull {
        if a == hull[j] && b == hull[i] {
            return true;
        }
        j = i;
    }
    false
}

fn find_edge(edges: &[DelaunayEdge], s: usize, t: usize) -> Option<usize> {
    edges
        .iter()
        .position(|e| (e.s == s && e.t == t) || (e.s == t && e.t == s))
}

/// Adds the edge `s-t` unless it already exists.
fn add_edge(
    edges: &mut Vec<DelaunayEdge>,
    max_edges: usize,
    s: usize,
    t: usize,
    left: Face,
    right: Face,
) -> Result<(), DetailNavmeshError> {
    if edges.len() >= max_edges {
        return Err(DetailNavmeshError::TooManyEdges { max: max_edges });
    }
    if find_edge(edges, s, t).is_none() {
        edges.push(DelaunayEdge { s, t, left, right });
    }
    Ok(())
}

/// Finds the point that forms a Delaunay triangle with the open side of edge `e`.
fn complete_facet(
    points: &[Vec3A],
    edges: &mut Vec<DelaunayEdge>,
    max_edges: usize,
    face_count: &mut usize,
    e: usize,
) -> Result<(), DetailNavmeshError> {
    const EPS: f32 = 1e-5;

    let edge = edges[e];
    // Cache s and t.
    let (s, t) = if edge.left == Face::Undefined {
        (edge.s, edge.t)
    } else if edge.right == Face::Undefined {
        (edge.t, edge.s)
    } else {
        // Edge already completed.
        return Ok(());
    };

    // Find best point on left of edge.
    let mut best = None;
    let mut center = Vec3A::ZERO;
    let mut radius = -1.0;
    for u in 0..points.len() {
        if u == s || u == t {
            continue;
        }
        if cross2(points[s], points[t], points[u]) <= EPS {
            continue;
        }
        if radius < 0.0 {
            // The circle is not updated yet, do it now.
            best = Some(u);
            (center, radius) = circum_circle(points[s], points[t], points[u]);
            continue;
        }
        let d = center.xz().distance(points[u].xz());
        const TOLERANCE: f32 = 0.001;
        if d > radius * (1.0 + TOLERANCE) {
            // Outside current circumcircle, skip.
            continue;
        } else if d >= radius * (1.0 - TOLERANCE) {
            // Inside epsilon circumcircle, do extra tests to make sure the edge is valid.
            // s-u and t-u cannot overlap with s-pt nor t-pt if they exists.
            if overlap_edges(points, edges, s, u) || overlap_edges(points, edges, t, u) {
                continue;
            }
        }
        // Edge is valid.
        best = Some(u);
        (center, radius) = circum_circle(points[s], points[t], points[u]);
    }

    // Add new triangle or update edge info if s-t is on hull.
    let Some(pt) = best else {
        edges[e].update_left_face(s, t, Face::Hull);
        return Ok(());
    };
    let face = Face::Triangle(*face_count);
    // Update face information of edge being completed.
    edges[e].update_left_face(s, t, face);

    // Add new edge or update face info of old edge.
    match find_edge(edges, pt, s) {
        Some(index) => edges[index].update_left_face(pt, s, face),
        None => add_edge(edges, max_edges, pt, s, face, Face::Undefined)?,
    }
    // Add new edge or update face info of old edge.
    match find_edge(edges, t, pt) {
        Some(index) => edges[index].update_left_face(t, pt, face),
        None => add_edge(edges, max_edges, t, pt, face, Face::Undefined)?,
    }
    *face_count += 1;
    Ok(())
}

fn overlap_edges(points: &[Vec3A], edges: &[DelaunayEdge], s1: usize, t1: usize) -> bool {
    edges.iter().any(|edge| {
        let (s0, t0) = (edge.s, edge.t);
        // Same or connected edges do not overlap.
        if s0 == s1 || s0 == t1 || t0 == s1 || t0 == t1 {
            return false;
        }
        overlap_seg_seg_2d(points[s0], points[t0], points[s1], points[t1])
    })
}

fn overlap_seg_seg_2d(a: Vec3A, b: Vec3A, c: Vec3A, d: Vec3A) -> bool {
    let a1 = cross2(a, b, d);
    let a2 = cross2(a, b, c);
    if a1 * a2 < 0.0 {
        let a3 = cross2(c, d, a);
        let a4 = a3 + a2 - a1;
        if a3 * a4 < 0.0 {
            return true;
        }
    }
    false
}

/// The z-component of the 2D cross product of `p2 - p1` and `p3 - p1` on the xz-plane.
#[inline]
fn cross2(p1: Vec3A, p2: Vec3A, p3: Vec3A) -> f32 {
    let u1 = p2.x - p1.x;
    let v1 = p2.z - p1.z;
    let u2 = p3.x - p1.x;
    let v2 = p3.z - p1.z;
    u1 * v2 - v1 * u2
}

/// Returns the center and radius of the circle through the three points on the xz-plane.
/// Degenerate triangles yield a circle of radius 0 around `p1`.
fn circum_circle(p1: Vec3A, p2: Vec3A, p3: Vec3A) -> (Vec3A, f32) {
    const EPS: f32 = 1e-6;
    // Calculate the circle relative to p1, to avoid some precision issues.
    let v1 = Vec3A::ZERO;
    let v2 = p2 - p1;
    let v3 = p3 - p1;

    let cp = cross2(v1, v2, v3);
    if cp.abs() <= EPS {
        return (p1, 0.0);
    }
    let v1_sq = v1.xz().length_squared();
    let v2_sq = v2.xz().length_squared();
    let v3_sq = v3.xz().length_squared();
    let center = Vec3A::new(
        (v1_sq * (v2.z - v3.z) + v2_sq * (v3.z - v1.z) + v3_sq * (v1.z - v2.z)) / (2.0 * cp),
        0.0,
        (v1_sq * (v3.x - v2.x) + v2_sq * (v1.x - v3.x) + v3_sq * (v2.x - v1.x)) / (2.0 * cp),
    );
    let radius = center.xz().distance(v1.xz());
    (center + p1, radius)
}

fn dist_to_tri_mesh(p: Vec3A, vertices: &[Vec3A], triangles: &[DetailTriangle]) -> Option<f32> {
    triangles
        .iter()
        .filter_map(|triangle| {
            let U16Vec3 { x, y, z } = triangle.vertices;
            dist_pt_tri(
                p,
                vertices[x as usize],
                vertices[y as usize],
                vertices[z as usize],
            )
        })
        .reduce(f32::min)
}

/// Vertical distance from point p to triangle defined by vertices a, b, and c.
/// Returns `None` if the point is outside the triangle on the xz-plane.
fn dist_pt_tri(p: Vec3A, a: Vec3A, b: Vec3A, c: Vec3A) -> Option<f32> {
    let v0 = c - a;
    let v1 = b - a;
    let v2 = p - a;

    let dot00 = v0.xz().dot(v0.xz());
    let dot01 = v0.xz().dot(v1.xz());
    let dot02 = v0.xz().dot(v2.xz());
    let dot11 = v1.xz().dot(v1.xz());
    let dot12 = v1.xz().dot(v2.xz());

    // Compute barycentric coordinates
    let inv_denom = 1.0 / (dot00 * dot11 - dot01 * dot01);
    let u = (dot11 * dot02 - dot01 * dot12) * inv_denom;
    let v = (dot00 * dot12 - dot01 * dot02) * inv_denom;

    // If point lies inside the triangle, return interpolated y-coord.
    const EPS: f32 = 1.0e-4;
    if u >= -EPS && v >= -EPS && (u + v) <= 1.0 + EPS {
        let y = a.y + v0.y * u + v1.y * v;
        Some((y - p.y).abs())
    } else {
        None
    }
}

fn jitter_x(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0x8da6b343) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

fn jitter_z(i: usize) -> f32 {
    ((i as u32).wrapping_mul(0xd8163841) & 0xffff) as f32 / 65535.0 * 2.0 - 1.0
}

/// Squared distance to the polygon outline on the xz-plane, negative when `p` is inside.
fn dist_to_poly(vertices: &[Vec3A], p: Vec3A) -> f32 {
    let mut dmin = f32::MAX;
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let vi = vertices[i];
        let vj = vertices[j];
        if (vi.z > p.z) != (vj.z > p.z) && p.x < (vj.x - vi.x) * (p.z - vi.z) / (vj.z - vi.z) + vi.x
        {
            inside = !inside;
        }
        dmin = dmin.min(distance_squared_between_point_and_line_vec2(
            p.xz(),
            (vj.xz(), vi.xz()),
        ));
        j = i;
    }
    if inside { -dmin } else { dmin }
}

/// Squared minimum extent of the polygon: the smallest of the largest vertex distances to each edge.
fn poly_min_extent_squared(vertices: &[Vec3A]) -> f32 {
    let n = vertices.len();
    let mut min_dist = f32::MAX;
    for i in 0..n {
        let ni = next(i, n);
        let p1 = vertices[i].xz();
        let p2 = vertices[ni].xz();
        let max_edge_dist = vertices
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i && *j != ni)
            .map(|(_, v)| distance_squared_between_point_and_line_vec2(v.xz(), (p1, p2)))
            .fold(0.0_f32, f32::max);
        min_dist = min_dist.min(max_edge_dist);
    }
    min_dist
}

/// Errors that can occur while building a [`DetailNavmesh`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetailNavmeshError {
    /// The Delaunay triangulation of a polygon ran out of edges.
    #[error("Too many edges in the detail triangulation (max: {max})")]
    TooManyEdges {
        /// The maximum number of edges
        max: usize,
    },
    /// A polygon produced more triangles than a sub-mesh can hold.
    #[error("Too many detail triangles: {count} (max: {max})")]
    TooManyTriangles {
        /// The number of triangles
        count: usize,
        /// The maximum number of triangles
        max: usize,
    },
    /// No span of the heightfield lies under the polygon, so there is no height data to sample.
    #[error("Found no span under polygon {polygon} to sample heights from")]
    NoSeedSpan {
        /// The index of the polygon
        polygon: usize,
    },
}

/// A window of heights of the compact heightfield around a polygon.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct HeightPatch {
    data: Vec<u16>,
    xmin: u16,
    zmin: u16,
    width: u16,
    height: u16,
}

impl HeightPatch {
    /// Fills the patch with the heights of the spans under the polygon.
    ///
    /// Returns `None` if no span to start from was found.
    fn fill_from(
        &mut self,
        chf: &CompactHeightfield,
        poly: &[u16],
        vertices: &[U16Vec3],
        bs: u16,
        queue: &mut VecDeque<(i32, i32, usize)>,
        region: RegionId,
    ) -> Option<()> {
        // Note: Reads to the compact heightfield are offset by border size (bs)
        // since border size offset is already removed from the polymesh vertices.
        queue.clear();
        self.fill(UNSET_HEIGHT);

        let mut empty = true;

        // We cannot sample from this poly if it was created from polys
        // of different regions. If it was then it could potentially be overlapping
        // with polys of that region and the heights sampled here could be wrong.
        if region != RegionId::NONE {
            // Copy the height from the same region, and mark region borders
            // as seed points to fill the rest.
            for hz in 0..self.height {
                let z = self.zmin + hz + bs;
                for hx in 0..self.width {
                    let x = self.xmin + hx + bs;
                    let Some(cell) = chf.get_cell_at(x, z) else {
                        continue;
                    };
                    for i in cell.index_range() {
                        let span = &chf.spans[i];
                        if span.region != region {
                            continue;
                        }
                        // Store height
                        *self.data_at_mut(hx as i32, hz as i32) = span.y;
                        empty = false;

                        // If any of the neighbours is not in same region,
                        // add the current location as flood fill start
                        let border = (0..4).any(|dir| {
                            chf.neighbor(x as i32, z as i32, i, dir)
                                .is_some_and(|(_, _, a_index)| chf.spans[a_index].region != region)
                        });
                        if border {
                            queue.push_back((x as i32, z as i32, i));
                        }
                        break;
                    }
                }
            }
        }

        // if the polygon does not contain any points from the current region (rare, but happens)
        // or if it could potentially be overlapping polygons of the same region,
        // then use the center as the seed point.
        if empty {
            self.seed_with_poly_center(chf, poly, vertices, bs, queue)?;
        }

        // We assume the seed is centered in the polygon, so a BFS to collect
        // height data will ensure we do not move onto overlapping polygons and
        // sample wrong heights.
        while let Some((cx, cz, ci)) = queue.pop_front() {
            for dir in 0..4 {
                let Some((ax, az, ai)) = chf.neighbor(cx, cz, ci, dir) else {
                    continue;
                };
                let hx = ax - self.xmin as i32 - bs as i32;
                let hz = az - self.zmin as i32 - bs as i32;
                if !self.contains(hx, hz) {
                    continue;
                }
                if *self.data_at(hx, hz) != UNSET_HEIGHT {
                    continue;
                }
                *self.data_at_mut(hx, hz) = chf.spans[ai].y;
                queue.push_back((ax, az, ai));
            }
        }
        Some(())
    }

    /// Walks from the span closest to a polygon vertex towards the polygon center
    /// and seeds the queue with the span found there.
    fn seed_with_poly_center(
        &mut self,
        chf: &CompactHeightfield,
        poly: &[u16],
        vertices: &[U16Vec3],
        bs: u16,
        queue: &mut VecDeque<(i32, i32, usize)>,
    ) -> Option<()> {
        // Note: Reads to the compact heightfield are offset by border size (bs)
        // since border size offset is already removed from the polymesh vertices.
        const OFFSET: [(i32, i32); 9] = [
            (0, 0),
            (-1, -1),
            (0, -1),
            (1, -1),
            (1, 0),
            (1, 1),
            (0, 1),
            (-1, 1),
            (-1, 0),
        ];

        // Find cell closest to a poly vertex
        let mut start = None;
        let mut dmin = UNSET_HEIGHT as i32;
        'search: for vertex in poly.iter().map(|index| vertices[*index as usize]) {
            for (dx, dz) in OFFSET {
                if dmin <= 0 {
                    break 'search;
                }
                let ax = vertex.x as i32 + dx;
                let ay = vertex.y as i32;
                let az = vertex.z as i32 + dz;
                if !self.contains(ax - self.xmin as i32, az - self.zmin as i32) {
                    continue;
                }
                let Some(cell) = chf.get_cell_at((ax + bs as i32) as u16, (az + bs as i32) as u16)
                else {
                    continue;
                };
                for i in cell.index_range() {
                    let d = (ay - chf.spans[i].y as i32).abs();
                    if d < dmin {
                        start = Some((ax, az, i));
                        dmin = d;
                    }
                }
            }
        }
        let start = start?;

        // Find center of the polygon
        let (sum_x, sum_z) = poly
            .iter()
            .map(|index| vertices[*index as usize])
            .fold((0_i32, 0_i32), |(x, z), v| (x + v.x as i32, z + v.z as i32));
        let pcx = sum_x / poly.len() as i32;
        let pcz = sum_z / poly.len() as i32;

        // Use a stack for DFS
        let mut stack = vec![start];
        let mut dirs = [0_u8, 1, 2, 3];
        // 0 marks unvisited cells during the walk.
        self.fill(0);
        // DFS to move to the center. Note that we need a DFS here and can not just move
        // directly towards the center without recording intermediate nodes, even though the polygons
        // are convex. In very rare we can get stuck due to contour simplification if we do not
        // record nodes.
        let mut current = start;
        loop {
            let Some(top) = stack.pop() else {
                tracing::warn!("Walk towards polygon center failed to reach center");
                break;
            };
            current = top;
            let (cx, cz, ci) = current;
            if cx == pcx && cz == pcz {
                break;
            }

            // If we are already at the correct X-position, prefer direction
            // directly towards the center in the Z-axis; otherwise prefer
            // direction in the X-axis
            let direct_dir = if cx == pcx {
                dir_offset(0, if pcz > cz { 1 } else { -1 })
            } else {
                dir_offset(if pcx > cx { 1 } else { -1 }, 0)
            } as usize;

            // Push the direct dir last so we start with this on next iteration
            dirs.swap(direct_dir, 3);

            for dir in dirs {
                let Some((_, _, new_index)) = chf.neighbor(cx + bs as i32, cz + bs as i32, ci, dir)
                else {
                    continue;
                };
                let new_x = cx + dir_offset_x(dir) as i32;
                let new_z = cz + dir_offset_z(dir) as i32;

                let hpx = new_x - self.xmin as i32;
                let hpz = new_z - self.zmin as i32;
                if !self.contains(hpx, hpz) || *self.data_at(hpx, hpz) != 0 {
                    continue;
                }
                *self.data_at_mut(hpx, hpz) = 1;
                stack.push((new_x, new_z, new_index));
            }
            dirs.swap(direct_dir, 3);
        }

        // The flood fill seeds are given in coordinates with borders
        let (cx, cz, ci) = current;
        queue.clear();
        queue.push_back((cx + bs as i32, cz + bs as i32, ci));
        self.fill(UNSET_HEIGHT);
        *self.data_at_mut(cx - self.xmin as i32, cz - self.zmin as i32) = chf.spans[ci].y;
        Some(())
    }

    /// Looks up the height under `f`, searching the closest rings of neighbors for a valid height
    /// if the cell itself has none.
    fn height_at(&self, f: Vec3A, ics: f32, ch: f32, radius: u32) -> u16 {
        let ix = (f.x * ics + 0.01).floor() as i32;
        let iz = (f.z * ics + 0.01).floor() as i32;
        let ix = (ix - self.xmin as i32).clamp(0, self.width as i32 - 1);
        let iz = (iz - self.zmin as i32).clamp(0, self.height as i32 - 1);
        let mut h = *self.data_at(ix, iz);
        if h != UNSET_HEIGHT {
            return h;
        }

        // Special case when data might be bad.
        // Walk adjacent cells in a spiral up to 'radius', and look
        // for a pixel which has a valid height.
        let (mut x, mut z) = (1, 0);
        let (mut dx, mut dz) = (1, 0);
        let max_size = radius * 2 + 1;
        let max_iter = max_size * max_size - 1;

        let mut next_ring_iter_start = 8;
        let mut next_ring_iters = 16;

        let mut dmin = f32::MAX;
        for i in 0..max_iter {
            let nx = ix + x;
            let nz = iz + z;
            if self.contains(nx, nz) {
                let nh = *self.data_at(nx, nz);
                if nh != UNSET_HEIGHT {
                    let d = (nh as f32 * ch - f.y).abs();
                    if d < dmin {
                        h = nh;
                        dmin = d;
                    }
                }
            }
            // We are searching in a grid which looks approximately like this:
            //  __________
            // |2 ______ 2|
            // | |1 __ 1| |
            // | | |__| | |
            // | |______| |
            // |__________|
            // We want to find the best height as close to the center cell as possible. This means that
            // if we find a height in one of the neighbor cells to the center, we don't want to
            // expand further out than the 8 neighbors - we want to limit our search to the closest
            // of these "rings", but the best height in the ring.
            // For example, the center is just 1 cell. We checked that at the entrance to the function.
            // The next "ring" contains 8 cells (marked 1 above). Those are all the neighbors to the center cell.
            // The next one again contains 16 cells (marked 2). In general each ring has 8 additional cells, which
            // can be thought of as adding 2 cells around the "center" of each side when we expand the ring.
            // Here we detect if we are about to enter the next ring, and if we are and we have found
            // a height, we abort the search.
            if i + 1 == next_ring_iter_start {
                if h != UNSET_HEIGHT {
                    break;
                }
                next_ring_iter_start += next_ring_iters;
                next_ring_iters += 8;
            }

            if x == z || (x < 0 && x == -z) || (x > 0 && x == 1 - z) {
                (dx, dz) = (-dz, dx);
            }
            x += dx;
            z += dz;
        }
        h
    }

    #[inline]
    fn fill(&mut self, value: u16) {
        let len = self.width as usize * self.height as usize;
        self.data[..len].fill(value);
    }

    #[inline]
    fn contains(&self, x: i32, z: i32) -> bool {
        x >= 0 && z >= 0 && x < self.width as i32 && z < self.height as i32
    }

    #[inline]
    fn data_at(&self, x: i32, z: i32) -> &u16 {
        &self.data[(x + z * self.width as i32) as usize]
    }

    #[inline]
    fn data_at_mut(&mut self, x: i32, z: i32) -> &mut u16 {
        &mut self.data[(x + z * self.width as i32) as usize]
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    xmin: u16,
    xmax: u16,
    zmin: u16,
    zmax: u16,
}

impl Bounds {
    #[inline]
    fn width(&self) -> u16 {
        self.xmax.saturating_sub(self.xmin)
    }

    #[inline]
    fn height(&self) -> u16 {
        self.zmax.saturating_sub(self.zmin)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use glam::{UVec3, Vec3};

    use crate::{Aabb3d, BuildContoursFlags, HeightfieldBuilder, TriMesh, span::AreaType};

    use super::*;

    /// Runs the pipeline on a flat 8x8 quad at y = 1.
    fn flat_meshes() -> (PolygonNavmesh, CompactHeightfield) {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(8.0, 4.0, 8.0),
            },
            cell_size: 0.5,
            cell_height: 0.5,
        }
        .build()
        .unwrap();
        let trimesh = TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 1.0, 0.0),
                Vec3A::new(0.0, 1.0, 8.0),
                Vec3A::new(8.0, 1.0, 8.0),
                Vec3A::new(8.0, 1.0, 0.0),
            ],
            indices: vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
            area_types: vec![AreaType::DEFAULT_WALKABLE; 2],
        };
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        let mut chf = heightfield.into_compact(4, 1).unwrap();
        chf.build_distance_field();
        chf.build_regions(0, 1, 20).unwrap();
        let contours = chf
            .build_contours(1.3, 12, BuildContoursFlags::default())
            .unwrap();
        let mesh = contours.build_polygon_mesh(6).unwrap();
        (mesh, chf)
    }

    #[test]
    fn flat_polygon_detail_is_flat() {
        let (mesh, chf) = flat_meshes();
        let detail = DetailNavmesh::new(&mesh, &chf, 3.0, 0.5).unwrap();
        assert_eq!(detail.meshes.len(), mesh.polygon_count());
        let y = detail.vertices[0].y;
        for vertex in &detail.vertices {
            assert_relative_eq!(vertex.y, y, epsilon = 1e-4);
        }
    }

    #[test]
    fn sub_meshes_respect_caps() {
        let (mesh, chf) = flat_meshes();
        let detail = DetailNavmesh::new(&mesh, &chf, 0.5, 0.01).unwrap();
        for sub_mesh in &detail.meshes {
            assert!(sub_mesh.vertex_count as usize <= MAX_DETAIL_VERTICES);
            assert!(sub_mesh.triangle_count as usize <= MAX_DETAIL_TRIANGLES);
            let start = sub_mesh.base_triangle_index as usize;
            let end = start + sub_mesh.triangle_count as usize;
            for triangle in &detail.triangles[start..end] {
                assert!(triangle.iter().all(|index| (*index as u32) < sub_mesh.vertex_count));
            }
        }
        assert_eq!(detail.triangles.len(), detail.triangle_flags.len());
    }

    #[test]
    fn detail_without_samples_keeps_polygon_outline() {
        let (mesh, chf) = flat_meshes();
        let detail = DetailNavmesh::new(&mesh, &chf, 0.0, 1.0).unwrap();
        for (i, sub_mesh) in detail.meshes.iter().enumerate() {
            let polygon_vertices = mesh.polygon_vertices(i).count() as u32;
            assert_eq!(sub_mesh.vertex_count, polygon_vertices);
            assert_eq!(sub_mesh.triangle_count, polygon_vertices - 2);
            // Every outline edge of the polygon is flagged exactly once.
            let start = sub_mesh.base_triangle_index as usize;
            let end = start + sub_mesh.triangle_count as usize;
            let boundary_edges: u32 = detail.triangle_flags[start..end]
                .iter()
                .map(|flags| (0..3).filter(|e| flags >> (e * 2) & 1 != 0).count() as u32)
                .sum();
            assert_eq!(boundary_edges, polygon_vertices);
        }
    }

    #[test]
    fn empty_polygon_mesh_yields_empty_detail() {
        let (mut mesh, chf) = flat_meshes();
        mesh.vertices.clear();
        mesh.polygons.clear();
        mesh.regions.clear();
        mesh.areas.clear();
        mesh.flags.clear();
        let detail = DetailNavmesh::new(&mesh, &chf, 1.0, 1.0).unwrap();
        assert_eq!(detail, DetailNavmesh::default());
    }

    #[test]
    fn delaunay_adds_interior_point() {
        let mut scratch = DetailScratch::default();
        scratch.vertices = vec![
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 4.0),
            Vec3A::new(4.0, 0.0, 4.0),
            Vec3A::new(4.0, 0.0, 0.0),
            Vec3A::new(2.0, 1.0, 2.1),
        ];
        scratch.hull = vec![0, 1, 2, 3];
        scratch.delaunay_hull().unwrap();
        assert_eq!(scratch.triangles.len(), 4);
        for triangle in &scratch.triangles {
            let U16Vec3 { x, y, z } = triangle.vertices;
            assert!([x, y, z].contains(&4));
        }
    }

    #[test]
    fn circum_circle_of_right_triangle() {
        let (center, radius) = circum_circle(
            Vec3A::new(0.0, 0.0, 0.0),
            Vec3A::new(2.0, 0.0, 0.0),
            Vec3A::new(0.0, 0.0, 2.0),
        );
        assert_relative_eq!(center.x, 1.0);
        assert_relative_eq!(center.z, 1.0);
        assert_relative_eq!(radius, 2.0_f32.sqrt());
    }

    #[test]
    fn point_inside_triangle_reports_vertical_distance() {
        let a = Vec3A::new(0.0, 1.0, 0.0);
        let b = Vec3A::new(0.0, 1.0, 2.0);
        let c = Vec3A::new(2.0, 1.0, 0.0);
        assert_eq!(dist_pt_tri(Vec3A::new(0.5, 3.0, 0.5), a, b, c), Some(2.0));
        assert_eq!(dist_pt_tri(Vec3A::new(3.0, 1.0, 3.0), a, b, c), None);
    }
}
