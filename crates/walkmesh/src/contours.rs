//! Tracing the outlines of the regions of a [`CompactHeightfield`] into simplified polygons.

use glam::IVec3;
use thiserror::Error;

use crate::{
    Aabb3d, AreaType, CompactHeightfield, RegionId,
    math::{
        distance_squared_between_point_and_line_ivec2, intersect, left, left_on, next, prev,
        vequal_xz,
    },
};

impl CompactHeightfield {
    /// Builds a contour set from the region outlines in the heightfield.
    ///
    /// The raw contours will match the region outlines exactly. The `max_error` and `max_edge_len`
    /// parameters control how closely the simplified contours will match the raw contours.
    ///
    /// Simplified contours are generated such that the vertices for portals between areas match up.
    /// (They are considered mandatory vertices.)
    ///
    /// Setting `max_edge_len` to zero will disable the edge length feature.
    ///
    /// - `max_error`: The maximum distance a simplified contour's border edges should deviate
    ///   from the original raw contour. [Limits: >=0] [Units: vx]
    /// - `max_edge_len`: The maximum allowed length for contour edges along the border of the mesh. [Limits: >=0] [Units: vx]
    pub fn build_contours(
        &self,
        max_error: f32,
        max_edge_len: u16,
        build_flags: BuildContoursFlags,
    ) -> Result<ContourSet, ContourError> {
        let _span = tracing::trace_span!("build_contours").entered();
        let border_size = self.border_size;
        let mut cset = ContourSet {
            contours: Vec::with_capacity(self.max_region.bits().max(8) as usize),
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            width: self.width.saturating_sub(border_size * 2),
            height: self.height.saturating_sub(border_size * 2),
            border_size,
            max_error,
        };
        if border_size > 0 {
            // If the heightfield was built with border_size, remove the offset
            let pad = border_size as f32 * self.cell_size;
            cset.aabb.min.x += pad;
            cset.aabb.min.z += pad;
            cset.aabb.max.x -= pad;
            cset.aabb.max.z -= pad;
        }

        let mut flags = vec![0_u8; self.spans.len()];

        // Mark boundaries
        for (x, z, i) in self.iter_spans() {
            let region = self.spans[i].region;
            if region == RegionId::NONE || region.is_border() {
                flags[i] = 0;
                continue;
            }
            let mut res = 0;
            for dir in 0..4 {
                let neighbor_region = self
                    .neighbor(x as i32, z as i32, i, dir)
                    .map_or(RegionId::NONE, |(_, _, a_index)| self.spans[a_index].region);
                if neighbor_region == region {
                    res |= 1 << dir;
                }
            }
            // Inverse, mark non connected edges.
            flags[i] = res ^ 0xf;
        }

        let mut verts = Vec::with_capacity(256);
        let mut simplified = Vec::with_capacity(64);

        for (x, z, i) in self.iter_spans() {
            if flags[i] == 0 || flags[i] == 0xf {
                flags[i] = 0;
                continue;
            }
            let region = self.spans[i].region;
            if region == RegionId::NONE || region.is_border() {
                continue;
            }
            let area = self.areas[i];

            verts.clear();
            simplified.clear();

            self.walk_contour(x as i32, z as i32, i, &mut flags, &mut verts);
            simplify_contour(&verts, &mut simplified, max_error, max_edge_len, build_flags);
            remove_degenerate_segments(&mut simplified);

            // Create contour.
            if simplified.len() < 3 {
                continue;
            }
            let offset = IVec3::new(border_size as i32, 0, border_size as i32);
            // If the heightfield was built with border_size, remove the offset.
            let without_border = |vertex: &ContourVertex| ContourVertex {
                position: vertex.position - offset,
                flags: vertex.flags,
            };
            cset.contours.push(Contour {
                vertices: simplified.iter().map(without_border).collect(),
                raw_vertices: verts.iter().map(without_border).collect(),
                region,
                area,
            });
        }

        cset.merge_holes(self.max_region)?;
        tracing::debug!(contours = cset.contours.len(), "built contours");
        Ok(cset)
    }

    fn walk_contour(
        &self,
        mut x: i32,
        mut z: i32,
        mut i: usize,
        flags: &mut [u8],
        points: &mut Vec<ContourVertex>,
    ) {
        // Choose the first non-connected edge
        let mut dir = 0;
        while flags[i] & (1 << dir) == 0 {
            dir += 1;
        }

        let start_dir = dir;
        let start_i = i;
        let area = self.areas[i];

        let mut iter = 0;
        loop {
            iter += 1;
            if iter >= 40_000 {
                break;
            }
            if flags[i] & (1 << dir) != 0 {
                // Choose the edge corner
                let (p_y, is_border_vertex) = self.get_corner_height(x, z, i, dir);
                let (p_x, p_z) = match dir {
                    0 => (x, z + 1),
                    1 => (x + 1, z + 1),
                    2 => (x + 1, z),
                    _ => (x, z),
                };
                let mut r = RegionVertexId::NONE;
                if let Some((_, _, a_index)) = self.neighbor(x, z, i, dir) {
                    r = RegionVertexId::from(self.spans[a_index].region);
                    if area != self.areas[a_index] {
                        r |= RegionVertexId::AREA_BORDER;
                    }
                }
                if is_border_vertex {
                    r |= RegionVertexId::BORDER_VERTEX;
                }
                points.push(ContourVertex {
                    position: IVec3::new(p_x, p_y as i32, p_z),
                    flags: r,
                });

                // Remove visited edges
                flags[i] &= !(1 << dir);
                // Rotate clockwise
                dir = (dir + 1) & 0x3;
            } else {
                let Some((n_x, n_z, n_i)) = self.neighbor(x, z, i, dir) else {
                    // Should not happen.
                    tracing::trace!("contour walk hit an unconnected edge at ({x}, {z})");
                    return;
                };
                x = n_x;
                z = n_z;
                i = n_i;
                // Rotate counterclockwise
                dir = (dir + 3) & 0x3;
            }
            if start_i == i && start_dir == dir {
                break;
            }
        }
    }

    /// Returns the height of the corner of the edge `dir` of span `i`
    /// and whether the corner is a vertex on the tile border that will be removed later.
    fn get_corner_height(&self, x: i32, z: i32, i: usize, dir: u8) -> (u16, bool) {
        let mut ch = self.spans[i].y;
        let dir_p = (dir + 1) & 0x3;

        // Combine region and area codes in order to prevent
        // border vertices which are in between two areas to be removed.
        let region_and_area =
            |i: usize| self.spans[i].region.bits() as u32 | ((self.areas[i].0 as u32) << 16);
        let mut regs = [0_u32; 4];
        regs[0] = region_and_area(i);

        if let Some((a_x, a_z, a_i)) = self.neighbor(x, z, i, dir) {
            ch = ch.max(self.spans[a_i].y);
            regs[1] = region_and_area(a_i);
            if let Some((_, _, b_i)) = self.neighbor(a_x, a_z, a_i, dir_p) {
                ch = ch.max(self.spans[b_i].y);
                regs[2] = region_and_area(b_i);
            }
        }
        if let Some((a_x, a_z, a_i)) = self.neighbor(x, z, i, dir_p) {
            ch = ch.max(self.spans[a_i].y);
            regs[3] = region_and_area(a_i);
            if let Some((_, _, b_i)) = self.neighbor(a_x, a_z, a_i, dir) {
                ch = ch.max(self.spans[b_i].y);
                regs[2] = region_and_area(b_i);
            }
        }

        // Check if the vertex is special edge vertex, these vertices will be removed later.
        let border = RegionId::BORDER_REGION.bits() as u32;
        let is_border_vertex = (0..4).any(|j| {
            let a = regs[j];
            let b = regs[(j + 1) & 0x3];
            let c = regs[(j + 2) & 0x3];
            let d = regs[(j + 3) & 0x3];

            // The vertex is a border vertex there are two same exterior cells in a row,
            // followed by two interior cells and none of the regions are out of bounds.
            let two_same_exts = (a & b & border) != 0 && a == b;
            let two_ints = ((c | d) & border) == 0;
            let ints_same_area = (c >> 16) == (d >> 16);
            let no_zeros = a != 0 && b != 0 && c != 0 && d != 0;
            two_same_exts && two_ints && ints_same_area && no_zeros
        });
        (ch, is_border_vertex)
    }
}

/// Simplifies the raw contour `points` into `simplified`.
/// The flags of the simplified vertices temporarily hold the index of the raw point they originate from.
fn simplify_contour(
    points: &[ContourVertex],
    simplified: &mut Vec<ContourVertex>,
    max_error: f32,
    max_edge_len: u16,
    flags: BuildContoursFlags,
) {
    let with_index = |i: usize| ContourVertex {
        position: points[i].position,
        flags: RegionVertexId::from_bits_retain(i as u32),
    };
    let raw_index = |vertex: &ContourVertex| vertex.flags.bits() as usize;

    // Add initial points.
    let has_connections = points
        .iter()
        .any(|point| point.flags.intersects(RegionVertexId::REGION_MASK));

    if has_connections {
        // The contour has some portals to other regions.
        // Add a new point to every location where the region changes.
        let ni = points.len();
        for i in 0..ni {
            let ii = (i + 1) % ni;
            let different_regs = points[i].flags.region() != points[ii].flags.region();
            let area_borders = points[i].flags.contains(RegionVertexId::AREA_BORDER)
                != points[ii].flags.contains(RegionVertexId::AREA_BORDER);
            if different_regs || area_borders {
                simplified.push(with_index(i));
            }
        }
    }

    if simplified.is_empty() {
        // If there is no connections at all,
        // create some initial points for the simplification process.
        // Find lower-left and upper-right vertices of the contour.
        let mut lower_left = 0;
        let mut upper_right = 0;
        for (i, point) in points.iter().enumerate() {
            let p = point.position;
            let ll = points[lower_left].position;
            if p.x < ll.x || (p.x == ll.x && p.z < ll.z) {
                lower_left = i;
            }
            let ur = points[upper_right].position;
            if p.x > ur.x || (p.x == ur.x && p.z > ur.z) {
                upper_right = i;
            }
        }
        simplified.push(with_index(lower_left));
        simplified.push(with_index(upper_right));
    }

    // Add points until all raw points are within
    // error tolerance to the simplified shape.
    let pn = points.len();
    let mut i = 0;
    while i < simplified.len() {
        let ii = (i + 1) % simplified.len();

        let mut a = simplified[i].position;
        let ai = raw_index(&simplified[i]);
        let mut b = simplified[ii].position;
        let bi = raw_index(&simplified[ii]);

        // Find maximum deviation from the segment.
        let mut max_d = 0.0;
        let mut max_i = None;

        // Traverse the segment in lexilogical order so that the
        // max deviation is calculated similarly when traversing
        // opposite segments.
        let (mut ci, c_inc, end_i) = if b.x > a.x || (b.x == a.x && b.z > a.z) {
            ((ai + 1) % pn, 1, bi)
        } else {
            std::mem::swap(&mut a, &mut b);
            ((bi + pn - 1) % pn, pn - 1, ai)
        };

        // Tessellate only outer edges or edges between areas.
        let c_flags = points[ci].flags;
        if c_flags.region() == RegionId::NONE || c_flags.contains(RegionVertexId::AREA_BORDER) {
            while ci != end_i {
                let c = points[ci].position;
                let d = distance_squared_between_point_and_line_ivec2(
                    (c.x, c.z),
                    (a.x, a.z),
                    (b.x, b.z),
                );
                if d > max_d {
                    max_d = d;
                    max_i = Some(ci);
                }
                ci = (ci + c_inc) % pn;
            }
        }

        // If the max deviation is larger than accepted error,
        // add new point, else continue to next segment.
        match max_i {
            Some(max_i) if max_d > max_error * max_error => {
                simplified.insert(i + 1, with_index(max_i));
            }
            _ => i += 1,
        }
    }

    // Split too long edges.
    let tessellate_walls = flags.contains(BuildContoursFlags::TESSELLATE_SOLID_WALL_EDGES);
    let tessellate_areas = flags.contains(BuildContoursFlags::TESSELLATE_AREA_EDGES);
    if max_edge_len > 0 && (tessellate_walls || tessellate_areas) {
        let max_edge_len = max_edge_len as i32;
        let mut i = 0;
        while i < simplified.len() {
            let ii = (i + 1) % simplified.len();

            let a = simplified[i].position;
            let ai = raw_index(&simplified[i]);
            let b = simplified[ii].position;
            let bi = raw_index(&simplified[ii]);

            // Find maximum deviation from the segment.
            let mut max_i = None;
            let ci = (ai + 1) % pn;

            // Tessellate only outer edges or edges between areas.
            let c_flags = points[ci].flags;
            // Wall edges.
            let tess = (tessellate_walls && c_flags.region() == RegionId::NONE)
                // Edges between areas.
                || (tessellate_areas && c_flags.contains(RegionVertexId::AREA_BORDER));

            if tess {
                let dx = b.x - a.x;
                let dz = b.z - a.z;
                if dx * dx + dz * dz > max_edge_len * max_edge_len {
                    // Round based on the segments in lexilogical order so that the
                    // max tesselation is consistent regardless in which direction
                    // segments are traversed.
                    let n = if bi < ai { bi + pn - ai } else { bi - ai };
                    if n > 1 {
                        max_i = Some(if b.x > a.x || (b.x == a.x && b.z > a.z) {
                            (ai + n / 2) % pn
                        } else {
                            (ai + (n + 1) / 2) % pn
                        });
                    }
                }
            }

            // If the max deviation is larger than accepted error,
            // add new point, else continue to next segment.
            if let Some(max_i) = max_i {
                simplified.insert(i + 1, with_index(max_i));
            } else {
                i += 1;
            }
        }
    }

    for vertex in simplified.iter_mut() {
        // The edge vertex flag is take from the current raw point,
        // and the neighbour region is take from the next raw point.
        let bi = raw_index(vertex);
        let ai = (bi + 1) % pn;
        vertex.flags = (points[ai].flags
            & (RegionVertexId::REGION_MASK | RegionVertexId::AREA_BORDER))
            | (points[bi].flags & RegionVertexId::BORDER_VERTEX);
    }
}

fn remove_degenerate_segments(simplified: &mut Vec<ContourVertex>) {
    // Remove adjacent vertices which are equal on xz-plane,
    // or else the triangulator will get confused.
    let mut i = 0;
    while i < simplified.len() {
        let ni = next(i, simplified.len());
        if vequal_xz(simplified[i].position, simplified[ni].position) {
            // Degenerate segment, remove.
            simplified.remove(i);
        }
        i += 1;
    }
}

/// Twice the signed area of the contour on the xz-plane, rounded towards the outline side.
/// Outlines have a positive area, holes a negative one.
fn calc_area_of_polygon_2d(vertices: &[ContourVertex]) -> i32 {
    let mut area = 0;
    for i in 0..vertices.len() {
        let vi = vertices[i].position;
        let vj = vertices[prev(i, vertices.len())].position;
        area += vi.x * vj.z - vj.x * vi.z;
    }
    (area + 1) / 2
}

/// Returns the leftmost vertex of the contour, preferring the lowest z on ties.
fn find_left_most_vertex(contour: &Contour) -> (i32, i32, usize) {
    let first = contour.vertices[0].position;
    let (mut min_x, mut min_z, mut leftmost) = (first.x, first.z, 0);
    for (i, vertex) in contour.vertices.iter().enumerate().skip(1) {
        let p = vertex.position;
        if p.x < min_x || (p.x == min_x && p.z < min_z) {
            min_x = p.x;
            min_z = p.z;
            leftmost = i;
        }
    }
    (min_x, min_z, leftmost)
}

/// Returns whether `pj` lies in the cone formed by vertex `i` of the polygon and its two neighbors.
fn in_cone(i: usize, vertices: &[ContourVertex], pj: IVec3) -> bool {
    let n = vertices.len();
    let pi = vertices[i].position;
    let pi1 = vertices[next(i, n)].position;
    let pin1 = vertices[prev(i, n)].position;

    // If P[i] is a convex vertex [ i+1 left or on (i-1,i) ].
    if left_on(pin1, pi, pi1) {
        return left(pi, pj, pin1) && left(pj, pi, pi1);
    }
    // Assume (i-1,i,i+1) not collinear.
    // else P[i] is reflex.
    !(left_on(pi, pj, pi1) && left_on(pj, pi, pin1))
}

/// Returns whether the segment `d0 d1` intersects any edge of the contour not incident to vertex `skip`.
fn intersect_seg_contour(d0: IVec3, d1: IVec3, skip: Option<usize>, vertices: &[ContourVertex]) -> bool {
    let n = vertices.len();
    // For each edge (k,k+1) of P
    for k in 0..n {
        let k1 = next(k, n);
        // Skip edges incident to i.
        if skip == Some(k) || skip == Some(k1) {
            continue;
        }
        let p0 = vertices[k].position;
        let p1 = vertices[k1].position;
        if vequal_xz(d0, p0) || vequal_xz(d1, p0) || vequal_xz(d0, p1) || vequal_xz(d1, p1) {
            continue;
        }
        if intersect(d0, d1, p0, p1) {
            return true;
        }
    }
    false
}

/// Splices `hole` into `outline` through the diagonal between `outline[ia]` and `hole[ib]`.
fn merge_contours(outline: &mut Contour, hole: &Contour, ia: usize, ib: usize) {
    let outline_len = outline.vertices.len();
    let hole_len = hole.vertices.len();
    let mut vertices = Vec::with_capacity(outline_len + hole_len + 2);

    // Copy contour A.
    for i in 0..=outline_len {
        vertices.push(outline.vertices[(ia + i) % outline_len]);
    }
    // Copy contour B
    for i in 0..=hole_len {
        vertices.push(hole.vertices[(ib + i) % hole_len]);
    }
    outline.vertices = vertices;
}

/// Merges the holes of a region into its outline. Holes that cannot be merged are dropped.
fn merge_region_holes(outline: &mut Contour, holes: Vec<Contour>) {
    // Sort holes from left to right.
    let mut holes: Vec<_> = holes
        .into_iter()
        .map(|hole| {
            let (min_x, min_z, leftmost) = find_left_most_vertex(&hole);
            (min_x, min_z, leftmost, hole)
        })
        .collect();
    holes.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    let mut diags: Vec<(usize, i32)> = Vec::new();

    // Merge holes into the outline one by one.
    for i in 0..holes.len() {
        let (_, _, leftmost, ref hole) = holes[i];
        let mut index = None;
        let mut best_vertex = leftmost;
        for _ in 0..hole.vertices.len() {
            // Find potential diagonals.
            // The 'best' vertex must be in the cone described by 3 consecutive vertices of the outline.
            diags.clear();
            let corner = hole.vertices[best_vertex].position;
            for j in 0..outline.vertices.len() {
                if in_cone(j, &outline.vertices, corner) {
                    let delta = outline.vertices[j].position - corner;
                    diags.push((j, delta.x * delta.x + delta.z * delta.z));
                }
            }
            // Sort potential diagonals by distance, we want to make the connection as short as possible.
            diags.sort_by_key(|(_, dist)| *dist);

            // Find a diagonal that is not intersecting the outline not the remaining holes.
            index = diags.iter().map(|(vert, _)| *vert).find(|&vert| {
                let pt = outline.vertices[vert].position;
                let intersects_outline =
                    intersect_seg_contour(pt, corner, Some(vert), &outline.vertices);
                let intersects_hole = holes[i..]
                    .iter()
                    .any(|(_, _, _, other)| intersect_seg_contour(pt, corner, None, &other.vertices));
                !intersects_outline && !intersects_hole
            });
            // If found non-intersecting diagonal, stop looking.
            if index.is_some() {
                break;
            }
            // All the potential diagonals for the current vertex were intersecting, try next vertex.
            best_vertex = (best_vertex + 1) % hole.vertices.len();
        }

        let Some(index) = index else {
            tracing::warn!(
                region = outline.region.bits(),
                "Failed to find merge points for a hole, dropping it"
            );
            continue;
        };
        merge_contours(outline, hole, index, best_vertex);
    }
}

impl ContourSet {
    /// Merges every hole into the outline of its region.
    fn merge_holes(&mut self, max_region: RegionId) -> Result<(), ContourError> {
        // Positively wound contours are outlines, negative ones holes.
        // A region has at most one outline and any number of holes.
        let region_count = max_region.bits() as usize + 1;
        let mut has_outline = vec![false; region_count];
        let mut hole_count = 0;
        for contour in &self.contours {
            let region = contour.region.id() as usize;
            if region >= region_count {
                continue;
            }
            if !contour.is_outline() {
                hole_count += 1;
            } else if std::mem::replace(&mut has_outline[region], true) {
                return Err(ContourError::MultipleOutlines {
                    region: contour.region,
                });
            }
        }
        if hole_count == 0 {
            return Ok(());
        }

        // Collect outline contour and holes contours per region.
        let mut outlines: Vec<Option<usize>> = vec![None; region_count];
        let mut holes: Vec<Vec<Contour>> = vec![Vec::new(); region_count];
        let mut contours = Vec::with_capacity(self.contours.len() - hole_count);
        for contour in self.contours.drain(..) {
            let region = contour.region.id() as usize;
            if region >= region_count {
                continue;
            }
            if contour.is_outline() {
                outlines[region] = Some(contours.len());
                contours.push(contour);
            } else {
                holes[region].push(contour);
            }
        }

        // Finally merge each regions holes into the outline.
        for (region, region_holes) in holes.into_iter().enumerate() {
            if region_holes.is_empty() {
                continue;
            }
            let Some(outline) = outlines[region] else {
                // The region does not have an outline.
                // This can happen if the contour becomes self-overlapping
                // because of too aggressive simplification settings.
                return Err(ContourError::MissingOutline {
                    region: RegionId::from(region as u16),
                });
            };
            merge_region_holes(&mut contours[outline], region_holes);
        }
        self.contours = contours;
        Ok(())
    }
}

/// Represents a group of related contours.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ContourSet {
    /// An array of the contours in the set.
    pub contours: Vec<Contour>,
    /// The AABB in world space
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The width of the set. (Along the x-axis in cell units.)
    pub width: u16,
    /// The height of the set. (Along the z-axis in cell units.)
    pub height: u16,
    /// The AABB border size used to generate the source data from which the contours were derived.
    pub border_size: u16,
    /// The max edge error that this contour set was simplified with.
    pub max_error: f32,
}

/// Represents a simple, non-overlapping contour in field space.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct Contour {
    /// Simplified contour vertex and connection data.
    pub vertices: Vec<ContourVertex>,
    /// Raw contour vertex and connection data.
    pub raw_vertices: Vec<ContourVertex>,
    /// Region ID of the contour.
    pub region: RegionId,
    /// Area type of the contour.
    pub area: AreaType,
}

impl Contour {
    /// Returns whether the contour is an outline and not a hole, i.e. has a non-negative signed area.
    pub fn is_outline(&self) -> bool {
        calc_area_of_polygon_2d(&self.vertices) >= 0
    }
}

/// A vertex of a [`Contour`] in voxel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct ContourVertex {
    /// The position of the vertex relative to the contour set's AABB. [Units: vx]
    pub position: IVec3,
    /// The region on the other side of the edge starting at this vertex, plus border flags.
    pub flags: RegionVertexId,
}

bitflags::bitflags! {
    /// The neighbor region of a contour edge together with flags describing the edge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct RegionVertexId: u32 {
        /// No neighbor region.
        const NONE = 0;

        /// Applied to the region id field of contour vertices in order to extract the region id.
        /// The region id field of a vertex may have several flags applied to it.  So the
        /// fields value can't be used directly.
        /// [`RegionId::BORDER_REGION`] is not part of the mask, so simplified vertices drop it.
        const REGION_MASK = RegionId::MAX.bits() as u32;

        /// Border vertex flag.
        /// If a region ID has this bit set, then the associated element lies on
        /// a tile border. If a contour vertex's region ID has this bit set, the
        /// vertex will later be removed in order to match the segments and vertices
        /// at tile boundaries.
        const BORDER_VERTEX = 0x10_000;

        /// Area border flag.
        /// If a region ID has this bit set, then the associated element lies on
        /// the border of an area.
        const AREA_BORDER = 0x20_000;
    }
}

impl RegionVertexId {
    /// Returns the neighbor region without any flags.
    #[inline]
    pub fn region(self) -> RegionId {
        RegionId::from((self & Self::REGION_MASK).bits() as u16)
    }
}

impl From<RegionId> for RegionVertexId {
    fn from(region_id: RegionId) -> Self {
        RegionVertexId::from_bits_retain(region_id.bits() as u32)
    }
}

bitflags::bitflags! {
    /// Contour build flags used in [`CompactHeightfield::build_contours`]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
    #[repr(transparent)]
    pub struct BuildContoursFlags: u8 {
        /// Tessellate solid (impassable) edges during contour simplification.
        const TESSELLATE_SOLID_WALL_EDGES = 1;
        /// Tessellate edges between areas during contour simplification.
        const TESSELLATE_AREA_EDGES = 2;

        /// Default flags for building contours.
        const DEFAULT = Self::TESSELLATE_SOLID_WALL_EDGES.bits();
    }
}

impl Default for BuildContoursFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Errors that can occur while building a [`ContourSet`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContourError {
    /// A region has holes, but no outline to merge them into.
    /// This usually means the contour simplification settings are too aggressive.
    #[error(
        "Bad outline for region {}, contour simplification is likely too aggressive",
        .region.bits()
    )]
    MissingOutline {
        /// The region without an outline
        region: RegionId,
    },
    /// A region has more than one outline.
    #[error("Multiple outlines for region {}", .region.bits())]
    MultipleOutlines {
        /// The region with multiple outlines
        region: RegionId,
    },
}

#[cfg(test)]
mod tests {
    use glam::{UVec3, Vec3, Vec3A};

    use crate::{HeightfieldBuilder, TriMesh};

    use super::*;

    fn regions_for(size: f32, hole: Option<(u16, u16)>) -> CompactHeightfield {
        let mut heightfield = HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::new(size, 4.0, size),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap();
        let trimesh = TriMesh {
            vertices: vec![
                Vec3A::new(0.0, 1.0, 0.0),
                Vec3A::new(0.0, 1.0, size),
                Vec3A::new(size, 1.0, size),
                Vec3A::new(size, 1.0, 0.0),
            ],
            indices: vec![UVec3::new(0, 1, 2), UVec3::new(0, 2, 3)],
            area_types: vec![AreaType::DEFAULT_WALKABLE; 2],
        };
        heightfield.rasterize_triangles(&trimesh, 1).unwrap();
        let mut field = heightfield.into_compact(2, 1).unwrap();
        if let Some((min, max)) = hole {
            for (x, z, i) in field.iter_spans().collect::<Vec<_>>() {
                if (min..max).contains(&x) && (min..max).contains(&z) {
                    field.areas[i] = AreaType::NOT_WALKABLE;
                }
            }
        }
        field.build_regions_monotone(0, 0, 0).unwrap();
        field
    }

    fn vertex(x: i32, z: i32) -> ContourVertex {
        ContourVertex {
            position: IVec3::new(x, 0, z),
            flags: RegionVertexId::NONE,
        }
    }

    #[test]
    fn square_region_has_four_corners() {
        let field = regions_for(6.0, None);
        let cset = field
            .build_contours(1.3, 0, BuildContoursFlags::default())
            .unwrap();
        assert_eq!(cset.contours.len(), 1);
        let contour = &cset.contours[0];
        assert!(contour.is_outline());
        let mut corners: Vec<_> = contour
            .vertices
            .iter()
            .map(|v| (v.position.x, v.position.z))
            .collect();
        corners.sort();
        assert_eq!(corners, vec![(0, 0), (0, 6), (6, 0), (6, 6)]);
        assert_eq!(contour.raw_vertices.len(), 24);
        assert!(contour.vertices.iter().all(|v| v.position.y == 2));
    }

    #[test]
    fn long_edges_are_split() {
        let field = regions_for(12.0, None);
        let cset = field
            .build_contours(1.3, 4, BuildContoursFlags::TESSELLATE_SOLID_WALL_EDGES)
            .unwrap();
        let contour = &cset.contours[0];
        for i in 0..contour.vertices.len() {
            let a = contour.vertices[i].position;
            let b = contour.vertices[next(i, contour.vertices.len())].position;
            let d = b - a;
            assert!(d.x * d.x + d.z * d.z <= 16, "edge {a} -> {b} is too long");
        }
    }

    #[test]
    fn simplified_contour_stays_within_error() {
        let field = regions_for(10.0, Some((3, 6)));
        let max_error = 1.3;
        let cset = field
            .build_contours(max_error, 0, BuildContoursFlags::default())
            .unwrap();
        for contour in &cset.contours {
            for raw in &contour.raw_vertices {
                let closest = (0..contour.vertices.len())
                    .map(|i| {
                        let a = contour.vertices[i].position;
                        let b = contour.vertices[next(i, contour.vertices.len())].position;
                        distance_squared_between_point_and_line_ivec2(
                            (raw.position.x, raw.position.z),
                            (a.x, a.z),
                            (b.x, b.z),
                        )
                    })
                    .fold(f32::MAX, f32::min);
                assert!(closest <= max_error * max_error);
            }
        }
    }

    #[test]
    fn holes_are_merged_into_outline() {
        // Hand-made outline and hole, each with positive/negative area respectively.
        let outline = Contour {
            vertices: vec![vertex(0, 0), vertex(0, 10), vertex(10, 10), vertex(10, 0)],
            raw_vertices: Vec::new(),
            region: RegionId::from(1),
            area: AreaType::DEFAULT_WALKABLE,
        };
        let hole = Contour {
            vertices: vec![vertex(4, 4), vertex(6, 4), vertex(6, 6), vertex(4, 6)],
            ..outline.clone()
        };
        assert!(outline.is_outline());
        assert!(!hole.is_outline());
        let mut cset = ContourSet {
            contours: vec![outline, hole],
            aabb: Aabb3d::default(),
            cell_size: 1.0,
            cell_height: 1.0,
            width: 10,
            height: 10,
            border_size: 0,
            max_error: 1.0,
        };
        cset.merge_holes(RegionId::from(1)).unwrap();
        assert_eq!(cset.contours.len(), 1);
        // 4 outline + 4 hole vertices plus the two duplicated bridge vertices.
        assert_eq!(cset.contours[0].vertices.len(), 10);
        assert!(cset.contours[0].is_outline());
    }

    #[test]
    fn vertex_region_drops_the_border_bit() {
        let flags = RegionVertexId::from(RegionId::from(5) | RegionId::BORDER_REGION)
            | RegionVertexId::AREA_BORDER;
        assert_eq!(flags.region(), RegionId::from(5));
        assert_eq!(
            flags & (RegionVertexId::REGION_MASK | RegionVertexId::AREA_BORDER),
            RegionVertexId::from(RegionId::from(5)) | RegionVertexId::AREA_BORDER
        );
    }

    #[test]
    fn second_outline_in_a_region_is_an_error() {
        let square = |min: i32| Contour {
            vertices: vec![
                vertex(min, min),
                vertex(min, min + 2),
                vertex(min + 2, min + 2),
                vertex(min + 2, min),
            ],
            raw_vertices: Vec::new(),
            region: RegionId::from(1),
            area: AreaType::DEFAULT_WALKABLE,
        };
        let mut cset = ContourSet {
            contours: vec![square(1), square(6)],
            aabb: Aabb3d::default(),
            cell_size: 1.0,
            cell_height: 1.0,
            width: 10,
            height: 10,
            border_size: 0,
            max_error: 1.0,
        };
        assert!(cset.contours.iter().all(Contour::is_outline));
        assert_eq!(
            cset.merge_holes(RegionId::from(1)),
            Err(ContourError::MultipleOutlines {
                region: RegionId::from(1)
            })
        );
    }

    #[test]
    fn hole_without_outline_is_an_error() {
        let hole = Contour {
            vertices: vec![vertex(4, 4), vertex(6, 4), vertex(6, 6), vertex(4, 6)],
            raw_vertices: Vec::new(),
            region: RegionId::from(1),
            area: AreaType::DEFAULT_WALKABLE,
        };
        let mut cset = ContourSet {
            contours: vec![hole],
            aabb: Aabb3d::default(),
            cell_size: 1.0,
            cell_height: 1.0,
            width: 10,
            height: 10,
            border_size: 0,
            max_error: 1.0,
        };
        assert_eq!(
            cset.merge_holes(RegionId::from(1)),
            Err(ContourError::MissingOutline {
                region: RegionId::from(1)
            })
        );
    }
}
