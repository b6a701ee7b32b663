//! Merging and filtering of the raw regions produced by the partitioners.

use thiserror::Error;

use crate::{CompactHeightfield, RegionId, span::AreaType};

/// Bookkeeping for one region while merging.
#[derive(Debug, Clone)]
struct Region {
    /// Number of spans belonging to this region
    span_count: usize,
    /// The id this region is remapped to
    id: RegionId,
    area: AreaType,
    remap: bool,
    visited: bool,
    overlap: bool,
    connects_to_border: bool,
    y_min: u16,
    y_max: u16,
    /// Neighboring regions in the order they appear along the region's outline
    connections: Vec<RegionId>,
    /// Regions stacked above or below this one
    floors: Vec<RegionId>,
}

impl Region {
    fn new(id: usize) -> Self {
        Self {
            span_count: 0,
            id: RegionId::from(id as u16),
            area: AreaType::NOT_WALKABLE,
            remap: false,
            visited: false,
            overlap: false,
            connects_to_border: false,
            y_min: u16::MAX,
            y_max: 0,
            connections: Vec::new(),
            floors: Vec::new(),
        }
    }

    fn is_mergeable_id(&self) -> bool {
        self.id != RegionId::NONE && !self.id.is_border()
    }

    fn add_unique_floor_region(&mut self, region: RegionId) {
        if !self.floors.contains(&region) {
            self.floors.push(region);
        }
    }

    fn add_unique_connection(&mut self, region: RegionId) {
        if !self.connections.contains(&region) {
            self.connections.push(region);
        }
    }

    fn remove_adjacent_neighbors(&mut self) {
        // Remove adjacent duplicates.
        let mut i = 0;
        while i < self.connections.len() && self.connections.len() > 1 {
            let ni = (i + 1) % self.connections.len();
            if self.connections[i] == self.connections[ni] {
                self.connections.remove(i);
            } else {
                i += 1;
            }
        }
    }

    fn replace_neighbor(&mut self, old_id: RegionId, new_id: RegionId) {
        let mut neighbor_changed = false;
        for connection in &mut self.connections {
            if *connection == old_id {
                *connection = new_id;
                neighbor_changed = true;
            }
        }
        for floor in &mut self.floors {
            if *floor == old_id {
                *floor = new_id;
            }
        }
        if neighbor_changed {
            self.remove_adjacent_neighbors();
        }
    }

    fn can_merge_with(&self, other: &Region) -> bool {
        if self.area != other.area {
            return false;
        }
        let shared_boundaries = self
            .connections
            .iter()
            .filter(|connection| **connection == other.id)
            .count();
        if shared_boundaries > 1 {
            return false;
        }
        !self.floors.contains(&other.id)
    }

    fn is_connected_to_border(&self) -> bool {
        // Null id indicates border.
        self.connections.contains(&RegionId::NONE)
    }
}

/// Merges region `b` into region `a` by splicing their outlines together at their shared boundary.
/// Returns `false` if the regions do not share a boundary.
fn merge_regions(regions: &mut [Region], a: usize, b: usize) -> bool {
    let a_id = regions[a].id;
    let b_id = regions[b].id;

    // Duplicate current neighbourhood.
    let a_connections = regions[a].connections.clone();
    let b_connections = regions[b].connections.clone();

    // Find insertion point on A.
    let Some(insert_a) = a_connections.iter().position(|c| *c == b_id) else {
        return false;
    };
    // Find insertion point on B.
    let Some(insert_b) = b_connections.iter().position(|c| *c == a_id) else {
        return false;
    };

    // Merge neighbours.
    let mut connections = Vec::with_capacity(a_connections.len() + b_connections.len());
    let n = a_connections.len();
    for i in 0..n - 1 {
        connections.push(a_connections[(insert_a + 1 + i) % n]);
    }
    let n = b_connections.len();
    for i in 0..n - 1 {
        connections.push(b_connections[(insert_b + 1 + i) % n]);
    }

    let b_floors = std::mem::take(&mut regions[b].floors);
    let b_span_count = regions[b].span_count;
    regions[b].span_count = 0;
    regions[b].connections.clear();

    let region_a = &mut regions[a];
    region_a.connections = connections;
    region_a.remove_adjacent_neighbors();
    for floor in b_floors {
        region_a.add_unique_floor_region(floor);
    }
    region_a.span_count += b_span_count;
    true
}

impl CompactHeightfield {
    /// Returns whether the span has no neighbor in the given direction that belongs to the same region.
    fn is_solid_edge(&self, src_reg: &[RegionId], x: i32, z: i32, i: usize, dir: u8) -> bool {
        let neighbor_region = self
            .neighbor(x, z, i, dir)
            .map_or(RegionId::NONE, |(_, _, a_index)| src_reg[a_index]);
        neighbor_region != src_reg[i]
    }

    /// Walks along the outline of a region, starting at the solid edge `dir` of span `i`,
    /// and collects the neighboring regions in order.
    fn walk_region_contour(
        &self,
        mut x: i32,
        mut z: i32,
        mut i: usize,
        mut dir: u8,
        src_reg: &[RegionId],
    ) -> Vec<RegionId> {
        let start_dir = dir;
        let start_index = i;
        let mut current_region = self
            .neighbor(x, z, i, dir)
            .map_or(RegionId::NONE, |(_, _, a_index)| src_reg[a_index]);
        let mut contour = vec![current_region];

        let mut iter = 0;
        loop {
            iter += 1;
            if iter >= 40_000 {
                break;
            }
            if self.is_solid_edge(src_reg, x, z, i, dir) {
                // Choose the edge corner
                let region = self
                    .neighbor(x, z, i, dir)
                    .map_or(RegionId::NONE, |(_, _, a_index)| src_reg[a_index]);
                if region != current_region {
                    current_region = region;
                    contour.push(current_region);
                }
                // Rotate CW
                dir = (dir + 1) & 0x3;
            } else {
                let Some((nx, nz, ni)) = self.neighbor(x, z, i, dir) else {
                    // Should not happen.
                    return contour;
                };
                x = nx;
                z = nz;
                i = ni;
                // Rotate CCW
                dir = (dir + 3) & 0x3;
            }
            if start_index == i && start_dir == dir {
                break;
            }
        }

        // Remove adjacent duplicates.
        if contour.len() > 1 {
            let mut j = 0;
            while j < contour.len() {
                let nj = (j + 1) % contour.len();
                if contour[j] == contour[nj] {
                    contour.remove(j);
                } else {
                    j += 1;
                }
            }
        }
        contour
    }

    /// Removes regions smaller than `min_region_area` that do not touch a border region,
    /// merges regions smaller than `merge_region_area` into their smallest neighbor and compacts the ids.
    ///
    /// Returns the new maximum region id and the regions that were found to overlap themselves.
    pub(crate) fn merge_and_filter_regions(
        &self,
        min_region_area: usize,
        merge_region_area: usize,
        max_region_id: RegionId,
        src_reg: &mut [RegionId],
    ) -> (RegionId, Vec<RegionId>) {
        let region_count = max_region_id.bits() as usize + 1;
        let mut regions: Vec<Region> = (0..region_count).map(Region::new).collect();

        // Find edge of a region and find connections around the contour.
        for z in 0..self.height {
            for x in 0..self.width {
                let cell = self.cell_at(x, z);
                for i in cell.index_range() {
                    let r = src_reg[i];
                    let r_index = r.bits() as usize;
                    if r == RegionId::NONE || r_index >= region_count {
                        continue;
                    }
                    regions[r_index].span_count += 1;

                    // Update floors.
                    for j in cell.index_range() {
                        if i == j {
                            continue;
                        }
                        let floor = src_reg[j];
                        if floor == RegionId::NONE || floor.bits() as usize >= region_count {
                            continue;
                        }
                        if floor == r {
                            regions[r_index].overlap = true;
                        }
                        regions[r_index].add_unique_floor_region(floor);
                    }

                    // Have found contour
                    if !regions[r_index].connections.is_empty() {
                        continue;
                    }
                    regions[r_index].area = self.areas[i];

                    // Check if this cell is next to a border.
                    let solid_dir = (0..4)
                        .find(|dir| self.is_solid_edge(src_reg, x as i32, z as i32, i, *dir));
                    if let Some(dir) = solid_dir {
                        // The cell is at border.
                        // Walk around the contour to find all the neighbours.
                        regions[r_index].connections =
                            self.walk_region_contour(x as i32, z as i32, i, dir, src_reg);
                    }
                }
            }
        }

        // Remove too small regions.
        let mut stack = Vec::with_capacity(32);
        let mut trace = Vec::with_capacity(32);
        for i in 0..region_count {
            let region = &regions[i];
            if !region.is_mergeable_id() || region.span_count == 0 || region.visited {
                continue;
            }

            // Count the total size of all the connected regions.
            // Also keep track of the regions connects to a tile border.
            let mut connects_to_border = false;
            let mut span_count = 0;
            stack.clear();
            trace.clear();

            regions[i].visited = true;
            stack.push(i);
            while let Some(ri) = stack.pop() {
                span_count += regions[ri].span_count;
                trace.push(ri);
                for j in 0..regions[ri].connections.len() {
                    let connection = regions[ri].connections[j];
                    if connection.is_border() {
                        connects_to_border = true;
                        continue;
                    }
                    let neighbor = &mut regions[connection.bits() as usize];
                    if neighbor.visited || !neighbor.is_mergeable_id() {
                        continue;
                    }
                    // Visit
                    neighbor.visited = true;
                    stack.push(neighbor.id.bits() as usize);
                }
            }

            // If the accumulated regions size is too small, remove it.
            // Do not remove areas which connect to tile borders
            // as their size cannot be estimated correctly and removing them
            // can potentially remove necessary areas.
            if span_count < min_region_area && !connects_to_border {
                // Kill all visited regions.
                for &j in &trace {
                    regions[j].span_count = 0;
                    regions[j].id = RegionId::NONE;
                }
            }
        }

        // Merge too small regions to neighbour regions.
        loop {
            let mut merge_count = 0;
            for i in 0..region_count {
                let region = &regions[i];
                if !region.is_mergeable_id() || region.overlap || region.span_count == 0 {
                    continue;
                }

                // Check to see if the region should be merged.
                if region.span_count > merge_region_area && region.is_connected_to_border() {
                    continue;
                }

                // Small region with more than 1 connection.
                // Or region which is not connected to a border at all.
                // Find smallest neighbour region that connects to this one.
                let mut smallest = usize::MAX;
                let mut merge_id = region.id;
                for connection in &region.connections {
                    if connection.is_border() {
                        continue;
                    }
                    let other = &regions[connection.bits() as usize];
                    if !other.is_mergeable_id() || other.overlap {
                        continue;
                    }
                    if other.span_count < smallest
                        && region.can_merge_with(other)
                        && other.can_merge_with(region)
                    {
                        smallest = other.span_count;
                        merge_id = other.id;
                    }
                }

                // Found new id.
                if merge_id != region.id {
                    let old_id = region.id;
                    // Merge neighbours.
                    if merge_regions(&mut regions, merge_id.bits() as usize, i) {
                        // Fixup regions pointing to current region.
                        for region in regions.iter_mut() {
                            if !region.is_mergeable_id() {
                                continue;
                            }
                            // If another region was already merged into current region
                            // change the nid of the previous region too.
                            if region.id == old_id {
                                region.id = merge_id;
                            }
                            // Replace the current region with the new one if the
                            // current regions is neighbour.
                            region.replace_neighbor(old_id, merge_id);
                        }
                        merge_count += 1;
                    }
                }
            }
            if merge_count == 0 {
                break;
            }
        }

        let max_region_id = compress_region_ids(&mut regions);
        remap_regions(&regions, src_reg);

        // Return regions that we found to be overlapping.
        let overlaps = regions
            .iter()
            .filter(|region| region.overlap)
            .map(|region| region.id)
            .collect();
        (max_region_id, overlaps)
    }

    /// Merges the monotone regions produced by layer partitioning into non-overlapping layers
    /// and removes layers smaller than `min_region_area` that do not touch a border region.
    ///
    /// Returns the new maximum region id.
    pub(crate) fn merge_and_filter_layer_regions(
        &self,
        min_region_area: usize,
        max_region_id: RegionId,
        src_reg: &mut [RegionId],
    ) -> RegionId {
        let region_count = max_region_id.bits() as usize + 1;
        let mut regions: Vec<Region> = (0..region_count).map(Region::new).collect();

        // Find region neighbours and overlapping regions.
        let mut layer_regions = Vec::with_capacity(32);
        for z in 0..self.height {
            for x in 0..self.width {
                layer_regions.clear();
                for i in self.cell_at(x, z).index_range() {
                    let span = &self.spans[i];
                    let ri = src_reg[i];
                    if ri == RegionId::NONE || ri.bits() as usize >= region_count {
                        continue;
                    }
                    let region = &mut regions[ri.bits() as usize];
                    region.span_count += 1;
                    region.area = self.areas[i];
                    region.y_min = region.y_min.min(span.y);
                    region.y_max = region.y_max.max(span.y);

                    // Collect all region layers.
                    layer_regions.push(ri);

                    // Update neighbours
                    for dir in 0..4 {
                        let Some((_, _, a_index)) = self.neighbor(x as i32, z as i32, i, dir)
                        else {
                            continue;
                        };
                        let neighbor_region = src_reg[a_index];
                        if neighbor_region != RegionId::NONE
                            && (neighbor_region.bits() as usize) < region_count
                            && neighbor_region != ri
                        {
                            regions[ri.bits() as usize].add_unique_connection(neighbor_region);
                        }
                        if neighbor_region.is_border() {
                            regions[ri.bits() as usize].connects_to_border = true;
                        }
                    }
                }

                // Update overlapping regions.
                for i in 0..layer_regions.len() {
                    for j in i + 1..layer_regions.len() {
                        let (ri, rj) = (layer_regions[i], layer_regions[j]);
                        if ri != rj {
                            regions[ri.bits() as usize].add_unique_floor_region(rj);
                            regions[rj.bits() as usize].add_unique_floor_region(ri);
                        }
                    }
                }
            }
        }

        // Create 2D layers from regions.
        let mut layer_id = RegionId::from(1);
        for region in regions.iter_mut() {
            region.id = RegionId::NONE;
        }

        // Merge montone regions to create non-overlapping areas.
        let mut queue = std::collections::VecDeque::with_capacity(32);
        for i in 1..region_count {
            // Skip already visited.
            if regions[i].id != RegionId::NONE {
                continue;
            }

            // Start search.
            regions[i].id = layer_id;
            queue.clear();
            queue.push_back(i);

            while let Some(current) = queue.pop_front() {
                for j in 0..regions[current].connections.len() {
                    let neighbor = regions[current].connections[j];
                    let neighbor_index = neighbor.bits() as usize;
                    // Skip already visited.
                    if regions[neighbor_index].id != RegionId::NONE {
                        continue;
                    }
                    // Skip if different area type, do not connect regions with different area type.
                    if regions[current].area != regions[neighbor_index].area {
                        continue;
                    }
                    // Skip if the neighbour is overlapping root region.
                    if regions[i].floors.contains(&neighbor) {
                        continue;
                    }

                    // Deepen
                    queue.push_back(neighbor_index);

                    // Mark layer id
                    regions[neighbor_index].id = layer_id;
                    // Merge current layers to root.
                    let floors = std::mem::take(&mut regions[neighbor_index].floors);
                    let span_count = std::mem::take(&mut regions[neighbor_index].span_count);
                    let (y_min, y_max, connects_to_border) = {
                        let neighbor = &regions[neighbor_index];
                        (neighbor.y_min, neighbor.y_max, neighbor.connects_to_border)
                    };
                    let root = &mut regions[i];
                    for floor in &floors {
                        root.add_unique_floor_region(*floor);
                    }
                    root.y_min = root.y_min.min(y_min);
                    root.y_max = root.y_max.max(y_max);
                    root.span_count += span_count;
                    root.connects_to_border |= connects_to_border;
                    regions[neighbor_index].floors = floors;
                }
            }
            layer_id = layer_id.next();
        }

        // Remove small regions
        for i in 0..region_count {
            let region = &regions[i];
            if region.span_count > 0
                && region.span_count < min_region_area
                && !region.connects_to_border
            {
                let removed = region.id;
                for region in regions.iter_mut() {
                    if region.id == removed {
                        region.id = RegionId::NONE;
                    }
                }
            }
        }

        let max_region_id = compress_region_ids(&mut regions);
        remap_regions(&regions, src_reg);
        max_region_id
    }
}

/// Compacts the ids of all non-border regions to `1..=n` and returns `n`.
fn compress_region_ids(regions: &mut [Region]) -> RegionId {
    for region in regions.iter_mut() {
        region.remap = region.is_mergeable_id();
    }
    let mut id_gen = RegionId::NONE;
    for i in 0..regions.len() {
        if !regions[i].remap {
            continue;
        }
        let old_id = regions[i].id;
        id_gen = id_gen.next();
        for region in regions[i..].iter_mut() {
            if region.id == old_id {
                region.id = id_gen;
                region.remap = false;
            }
        }
    }
    id_gen
}

fn remap_regions(regions: &[Region], src_reg: &mut [RegionId]) {
    for region in src_reg.iter_mut() {
        if !region.is_border() {
            *region = regions[region.bits() as usize].id;
        }
    }
}

/// Errors that can occur while partitioning a [`CompactHeightfield`] into regions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegionError {
    /// More regions were created than a [`RegionId`] can hold.
    #[error("Region id overflow, more than {} regions were created", RegionId::MAX.bits())]
    TooManyRegions,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(id: u16, connections: &[u16]) -> Region {
        let mut region = Region::new(id as usize);
        region.connections = connections.iter().map(|c| RegionId::from(*c)).collect();
        region.span_count = 1;
        region
    }

    #[test]
    fn merge_splices_outlines() {
        // Region 1 is surrounded by 0 and 2, region 2 by 1, 0 and 3.
        let mut regions = vec![
            Region::new(0),
            region(1, &[0, 2]),
            region(2, &[1, 0, 3]),
            region(3, &[2]),
        ];
        assert!(merge_regions(&mut regions, 1, 2));
        let connections: Vec<_> = regions[1].connections.iter().map(|c| c.bits()).collect();
        assert_eq!(connections, vec![0, 3]);
        assert_eq!(regions[1].span_count, 2);
        assert_eq!(regions[2].span_count, 0);
    }

    #[test]
    fn regions_without_shared_boundary_do_not_merge() {
        let mut regions = vec![Region::new(0), region(1, &[0]), region(2, &[0])];
        assert!(!merge_regions(&mut regions, 1, 2));
    }

    #[test]
    fn compress_assigns_consecutive_ids() {
        let mut regions = vec![Region::new(0), region(1, &[]), region(2, &[]), region(3, &[])];
        regions[2].id = RegionId::NONE;
        regions[3].id = RegionId::from(1);
        assert_eq!(compress_region_ids(&mut regions), RegionId::from(1));
        assert_eq!(regions[1].id, RegionId::from(1));
        assert_eq!(regions[3].id, RegionId::from(1));
    }
}
