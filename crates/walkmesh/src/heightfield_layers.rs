//! Partitioning of a [`CompactHeightfield`] into stacked 2.5D layers.
//!
//! Layers are an alternative to polygon meshes for tiled navmeshes with many overlapping floors:
//! every layer is a single heightmap without overlap that can be turned into a mesh at runtime.

use thiserror::Error;

use crate::{Aabb3d, CompactHeightfield, span::AreaType};

/// The maximum number of regions a single layer set can be built from.
const MAX_REGIONS: usize = 255;
/// The maximum number of regions a single region can overlap with.
const MAX_LAYERS: usize = 63;
/// The maximum number of neighbors tracked per region.
const MAX_NEIGHBORS: usize = 16;
/// The maximum depth of the region stack while growing a layer.
const MAX_STACK: usize = 64;

/// A set of [`HeightfieldLayer`]s built from the same compact heightfield.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HeightfieldLayerSet {
    /// The layers in the set
    pub layers: Vec<HeightfieldLayer>,
}

/// A single 2.5D layer of walkable area.
/// No two walkable cells of a layer are stacked on top of each other.
#[derive(Debug, Default, Clone, PartialEq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct HeightfieldLayer {
    /// The bounds in world space. The y-range is restricted to the heights found in the layer.
    pub aabb: Aabb3d,
    /// The size of each cell. (On the xz-plane.)
    pub cell_size: f32,
    /// The height of each cell. (The minimum increment along the y-axis.)
    pub cell_height: f32,
    /// The width of the heightfield. (Along the x-axis in cell units.)
    pub width: u16,
    /// The height of the heightfield. (Along the z-axis in cell units.)
    pub height: u16,
    /// The minimum x-bounds of usable data.
    pub min_x: u16,
    /// The maximum x-bounds of usable data.
    pub max_x: u16,
    /// The minimum z-bounds of usable data. (Along the z-axis.)
    pub min_z: u16,
    /// The maximum z-bounds of usable data. (Along the z-axis.)
    pub max_z: u16,
    /// The minimum height bounds of usable data. (Along the y-axis.)
    pub min_height: u16,
    /// The maximum height bounds of usable data. (Along the y-axis.)
    pub max_height: u16,
    /// The heightfield, relative to [`HeightfieldLayer::min_height`]. 0xff marks cells without data. [Size: width * height]
    pub heights: Vec<u8>,
    /// Area ids. [Size: Same as [`HeightfieldLayer::heights`]]
    pub areas: Vec<AreaType>,
    /// Packed neighbor connection information. [Size: Same as [`HeightfieldLayer::heights`]]
    ///
    /// The low nibble holds one bit per direction for neighbors in the same layer,
    /// the high nibble one bit per direction for portals into another layer.
    pub connections: Vec<u8>,
}

impl HeightfieldLayer {
    /// Height value of cells without walkable data.
    pub const NO_HEIGHT: u8 = 0xff;

    /// Returns whether the cell at `(x, z)` connects to its neighbor in `direction` within this layer.
    #[inline]
    pub fn is_connected(&self, x: u16, z: u16, direction: u8) -> bool {
        self.connections[x as usize + z as usize * self.width as usize] & (1 << direction) != 0
    }

    /// Returns whether the cell at `(x, z)` leads into a different layer in `direction`.
    #[inline]
    pub fn is_portal(&self, x: u16, z: u16, direction: u8) -> bool {
        self.connections[x as usize + z as usize * self.width as usize] & (1 << (direction + 4))
            != 0
    }
}

#[derive(Debug, Clone, Default)]
struct LayerRegion {
    /// Regions stacked above or below this one
    layers: Vec<usize>,
    neighbors: Vec<usize>,
    y_min: u16,
    y_max: u16,
    layer_id: Option<usize>,
    /// Whether the region is the base of merged regions.
    base: bool,
}

#[derive(Debug, Clone, Copy, Default)]
struct LayerSweepSpan {
    samples: u16,
    neighbor: Option<usize>,
    id: usize,
}

/// Adds `value` to `values` unless it is already contained.
/// Returns `false` if the value is missing and there is no room left.
fn add_unique(values: &mut Vec<usize>, max: usize, value: usize) -> bool {
    if values.contains(&value) {
        return true;
    }
    if values.len() >= max {
        return false;
    }
    values.push(value);
    true
}

#[inline]
fn overlap_range(a_min: u16, a_max: u16, b_min: u16, b_max: u16) -> bool {
    !(a_min > b_max || a_max < b_min)
}

impl CompactHeightfield {
    /// Builds a layer set from the compact heightfield.
    ///
    /// - `border_size`: The size of the non-navigable border around the heightfield. [Limits: >=0] [Units: vx]
    /// - `walkable_height`: Minimum floor to 'ceiling' height that will still allow the floor area
    ///   to be considered walkable. Regions closer than four times this height are merged into one layer. [Limits: >= 3] [Units: vx]
    pub fn build_heightfield_layers(
        &self,
        border_size: u16,
        walkable_height: u16,
    ) -> Result<HeightfieldLayerSet, HeightfieldLayerError> {
        let _span = tracing::trace_span!("build_heightfield_layers").entered();

        let mut src_reg: Vec<Option<usize>> = vec![None; self.spans.len()];
        let region_count = self.sweep_layer_regions(border_size, &mut src_reg)?;

        let mut regions = self.collect_layer_regions(region_count, &src_reg)?;
        grow_layers(&mut regions)?;
        merge_close_layers(&mut regions, walkable_height as u32 * 4)?;
        let layer_count = compact_layer_ids(&mut regions);

        // No layers, return empty.
        if layer_count == 0 {
            return Ok(HeightfieldLayerSet::default());
        }

        let layer_width = self.width.saturating_sub(border_size * 2);
        let layer_height = self.height.saturating_sub(border_size * 2);

        // Build contracted bbox for layers.
        let mut aabb = self.aabb;
        let pad = border_size as f32 * self.cell_size;
        aabb.min.x += pad;
        aabb.min.z += pad;
        aabb.max.x -= pad;
        aabb.max.z -= pad;

        let grid_size = layer_width as usize * layer_height as usize;
        let mut set = HeightfieldLayerSet {
            layers: Vec::with_capacity(layer_count),
        };

        // Store layers.
        for current in 0..layer_count {
            // Find layer height bounds.
            let (min_height, max_height) = regions
                .iter()
                .filter(|region| region.base && region.layer_id == Some(current))
                .last()
                .map_or((0, 0), |region| (region.y_min, region.y_max));

            let mut layer = HeightfieldLayer {
                aabb,
                cell_size: self.cell_size,
                cell_height: self.cell_height,
                width: layer_width,
                height: layer_height,
                min_x: layer_width,
                max_x: 0,
                min_z: layer_height,
                max_z: 0,
                min_height,
                max_height,
                heights: vec![HeightfieldLayer::NO_HEIGHT; grid_size],
                areas: vec![AreaType::NOT_WALKABLE; grid_size],
                connections: vec![0; grid_size],
            };
            // Adjust the bbox to fit the heightfield.
            layer.aabb.min.y = aabb.min.y + min_height as f32 * self.cell_height;
            layer.aabb.max.y = aabb.min.y + max_height as f32 * self.cell_height;

            // Copy height and area from compact heightfield.
            for z in 0..layer_height {
                for x in 0..layer_width {
                    let cx = border_size + x;
                    let cz = border_size + z;
                    for j in self.cell_at(cx, cz).index_range() {
                        // Skip unassigned regions.
                        let Some(region) = src_reg[j] else {
                            continue;
                        };
                        // Skip of does not belong to current layer.
                        let layer_id = regions[region].layer_id;
                        if layer_id != Some(current) {
                            continue;
                        }

                        // Update data bounds.
                        layer.min_x = layer.min_x.min(x);
                        layer.max_x = layer.max_x.max(x);
                        layer.min_z = layer.min_z.min(z);
                        layer.max_z = layer.max_z.max(z);

                        // Store height and area type.
                        let idx = x as usize + z as usize * layer_width as usize;
                        let span = &self.spans[j];
                        layer.heights[idx] = span.y.saturating_sub(min_height).min(0xff) as u8;
                        layer.areas[idx] = self.areas[j];

                        // Check connection.
                        let mut portal = 0_u8;
                        let mut connection = 0_u8;
                        for dir in 0..4 {
                            let Some((ax, az, ai)) = self.neighbor(cx as i32, cz as i32, j, dir)
                            else {
                                continue;
                            };
                            if !self.areas[ai].is_walkable() {
                                continue;
                            }
                            let neighbor_layer = src_reg[ai].and_then(|r| regions[r].layer_id);
                            if layer_id != neighbor_layer {
                                // Portal mask
                                portal |= 1 << dir;
                                // Update height so that it matches on both sides of the portal.
                                let neighbor = &self.spans[ai];
                                if neighbor.y > min_height {
                                    let height = (neighbor.y - min_height).min(0xff) as u8;
                                    layer.heights[idx] = layer.heights[idx].max(height);
                                }
                            } else {
                                // Valid connection mask
                                let nx = ax - border_size as i32;
                                let nz = az - border_size as i32;
                                if nx >= 0
                                    && nz >= 0
                                    && nx < layer_width as i32
                                    && nz < layer_height as i32
                                {
                                    connection |= 1 << dir;
                                }
                            }
                        }
                        layer.connections[idx] = (portal << 4) | connection;
                    }
                }
            }

            if layer.min_x > layer.max_x {
                layer.min_x = 0;
                layer.max_x = 0;
            }
            if layer.min_z > layer.max_z {
                layer.min_z = 0;
                layer.max_z = 0;
            }
            set.layers.push(layer);
        }

        tracing::debug!(layers = set.layers.len(), "built heightfield layers");
        Ok(set)
    }

    /// Partitions the walkable area into monotone regions, storing them in `src_reg`.
    /// Returns the number of regions.
    fn sweep_layer_regions(
        &self,
        border_size: u16,
        src_reg: &mut [Option<usize>],
    ) -> Result<usize, HeightfieldLayerError> {
        let max_x = self.width.saturating_sub(border_size);
        let max_z = self.height.saturating_sub(border_size);
        let mut sweeps: Vec<LayerSweepSpan> = Vec::with_capacity(self.width as usize);
        let mut prev_count = [0_u16; MAX_REGIONS + 1];
        let mut region_id = 0;

        for z in border_size..max_z {
            prev_count[..region_id].fill(0);
            sweeps.clear();

            for x in border_size..max_x {
                for i in self.cell_at(x, z).index_range() {
                    if !self.areas[i].is_walkable() {
                        continue;
                    }
                    // -x
                    let sid = match self
                        .neighbor(x as i32, z as i32, i, 0)
                        .filter(|(_, _, ai)| self.areas[*ai].is_walkable())
                        .and_then(|(_, _, ai)| src_reg[ai])
                    {
                        Some(sid) => sid,
                        None => {
                            sweeps.push(LayerSweepSpan::default());
                            sweeps.len() - 1
                        }
                    };

                    // -z
                    if let Some(nr) = self
                        .neighbor(x as i32, z as i32, i, 3)
                        .and_then(|(_, _, ai)| src_reg[ai])
                    {
                        let sweep = &mut sweeps[sid];
                        // Set neighbour when first valid neighbour is encountered.
                        if sweep.samples == 0 {
                            sweep.neighbor = Some(nr);
                        }
                        if sweep.neighbor == Some(nr) {
                            // Update existing neighbour
                            sweep.samples += 1;
                            prev_count[nr] += 1;
                        } else {
                            // This is hit if there is more than one neighbour.
                            // Invalidate the neighbour.
                            sweep.neighbor = None;
                        }
                    }

                    src_reg[i] = Some(sid);
                }
            }

            // Create unique ID.
            for sweep in &mut sweeps {
                // If the neighbour is set and there is only one continuous connection to it,
                // the sweep will be merged with the previous one, else new region is created.
                match sweep.neighbor {
                    Some(neighbor) if prev_count[neighbor] == sweep.samples => {
                        sweep.id = neighbor;
                    }
                    _ => {
                        if region_id == MAX_REGIONS {
                            return Err(HeightfieldLayerError::TooManyRegions { max: MAX_REGIONS });
                        }
                        sweep.id = region_id;
                        region_id += 1;
                    }
                }
            }

            // Remap local sweep ids to region ids.
            for x in border_size..max_x {
                for i in self.cell_at(x, z).index_range() {
                    if let Some(sid) = src_reg[i] {
                        src_reg[i] = Some(sweeps[sid].id);
                    }
                }
            }
        }
        Ok(region_id)
    }

    /// Finds the neighbors, stacked regions, and height range of each region.
    fn collect_layer_regions(
        &self,
        region_count: usize,
        src_reg: &[Option<usize>],
    ) -> Result<Vec<LayerRegion>, HeightfieldLayerError> {
        let mut regions = vec![
            LayerRegion {
                y_min: u16::MAX,
                ..Default::default()
            };
            region_count
        ];

        let mut column_regions = Vec::with_capacity(MAX_LAYERS);
        for z in 0..self.height {
            for x in 0..self.width {
                column_regions.clear();
                for i in self.cell_at(x, z).index_range() {
                    let Some(ri) = src_reg[i] else {
                        continue;
                    };
                    let y = self.spans[i].y;
                    let region = &mut regions[ri];
                    region.y_min = region.y_min.min(y);
                    region.y_max = region.y_max.max(y);

                    // Collect all region layers.
                    if column_regions.len() < MAX_LAYERS {
                        column_regions.push(ri);
                    }

                    // Update neighbours
                    for dir in 0..4 {
                        let Some(rai) = self
                            .neighbor(x as i32, z as i32, i, dir)
                            .and_then(|(_, _, ai)| src_reg[ai])
                        else {
                            continue;
                        };
                        if rai != ri {
                            // A full neighbor list only causes a few more layers to be created.
                            add_unique(&mut regions[ri].neighbors, MAX_NEIGHBORS, rai);
                        }
                    }
                }

                // Update overlapping regions.
                for (i, &a) in column_regions.iter().enumerate() {
                    for &b in &column_regions[i + 1..] {
                        if a == b {
                            continue;
                        }
                        if !add_unique(&mut regions[a].layers, MAX_LAYERS, b)
                            || !add_unique(&mut regions[b].layers, MAX_LAYERS, a)
                        {
                            return Err(HeightfieldLayerError::LayerOverflow { max: MAX_LAYERS });
                        }
                    }
                }
            }
        }
        Ok(regions)
    }
}

/// Grows 2D layers from the regions by flooding into neighbors that are not stacked with the layer.
fn grow_layers(regions: &mut [LayerRegion]) -> Result<(), HeightfieldLayerError> {
    let mut layer_id = 0;
    let mut stack = std::collections::VecDeque::with_capacity(MAX_STACK);
    for i in 0..regions.len() {
        // Skip already visited.
        if regions[i].layer_id.is_some() {
            continue;
        }
        // Start search.
        regions[i].layer_id = Some(layer_id);
        regions[i].base = true;
        stack.clear();
        stack.push_back(i);

        while let Some(current) = stack.pop_front() {
            for n in 0..regions[current].neighbors.len() {
                let neighbor = regions[current].neighbors[n];
                let root = &regions[i];
                let candidate = &regions[neighbor];
                // Skip already visited.
                if candidate.layer_id.is_some() {
                    continue;
                }
                // Skip if the neighbour is overlapping root region.
                if root.layers.contains(&neighbor) {
                    continue;
                }
                // Skip if the height range would become too large.
                let y_min = root.y_min.min(candidate.y_min);
                let y_max = root.y_max.max(candidate.y_max);
                if y_max - y_min >= 255 {
                    continue;
                }
                if stack.len() >= MAX_STACK {
                    continue;
                }
                // Deepen
                stack.push_back(neighbor);
                // Mark layer id
                regions[neighbor].layer_id = Some(layer_id);
                // Merge current layers to root.
                let stacked = std::mem::take(&mut regions[neighbor].layers);
                for layer in &stacked {
                    if !add_unique(&mut regions[i].layers, MAX_LAYERS, *layer) {
                        return Err(HeightfieldLayerError::LayerOverflow { max: MAX_LAYERS });
                    }
                }
                regions[neighbor].layers = stacked;
                regions[i].y_min = y_min;
                regions[i].y_max = y_max;
            }
        }
        layer_id += 1;
    }
    Ok(())
}

/// Merges non-overlapping layers whose height ranges are within `merge_height` of each other.
fn merge_close_layers(
    regions: &mut [LayerRegion],
    merge_height: u32,
) -> Result<(), HeightfieldLayerError> {
    let expand = |y: u16| (y as u32 + merge_height).min(u16::MAX as u32) as u16;
    for i in 0..regions.len() {
        if !regions[i].base {
            continue;
        }
        let new_id = regions[i].layer_id;
        loop {
            let ri = &regions[i];
            // Find a layer to merge with.
            let old_id = regions.iter().enumerate().find_map(|(j, rj)| {
                if i == j || !rj.base {
                    return None;
                }
                // Skip if the regions are not close to each other.
                if !overlap_range(ri.y_min, expand(ri.y_max), rj.y_min, expand(rj.y_max)) {
                    return None;
                }
                // Skip if the height range would become too large.
                let y_min = ri.y_min.min(rj.y_min);
                let y_max = ri.y_max.max(rj.y_max);
                if y_max - y_min >= 255 {
                    return None;
                }
                // Make sure that there is no overlap when merging 'ri' and 'rj'.
                // Index to 'regions' is the same as region id.
                let overlap = regions
                    .iter()
                    .enumerate()
                    .any(|(k, rk)| rk.layer_id == rj.layer_id && ri.layers.contains(&k));
                if overlap {
                    return None;
                }
                // Can merge i and j.
                rj.layer_id
            });
            // Could not find anything to merge with, stop.
            let Some(old_id) = old_id else {
                break;
            };

            // Merge
            for j in 0..regions.len() {
                if regions[j].layer_id != Some(old_id) {
                    continue;
                }
                regions[j].base = false;
                // Remap layerIds.
                regions[j].layer_id = new_id;
                // Add overlaid layers from 'rj' to 'ri'.
                let stacked = std::mem::take(&mut regions[j].layers);
                for layer in &stacked {
                    if !add_unique(&mut regions[i].layers, MAX_LAYERS, *layer) {
                        return Err(HeightfieldLayerError::LayerOverflow { max: MAX_LAYERS });
                    }
                }
                regions[j].layers = stacked;
                // Update height bounds.
                regions[i].y_min = regions[i].y_min.min(regions[j].y_min);
                regions[i].y_max = regions[i].y_max.max(regions[j].y_max);
            }
        }
    }
    Ok(())
}

/// Remaps the layer ids to `0..n`, returning `n`.
fn compact_layer_ids(regions: &mut [LayerRegion]) -> usize {
    let mut remap = [None; MAX_REGIONS + 1];
    for region in regions.iter() {
        if let Some(id) = region.layer_id {
            remap[id] = Some(0);
        }
    }
    let mut layer_id = 0;
    for id in remap.iter_mut().flatten() {
        *id = layer_id;
        layer_id += 1;
    }
    for region in regions.iter_mut() {
        region.layer_id = region.layer_id.and_then(|id| remap[id]);
    }
    layer_id
}

/// Errors that can occur while building a [`HeightfieldLayerSet`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HeightfieldLayerError {
    /// The monotone partition created more regions than a layer set supports.
    #[error("Region id overflow: more than {max} regions")]
    TooManyRegions {
        /// The maximum number of regions
        max: usize,
    },
    /// Too many walkable platforms are stacked on top of each other.
    #[error("Layer overflow: a region overlaps more than {max} other regions")]
    LayerOverflow {
        /// The maximum number of stacked regions
        max: usize,
    },
}
