//! The [`CompactHeightfield`] holds the open space above the walkable spans of a [`Heightfield`],
//! linked to their neighbors in the four cardinal directions.

use thiserror::Error;

use crate::{
    Aabb3d,
    compact_cell::CompactCell,
    compact_span::CompactSpan,
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    region::RegionId,
    span::{AreaType, Span},
};

/// A packed representation of a [`Heightfield`].
/// Only walkable spans are kept, each describing the open space above it.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
pub struct CompactHeightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The walkable height used during the build of the field
    pub walkable_height: u16,
    /// The walkable climb used during the build of the field.
    pub walkable_climb: u16,
    /// The AABB border size used during the build of the field.
    pub border_size: u16,
    /// The maximum distance value of any span within the field.
    pub max_distance: u16,
    /// The maximum region id of any span within the field.
    pub max_region: RegionId,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The cells in the heightfield [Size: `width * height`]
    pub cells: Vec<CompactCell>,
    /// All walkable spans in the heightfield
    pub spans: Vec<CompactSpan>,
    /// Vector containing border distance data. [Size: `spans.len()`]
    /// Empty until [`CompactHeightfield::build_distance_field`] ran.
    pub dist: Vec<u16>,
    /// Vector containing area type data. [Size: `spans.len()`]
    pub areas: Vec<AreaType>,
}

impl Heightfield {
    /// Builds a compact heightfield from this heightfield.
    /// See [`CompactHeightfield::from_heightfield`].
    pub fn into_compact(
        self,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<CompactHeightfield, CompactHeightfieldError> {
        CompactHeightfield::from_heightfield(self, walkable_height, walkable_climb)
    }
}

impl CompactHeightfield {
    /// The largest relative index a neighbor span can have inside its column.
    const MAX_LAYERS: u8 = CompactSpan::NOT_CONNECTED - 1;

    /// Builds a compact heightfield from a heightfield.
    ///
    /// Two neighboring spans are connected if the open space they share is at least `walkable_height` high
    /// and their floors are at most `walkable_climb` apart.
    ///
    /// # Errors
    ///
    /// Returns an error if the heightfield has too many layers.
    pub fn from_heightfield(
        heightfield: Heightfield,
        walkable_height: u16,
        walkable_climb: u16,
    ) -> Result<Self, CompactHeightfieldError> {
        let walkable_span_count = heightfield.walkable_span_count();
        let mut compact_heightfield = Self {
            width: heightfield.width,
            height: heightfield.height,
            walkable_height,
            walkable_climb,
            border_size: 0,
            aabb: heightfield.aabb,
            max_distance: 0,
            max_region: RegionId::NONE,
            cell_size: heightfield.cell_size,
            cell_height: heightfield.cell_height,
            cells: vec![
                CompactCell::default();
                heightfield.width as usize * heightfield.height as usize
            ],
            spans: vec![CompactSpan::default(); walkable_span_count],
            dist: Vec::new(),
            areas: vec![AreaType::NOT_WALKABLE; walkable_span_count],
        };
        compact_heightfield.aabb.max.y += walkable_height as f32 * heightfield.cell_height;

        let mut span_index = 0_usize;
        // Fill in cells and spans.
        for z in 0..heightfield.height {
            for x in 0..heightfield.width {
                let column_index = heightfield.column_index(x, z);
                let cell = &mut compact_heightfield.cells[column_index];
                cell.set_index(span_index as u32);
                for span in heightfield.column_spans(x, z) {
                    if !span.area().is_walkable() {
                        continue;
                    }
                    if cell.count() == u8::MAX {
                        return Err(CompactHeightfieldError::TooManySpansInColumn { x, z });
                    }
                    let bot = span.max();
                    let top = span
                        .next()
                        .map_or(Span::MAX_HEIGHT, |next| heightfield.span(next).min());
                    let compact_span = &mut compact_heightfield.spans[span_index];
                    compact_span.y = bot;
                    compact_span.set_height(top.saturating_sub(bot).min(u8::MAX.into()) as u8);
                    compact_heightfield.areas[span_index] = span.area();
                    span_index += 1;
                    cell.inc_count();
                }
            }
        }

        // Find neighbour connections.
        let mut max_layer_index = 0_usize;
        for z in 0..compact_heightfield.height {
            for x in 0..compact_heightfield.width {
                let cell = *compact_heightfield.cell_at(x, z);
                for i in cell.index_range() {
                    let span = compact_heightfield.spans[i].clone();
                    for dir in 0..4_u8 {
                        compact_heightfield.spans[i].set_con(dir, None);
                        let neighbor_x = x as i32 + dir_offset_x(dir) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(dir) as i32;
                        // First check that the neighbour cell is in bounds.
                        if !heightfield.contains(neighbor_x, neighbor_z) {
                            continue;
                        }

                        // Iterate over all neighbour spans and check if any of them is
                        // accessible from the current cell.
                        let neighbor_cell =
                            *compact_heightfield.cell_at(neighbor_x as u16, neighbor_z as u16);
                        for k in neighbor_cell.index_range() {
                            let neighbor_span = &compact_heightfield.spans[k];
                            let bot = span.y.max(neighbor_span.y) as i32;
                            let top = (span.y as i32 + span.height() as i32)
                                .min(neighbor_span.y as i32 + neighbor_span.height() as i32);

                            // Check that the gap between the spans is walkable,
                            // and that the climb height between the gaps is not too high.
                            let is_walkable = top - bot >= walkable_height as i32;
                            let is_climbable = (neighbor_span.y as i32 - span.y as i32).abs()
                                <= walkable_climb as i32;
                            if !is_walkable || !is_climbable {
                                continue;
                            }
                            // Mark direction as walkable.
                            let layer_index = k - neighbor_cell.index() as usize;
                            if layer_index > Self::MAX_LAYERS as usize {
                                max_layer_index = max_layer_index.max(layer_index);
                                continue;
                            }
                            compact_heightfield.spans[i].set_con(dir, Some(layer_index as u8));
                            break;
                        }
                    }
                }
            }
        }
        if max_layer_index > Self::MAX_LAYERS as usize {
            return Err(CompactHeightfieldError::TooManyLayers {
                max_layer_index: Self::MAX_LAYERS,
                layer_index: max_layer_index,
            });
        }
        Ok(compact_heightfield)
    }

    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    /// Returns the cell at the given coordinates. Returns `None` if the coordinates are invalid.
    #[inline]
    pub fn get_cell_at(&self, x: u16, z: u16) -> Option<&CompactCell> {
        if x >= self.width || z >= self.height {
            return None;
        }
        self.cells.get(self.column_index(x, z))
    }

    /// Returns the cell at the given coordinates. Panics if the coordinates are invalid.
    #[inline]
    pub fn cell_at(&self, x: u16, z: u16) -> &CompactCell {
        &self.cells[self.column_index(x, z)]
    }

    /// Returns the index of the span connected to `span` in the given direction.
    /// `x` and `z` are the coordinates of the column `span` lives in.
    ///
    /// The caller must make sure the span is connected in that direction, see [`CompactSpan::con`].
    #[inline]
    pub(crate) fn con_index(&self, x: i32, z: i32, direction: u8, con: u8) -> usize {
        let neighbor_x = x + dir_offset_x(direction) as i32;
        let neighbor_z = z + dir_offset_z(direction) as i32;
        self.cells[neighbor_x as usize + neighbor_z as usize * self.width as usize].index() as usize
            + con as usize
    }

    /// Returns the column and index of the span connected to the span at `index` in the given direction.
    #[inline]
    pub(crate) fn neighbor(&self, x: i32, z: i32, index: usize, direction: u8) -> Option<(i32, i32, usize)> {
        let con = self.spans[index].con(direction)?;
        Some((
            x + dir_offset_x(direction) as i32,
            z + dir_offset_z(direction) as i32,
            self.con_index(x, z, direction, con),
        ))
    }

    /// Iterates over all spans, yielding their column coordinates and index.
    pub fn iter_spans(&self) -> impl Iterator<Item = (u16, u16, usize)> + '_ {
        (0..self.height).flat_map(move |z| {
            (0..self.width).flat_map(move |x| {
                self.cell_at(x, z)
                    .index_range()
                    .map(move |index| (x, z, index))
            })
        })
    }
}

/// Errors that can occur when building a compact heightfield.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactHeightfieldError {
    /// The heightfield has too many layers.
    #[error(
        "Heightfield has too many layers. Max layer index is {max_layer_index}, but got {layer_index}"
    )]
    TooManyLayers {
        /// The maximum layer index.
        max_layer_index: u8,
        /// The layer index that caused the error.
        layer_index: usize,
    },
    /// A single column holds more walkable spans than a cell can address.
    #[error("Column at x={x}, z={z} has more than 255 walkable spans")]
    TooManySpansInColumn {
        /// The x-coordinate of the column
        x: u16,
        /// The z-coordinate of the column
        z: u16,
    },
}
