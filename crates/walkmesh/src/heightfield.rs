//! The heightfield module contains the types and functions for working with [`Heightfield`]s.
//!
//! A heightfield is a 3D grid of [`Span`]s, where each column contains 0, 1, or more spans.

use thiserror::Error;

use crate::{
    Aabb3d,
    span::{Span, SpanKey, Spans},
};

/// A dynamic heightfield representing obstructed space.
/// Build with [`HeightfieldBuilder`].
#[derive(Debug, Clone)]
pub struct Heightfield {
    /// The width of the heightfield along the x-axis in cell units
    pub width: u16,
    /// The height of the heightfield along the z-axis in cell units
    pub height: u16,
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
    /// The indices to the spans in the heightfield in width*height order
    /// Each index corresponds to a column in the heightfield by pointing to the lowest span in the column
    pub spans: Vec<Option<SpanKey>>,
    /// All spans in the heightfield
    pub allocated_spans: Spans,
}

impl Heightfield {
    /// Adds a span to the heightfield. If the new span overlaps existing spans,
    /// it will merge the new span with the existing ones.
    ///
    /// The resulting column stays sorted by height and free of overlaps.
    #[inline]
    pub fn add_span(&mut self, insertion: SpanInsertion) -> Result<(), SpanInsertionError> {
        if insertion.span.min() >= insertion.span.max() {
            return Err(SpanInsertionError::EmptySpan {
                min: insertion.span.min(),
                max: insertion.span.max(),
            });
        }
        if insertion.x >= self.width || insertion.z >= self.height {
            return Err(SpanInsertionError::ColumnIndexOutOfBounds {
                x: insertion.x,
                z: insertion.z,
            });
        }
        let column_index = self.column_index(insertion.x, insertion.z);

        let mut new_span = insertion.span;
        let mut previous_span_key = None;
        let mut current_span_key_iter = self.spans[column_index];
        // Insert the new span, possibly merging it with existing spans.
        while let Some(current_span_key) = current_span_key_iter {
            let current_span = self.span(current_span_key).clone();
            current_span_key_iter = current_span.next();
            if current_span.min() > new_span.max() {
                // Current span is completely above the new span, break.
                break;
            }
            if current_span.max() < new_span.min() {
                // Current span is completely below the new span. Keep going.
                previous_span_key = Some(current_span_key);
                continue;
            }
            // The new span overlaps with an existing span. Merge them.
            if current_span.min() < new_span.min() {
                new_span.set_min(current_span.min());
            }
            if current_span.max() > new_span.max() {
                new_span.set_max(current_span.max());
            }

            // Merge flags.
            if (new_span.max() as i32 - current_span.max() as i32).unsigned_abs()
                <= insertion.flag_merge_threshold as u32
            {
                // Higher area ID numbers indicate higher resolution priority.
                let area = new_span.area().max(current_span.area());
                new_span.set_area(area);
            }

            // Remove the current span since it's now merged with new_span.
            // Keep going because there might be other overlapping spans that also need to be merged.
            let next_key = current_span.next();
            self.allocated_spans.remove(current_span_key);
            if let Some(previous_span_key) = previous_span_key {
                self.span_mut(previous_span_key).set_next(next_key);
            } else {
                self.spans[column_index] = next_key;
            }
        }

        if let Some(previous_span_key) = previous_span_key {
            // Insert new span after prev
            new_span.set_next(self.span(previous_span_key).next());
            let new_span_key = self.allocated_spans.insert(new_span);
            self.span_mut(previous_span_key).set_next(new_span_key);
        } else {
            // This span should go before the others in the list
            let lowest_span_key = self.spans[column_index];
            new_span.set_next(lowest_span_key);
            let new_span_key = self.allocated_spans.insert(new_span);
            self.spans[column_index] = Some(new_span_key);
        }

        Ok(())
    }

    #[inline]
    pub(crate) fn column_index(&self, x: u16, z: u16) -> usize {
        x as usize + z as usize * self.width as usize
    }

    #[inline]
    pub(crate) fn contains(&self, x: i32, z: i32) -> bool {
        x >= 0 && x < self.width as i32 && z >= 0 && z < self.height as i32
    }

    /// Returns the key of the lowest span in the column at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_key_at(&self, x: u16, z: u16) -> Option<SpanKey> {
        if x >= self.width || z >= self.height {
            return None;
        }
        self.spans[self.column_index(x, z)]
    }

    /// Returns the span at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_at(&self, x: u16, z: u16) -> Option<&Span> {
        let span_key = self.span_key_at(x, z)?;
        Some(self.span(span_key))
    }

    /// Returns a mutable reference to the span at the given coordinates.
    /// `None` if either the index is out of bounds or there is no span in the column.
    #[inline]
    pub fn span_at_mut(&mut self, x: u16, z: u16) -> Option<&mut Span> {
        let span_key = self.span_key_at(x, z)?;
        Some(self.span_mut(span_key))
    }

    /// Returns a reference to the span with the given key.
    /// # Panics
    /// Panics if the key is not found.
    #[inline]
    pub fn span(&self, key: SpanKey) -> &Span {
        &self.allocated_spans[key]
    }

    /// Returns a mutable reference to the span with the given key.
    /// # Panics
    /// Panics if the key is not found.
    #[inline]
    pub fn span_mut(&mut self, key: SpanKey) -> &mut Span {
        &mut self.allocated_spans[key]
    }

    /// Iterates over the keys of the spans in the column at the given coordinates, from bottom to top.
    pub fn column_span_keys(&self, x: u16, z: u16) -> impl Iterator<Item = SpanKey> + '_ {
        let mut current = self.span_key_at(x, z);
        std::iter::from_fn(move || {
            let key = current?;
            current = self.span(key).next();
            Some(key)
        })
    }

    /// Iterates over the spans in the column at the given coordinates, from bottom to top.
    pub fn column_spans(&self, x: u16, z: u16) -> impl Iterator<Item = &Span> + '_ {
        self.column_span_keys(x, z).map(|key| self.span(key))
    }

    /// Returns the number of walkable spans in the heightfield.
    pub fn walkable_span_count(&self) -> usize {
        self.allocated_spans
            .values()
            .filter(|span| span.area().is_walkable())
            .count()
    }
}

/// A builder for [`Heightfield`]s.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightfieldBuilder {
    /// The AABB of the heightfield
    pub aabb: Aabb3d,
    /// The size of each cell on the xz-plane
    pub cell_size: f32,
    /// The size of each cell along the y-axis
    pub cell_height: f32,
}

impl HeightfieldBuilder {
    /// Builds the heightfield.
    pub fn build(self) -> Result<Heightfield, HeightfieldBuilderError> {
        if !(self.cell_size > 0.0) || !(self.cell_height > 0.0) {
            return Err(HeightfieldBuilderError::InvalidCellSize {
                cell_size: self.cell_size,
                cell_height: self.cell_height,
            });
        }
        let width = (self.aabb.max.x - self.aabb.min.x) / self.cell_size + 0.5;
        let height = (self.aabb.max.z - self.aabb.min.z) / self.cell_size + 0.5;
        if width > u16::MAX as f32 || height > u16::MAX as f32 {
            return Err(HeightfieldBuilderError::ColumnCountTooLarge { width, height });
        }
        let width = width.max(0.0) as u16;
        let height = height.max(0.0) as u16;
        let column_count = width as usize * height as usize;
        Ok(Heightfield {
            width,
            height,
            aabb: self.aabb,
            cell_size: self.cell_size,
            cell_height: self.cell_height,
            spans: vec![None; column_count],
            allocated_spans: Spans::with_min_capacity(column_count),
        })
    }
}

/// Errors that can occur when building a [`Heightfield`] with [`HeightfieldBuilder::build`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HeightfieldBuilderError {
    /// Happens when the column count is too large.
    #[error("Column count (width*height) is too large, got {width}*{height} but each side may be at most {max}", max = u16::MAX)]
    ColumnCountTooLarge {
        /// The width of the heightfield along the x-axis in cell units
        width: f32,
        /// The height of the heightfield along the z-axis in cell units
        height: f32,
    },
    /// Happens when the cell size or cell height is not a positive number.
    #[error("Cell size and cell height must be positive, got {cell_size} and {cell_height}")]
    InvalidCellSize {
        /// The requested cell size
        cell_size: f32,
        /// The requested cell height
        cell_height: f32,
    },
}

/// Errors that can occur when inserting a span into a [`Heightfield`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpanInsertionError {
    /// Happens when the column index is out of bounds.
    #[error("column index out of bounds: x={x}, z={z}")]
    ColumnIndexOutOfBounds {
        /// The x-coordinate of the span
        x: u16,
        /// The z-coordinate of the span
        z: u16,
    },
    /// Happens when the span has no height.
    #[error("span must have min < max, got min={min}, max={max}")]
    EmptySpan {
        /// The floor of the span
        min: u16,
        /// The ceiling of the span
        max: u16,
    },
}

/// Describes a span to insert with [`Heightfield::add_span`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanInsertion {
    /// The x-coordinate of the span
    pub x: u16,
    /// The z-coordinate of the span
    pub z: u16,
    /// Maximum difference between the ceilings of two spans to merge area type IDs
    pub flag_merge_threshold: u16,
    /// The span to insert
    pub span: Span,
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use crate::{
        Aabb3d,
        span::{AreaType, SpanBuilder},
    };

    use super::*;

    fn height_field() -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::splat(5.0),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    fn span_low() -> SpanBuilder {
        SpanBuilder {
            min: 2,
            max: 4,
            area: AreaType(2),
            next: None,
        }
    }

    fn span_mid() -> SpanBuilder {
        SpanBuilder {
            min: 4,
            max: 7,
            area: AreaType(2),
            next: None,
        }
    }

    fn span_high() -> SpanBuilder {
        SpanBuilder {
            min: 8,
            max: 10,
            area: AreaType(2),
            next: None,
        }
    }

    fn insert(heightfield: &mut Heightfield, x: u16, z: u16, threshold: u16, span: Span) {
        heightfield
            .add_span(SpanInsertion {
                x,
                z,
                flag_merge_threshold: threshold,
                span,
            })
            .unwrap();
    }

    #[test]
    fn can_create_heightfield() {
        let heightfield = height_field();
        assert_eq!(heightfield.width, 5);
        assert_eq!(heightfield.height, 5);
        assert_eq!(heightfield.spans.len(), 25);
    }

    #[test]
    fn rejects_non_positive_cell_size() {
        let result = HeightfieldBuilder {
            aabb: Aabb3d::default(),
            cell_size: 0.0,
            cell_height: 1.0,
        }
        .build();
        assert!(matches!(
            result,
            Err(HeightfieldBuilderError::InvalidCellSize { .. })
        ));
    }

    #[test]
    fn can_add_span() {
        let mut heightfield = height_field();
        let expected_span = span_low().build();
        insert(&mut heightfield, 1, 3, 0, expected_span.clone());
        let span = heightfield.span_at(1, 3).unwrap();
        assert_eq!(*span, expected_span);

        let empty_span = heightfield.span_at(3, 1);
        assert_eq!(empty_span, None);
    }

    #[test]
    fn rejects_out_of_bounds_span() {
        let mut heightfield = height_field();
        let result = heightfield.add_span(SpanInsertion {
            x: 5,
            z: 0,
            flag_merge_threshold: 0,
            span: span_low().build(),
        });
        assert!(matches!(
            result,
            Err(SpanInsertionError::ColumnIndexOutOfBounds { x: 5, z: 0 })
        ));
    }

    #[test]
    fn can_add_multiple_spans_next_to_each_other() {
        let mut heightfield = height_field();
        let expected_span_1 = span_low().build();
        insert(&mut heightfield, 1, 3, 0, expected_span_1.clone());
        let expected_span_2 = span_mid().build();
        insert(&mut heightfield, 2, 3, 0, expected_span_2.clone());

        assert_eq!(*heightfield.span_at(1, 3).unwrap(), expected_span_1);
        assert_eq!(*heightfield.span_at(2, 3).unwrap(), expected_span_2);
        assert_eq!(heightfield.span_at(3, 1), None);
    }

    #[test]
    fn can_add_higher_span_in_same_column() {
        let mut heightfield = height_field();
        let span_low = span_low().build();
        insert(&mut heightfield, 1, 3, 0, span_low.clone());
        let span_high = span_high().build();
        insert(&mut heightfield, 1, 3, 0, span_high.clone());

        let span = heightfield.span_at(1, 3).unwrap();
        assert_eq_without_next(span, &span_low);
        let next_span = heightfield.span(span.next().unwrap());
        assert_eq_without_next(next_span, &span_high);
    }

    #[test]
    fn can_add_lower_span_in_same_column() {
        let mut heightfield = height_field();
        let span_high = span_high().build();
        insert(&mut heightfield, 1, 3, 0, span_high.clone());
        let span_low = span_low().build();
        insert(&mut heightfield, 1, 3, 0, span_low.clone());

        let span = heightfield.span_at(1, 3).unwrap();
        assert_eq_without_next(span, &span_low);
        let next_span = heightfield.span(span.next().unwrap());
        assert_eq_without_next(next_span, &span_high);
    }

    #[test]
    fn can_merge_spans() {
        let mut heightfield = height_field();
        let span_low = span_low().build();
        insert(&mut heightfield, 1, 3, 0, span_low.clone());
        let span_mid = span_mid().build();
        insert(&mut heightfield, 1, 3, 0, span_mid.clone());

        let merged_span = SpanBuilder {
            min: span_low.min(),
            max: span_mid.max(),
            area: span_mid.area(),
            next: None,
        }
        .build();

        let span = heightfield.span_at(1, 3).unwrap();
        assert_eq!(*span, merged_span);
        assert_eq!(heightfield.allocated_spans.len(), 1);
    }

    #[test]
    fn merge_keeps_highest_area_within_threshold() {
        let mut heightfield = height_field();
        let low_area = SpanBuilder {
            min: 0,
            max: 5,
            area: AreaType(1),
            next: None,
        };
        let high_area = SpanBuilder {
            min: 3,
            max: 6,
            area: AreaType(7),
            next: None,
        };
        insert(&mut heightfield, 0, 0, 1, low_area.clone().build());
        insert(&mut heightfield, 0, 0, 1, high_area.clone().build());
        assert_eq!(heightfield.span_at(0, 0).unwrap().area(), AreaType(7));

        // Tops are further apart than the threshold, so the new span's area is kept.
        let mut heightfield = height_field();
        insert(&mut heightfield, 0, 0, 0, high_area.build());
        insert(
            &mut heightfield,
            0,
            0,
            0,
            SpanBuilder {
                min: 1,
                max: 9,
                area: AreaType(1),
                next: None,
            }
            .build(),
        );
        let span = heightfield.span_at(0, 0).unwrap();
        assert_eq!(span.area(), AreaType(1));
        assert_eq!((span.min(), span.max()), (1, 9));
    }

    #[test]
    fn column_stays_sorted_and_covers_union_of_insertions() {
        // Deterministic pseudo random sequence of insertions.
        let mut state = 0x1234_5678_u32;
        let mut rand = move |max: u32| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            state % max
        };
        let mut heightfield = height_field();
        let mut covered = [false; 64];
        for _ in 0..200 {
            let min = rand(60) as u16;
            let max = min + 1 + rand(4) as u16;
            insert(
                &mut heightfield,
                2,
                2,
                1,
                SpanBuilder {
                    min,
                    max,
                    area: AreaType(rand(5) as u8 + 1),
                    next: None,
                }
                .build(),
            );
            for covered in &mut covered[min as usize..max as usize] {
                *covered = true;
            }
        }

        let spans: Vec<_> = heightfield.column_spans(2, 2).cloned().collect();
        for pair in spans.windows(2) {
            assert!(pair[0].max() < pair[1].min(), "spans overlap or touch");
        }
        let mut union = [false; 64];
        for span in &spans {
            assert!(span.min() < span.max());
            for union in &mut union[span.min() as usize..span.max() as usize] {
                *union = true;
            }
        }
        // Touching ranges are merged, so the union can only differ at gaps of size zero.
        for (i, (covered, union)) in covered.iter().zip(union.iter()).enumerate() {
            if *covered {
                assert!(*union, "cell {i} lost during merge");
            }
        }
    }

    #[track_caller]
    fn assert_eq_without_next(span: &Span, expected_span: &Span) {
        assert_eq!(span.min(), expected_span.min(), "min is not equal");
        assert_eq!(span.max(), expected_span.max(), "max is not equal");
        assert_eq!(span.area(), expected_span.area(), "area is not equal");
    }
}
