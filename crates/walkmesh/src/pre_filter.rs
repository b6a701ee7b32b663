//! Filters that run on the [`Heightfield`] after rasterization and before compaction.
//!
//! If both are used, [`Heightfield::filter_low_hanging_walkable_obstacles`] should run before
//! [`Heightfield::filter_ledge_spans`], since the latter may remove spans the former would have made walkable.

use crate::{
    heightfield::Heightfield,
    math::{dir_offset_x, dir_offset_z},
    span::{AreaType, Span},
};

impl Heightfield {
    /// Marks non-walkable spans as walkable if their maximum is within `walkable_climb` of the span directly below them.
    ///
    /// This allows agents to step over small obstacles like curbs or the steps of a staircase.
    /// A non-walkable span only inherits the area of the span below if that span was walkable before this pass,
    /// so stacks of obstacles are never bridged.
    pub fn filter_low_hanging_walkable_obstacles(&mut self, walkable_climb: u16) {
        for z in 0..self.height {
            for x in 0..self.width {
                let mut previous: Option<(u16, bool, AreaType)> = None;
                let mut span_key_iter = self.span_key_at(x, z);
                while let Some(span_key) = span_key_iter {
                    let span = self.span_mut(span_key);
                    span_key_iter = span.next();
                    let walkable = span.area().is_walkable();

                    // If the current span is not walkable, but there is a walkable span just below it and the height
                    // difference is small enough for the agent to walk over, mark the current span as walkable too.
                    if let Some((previous_max, previous_was_walkable, previous_area)) = previous {
                        if !walkable
                            && previous_was_walkable
                            && span.max() as i32 - previous_max as i32 <= walkable_climb as i32
                        {
                            span.set_area(previous_area);
                        }
                    }

                    // Copy the original walkable value regardless of whether we changed it.
                    // This prevents multiple consecutive non-walkable spans from being erroneously marked as walkable.
                    previous = Some((span.max(), walkable, span.area()));
                }
            }
        }
    }

    /// Marks spans that are ledges as not walkable.
    ///
    /// A ledge is a span with one or more neighbors whose maximum is further away than `walkable_climb`
    /// from the current span's maximum, or whose accessible neighbors differ in height by more than `walkable_climb`.
    /// Columns outside of the heightfield count as a drop.
    pub fn filter_ledge_spans(&mut self, walkable_height: u16, walkable_climb: u16) {
        let walkable_height = walkable_height as i32;
        let walkable_climb = walkable_climb as i32;
        let max_height = Span::MAX_HEIGHT as i32;

        for z in 0..self.height {
            for x in 0..self.width {
                let mut span_key_iter = self.span_key_at(x, z);
                while let Some(span_key) = span_key_iter {
                    let span = self.span(span_key);
                    span_key_iter = span.next();
                    // Skip non-walkable spans.
                    if !span.area().is_walkable() {
                        continue;
                    }

                    let floor = span.max() as i32;
                    let ceiling = self.ceiling_above(span);

                    // The difference between this walkable area and the lowest neighbor walkable area.
                    // This is the difference between the current span and all neighbor spans that have
                    // enough space for an agent to move between, but not accounting at all for surface slope.
                    let mut lowest_neighbor_floor_difference = max_height;

                    // Min and max height of accessible neighbours.
                    let mut lowest_traversable_neighbor_floor = floor;
                    let mut highest_traversable_neighbor_floor = floor;

                    for direction in 0..4 {
                        let neighbor_x = x as i32 + dir_offset_x(direction) as i32;
                        let neighbor_z = z as i32 + dir_offset_z(direction) as i32;

                        // Skip neighbours which are out of bounds.
                        if !self.contains(neighbor_x, neighbor_z) {
                            lowest_neighbor_floor_difference = -walkable_climb - 1;
                            break;
                        }
                        let (neighbor_x, neighbor_z) = (neighbor_x as u16, neighbor_z as u16);

                        // The most we can step down to the neighbor is the walkable climb distance.
                        // Start with the area under the neighbor span.
                        let mut neighbor_ceiling = self
                            .span_at(neighbor_x, neighbor_z)
                            .map_or(max_height, |span| span.min() as i32);

                        // Skip neighbour if the gap between the spans is too small.
                        if ceiling.min(neighbor_ceiling) - floor >= walkable_height {
                            lowest_neighbor_floor_difference = -walkable_climb - 1;
                            break;
                        }

                        // For each span in the neighboring column...
                        for neighbor_span in self.column_spans(neighbor_x, neighbor_z) {
                            let neighbor_floor = neighbor_span.max() as i32;
                            neighbor_ceiling = self.ceiling_above(neighbor_span);

                            // Only consider neighboring areas that have enough overlap to be potentially traversable.
                            if ceiling.min(neighbor_ceiling) - floor.max(neighbor_floor)
                                < walkable_height
                            {
                                // No space to traverse between them.
                                continue;
                            }

                            let neighbor_floor_difference = neighbor_floor - floor;
                            lowest_neighbor_floor_difference =
                                lowest_neighbor_floor_difference.min(neighbor_floor_difference);

                            // Find min/max accessible neighbor height.
                            // Only consider neighbors that are at most walkable_climb away.
                            if neighbor_floor_difference.abs() <= walkable_climb {
                                // There is space to move to the neighbor cell and the slope isn't too much.
                                lowest_traversable_neighbor_floor =
                                    lowest_traversable_neighbor_floor.min(neighbor_floor);
                                highest_traversable_neighbor_floor =
                                    highest_traversable_neighbor_floor.max(neighbor_floor);
                            } else if neighbor_floor_difference < -walkable_climb {
                                // We already know this will be considered a ledge span so we can early-out
                                break;
                            }
                        }
                    }

                    // The current span is close to a ledge if the magnitude of the drop to any neighbour span
                    // is greater than the walkable climb distance.
                    // That is, there is a gap that is large enough to let an agent move between them,
                    // but the drop (surface slope) is too large to allow it.
                    let is_ledge = lowest_neighbor_floor_difference < -walkable_climb;
                    // If the difference between all neighbor floors is too large, this is a steep slope.
                    let is_steep = highest_traversable_neighbor_floor
                        - lowest_traversable_neighbor_floor
                        > walkable_climb;
                    if is_ledge || is_steep {
                        self.span_mut(span_key).set_area(AreaType::NOT_WALKABLE);
                    }
                }
            }
        }
    }

    /// Marks walkable spans as not walkable if the clearance above the span is less than the specified `walkable_height`.
    ///
    /// For this filter, the clearance above the span is the distance from the span's
    /// maximum to the minimum of the next higher span in the same column.
    /// If there is no higher span in the column, the clearance is computed as the
    /// distance from the top of the span to the maximum heightfield height.
    pub fn filter_walkable_low_height_spans(&mut self, walkable_height: u16) {
        // Remove walkable flag from spans which do not have enough
        // space above them for the agent to stand there.
        for z in 0..self.height {
            for x in 0..self.width {
                let mut span_key_iter = self.span_key_at(x, z);
                while let Some(span_key) = span_key_iter {
                    let span = self.span(span_key);
                    span_key_iter = span.next();
                    let floor = span.max() as i32;
                    let ceiling = self.ceiling_above(span);
                    if ceiling - floor < walkable_height as i32 {
                        self.span_mut(span_key).set_area(AreaType::NOT_WALKABLE);
                    }
                }
            }
        }
    }

    /// The minimum of the span above the given span, or [`Span::MAX_HEIGHT`] if there is none.
    #[inline]
    fn ceiling_above(&self, span: &Span) -> i32 {
        span.next()
            .map_or(Span::MAX_HEIGHT, |next| self.span(next).min()) as i32
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;

    use crate::{
        Aabb3d, HeightfieldBuilder,
        heightfield::SpanInsertion,
        span::SpanBuilder,
    };

    use super::*;

    fn heightfield(size: f32) -> Heightfield {
        HeightfieldBuilder {
            aabb: Aabb3d {
                min: Vec3::ZERO,
                max: Vec3::splat(size),
            },
            cell_size: 1.0,
            cell_height: 1.0,
        }
        .build()
        .unwrap()
    }

    fn add(heightfield: &mut Heightfield, x: u16, z: u16, min: u16, max: u16, area: AreaType) {
        heightfield
            .add_span(SpanInsertion {
                x,
                z,
                flag_merge_threshold: 0,
                span: SpanBuilder {
                    min,
                    max,
                    area,
                    next: None,
                }
                .build(),
            })
            .unwrap();
    }

    fn areas(heightfield: &Heightfield, x: u16, z: u16) -> Vec<AreaType> {
        heightfield.column_spans(x, z).map(|s| s.area()).collect()
    }

    #[test]
    fn low_hanging_obstacle_becomes_walkable() {
        let mut heightfield = heightfield(4.0);
        add(&mut heightfield, 0, 0, 0, 1, AreaType(7));
        add(&mut heightfield, 0, 0, 2, 3, AreaType::NOT_WALKABLE);
        heightfield.filter_low_hanging_walkable_obstacles(2);
        assert_eq!(areas(&heightfield, 0, 0), vec![AreaType(7), AreaType(7)]);
    }

    #[test]
    fn low_hanging_obstacles_are_not_bridged() {
        let mut heightfield = heightfield(8.0);
        add(&mut heightfield, 0, 0, 0, 1, AreaType(7));
        add(&mut heightfield, 0, 0, 2, 3, AreaType::NOT_WALKABLE);
        add(&mut heightfield, 0, 0, 4, 5, AreaType::NOT_WALKABLE);
        heightfield.filter_low_hanging_walkable_obstacles(2);
        assert_eq!(
            areas(&heightfield, 0, 0),
            vec![AreaType(7), AreaType(7), AreaType::NOT_WALKABLE]
        );
    }

    #[test]
    fn high_obstacle_stays_unwalkable() {
        let mut heightfield = heightfield(8.0);
        add(&mut heightfield, 0, 0, 0, 1, AreaType(7));
        add(&mut heightfield, 0, 0, 3, 6, AreaType::NOT_WALKABLE);
        heightfield.filter_low_hanging_walkable_obstacles(2);
        assert_eq!(
            areas(&heightfield, 0, 0),
            vec![AreaType(7), AreaType::NOT_WALKABLE]
        );
    }

    #[test]
    fn ledge_spans_are_removed() {
        let mut heightfield = heightfield(5.0);
        // A 5x5 plateau at height 1 with a hole at the center.
        for z in 0..5 {
            for x in 0..5 {
                if (x, z) != (2, 2) {
                    add(&mut heightfield, x, z, 0, 1, AreaType(1));
                }
            }
        }
        heightfield.filter_ledge_spans(2, 1);
        // Border spans drop off the heightfield, the spans next to the hole drop into it.
        assert_eq!(areas(&heightfield, 0, 0), vec![AreaType::NOT_WALKABLE]);
        assert_eq!(areas(&heightfield, 2, 1), vec![AreaType::NOT_WALKABLE]);
        // Diagonal neighbors of the hole are not affected.
        assert_eq!(areas(&heightfield, 1, 1), vec![AreaType(1)]);
    }

    #[test]
    fn steep_neighborhood_is_removed() {
        let mut heightfield = heightfield(3.0);
        for z in 0..3 {
            for x in 0..3 {
                add(&mut heightfield, x, z, 0, 2, AreaType(1));
            }
        }
        // Raise the column left of the center and lower the one to the right, each within climb.
        heightfield.span_at_mut(0, 1).unwrap().set_max(3);
        heightfield.span_at_mut(2, 1).unwrap().set_max(1);
        heightfield.filter_ledge_spans(1, 1);
        assert_eq!(areas(&heightfield, 1, 1), vec![AreaType::NOT_WALKABLE]);
    }

    #[test]
    fn low_ceiling_spans_are_removed() {
        let mut heightfield = heightfield(10.0);
        add(&mut heightfield, 0, 0, 0, 1, AreaType(1));
        add(&mut heightfield, 0, 0, 3, 4, AreaType(1));
        add(&mut heightfield, 1, 0, 0, 1, AreaType(1));
        add(&mut heightfield, 1, 0, 5, 6, AreaType(1));
        heightfield.filter_walkable_low_height_spans(3);
        assert_eq!(
            areas(&heightfield, 0, 0),
            vec![AreaType::NOT_WALKABLE, AreaType(1)]
        );
        assert_eq!(areas(&heightfield, 1, 0), vec![AreaType(1), AreaType(1)]);
    }
}
