//! Output Geometry and Global Space
//!
//! Tracks where each compositor output sits in the shared global pixel
//! coordinate system and maintains the aggregate bounding box. Outputs live
//! in a fixed-size arena indexed by slot; lookups are linear scans, which is
//! the right trade for the small bound.
//!
//! The global space is only usable when the union of outputs covers its
//! bounding box edge-to-edge. Voids between outputs appear transiently while
//! an output is being unplugged and the compositor has not yet re-squished
//! the layout; callers pick between the strict and the gap-tolerant
//! recomputation accordingly.

use thiserror::Error;
use tracing::{debug, warn};

use crate::config::MAX_DRAWABLE_LAYERS;

/// Geometry error types
#[derive(Error, Debug)]
pub enum GeometryError {
    /// The union of outputs leaves uncovered pixels in its bounding box
    #[error("Output layout contains gaps between outputs; gapped layouts are not supported")]
    LayoutGap,
}

/// Logical position and size of one output in global space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputGeometry {
    /// Logical origin, global-space pixels
    pub x: i32,
    /// Logical origin, global-space pixels
    pub y: i32,
    /// Logical width in pixels
    pub width: i32,
    /// Logical height in pixels
    pub height: i32,
    /// All geometry events for this output have been received
    pub init_done: bool,
}

impl OutputGeometry {
    /// True when the global pixel lies on this output.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.x + self.width && y >= self.y && y < self.y + self.height
    }

    /// True until the compositor has reported a real size.
    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// A global pixel resolved to the output that contains it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenLocalCoord {
    /// Arena slot of the containing output
    pub output: usize,
    /// Pixel position local to that output
    pub x: i32,
    /// Pixel position local to that output
    pub y: i32,
}

/// Aggregate bounding box of all initialized outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalSpace {
    /// Top-left corner of the bounding box
    pub x: i32,
    /// Top-left corner of the bounding box
    pub y: i32,
    /// Bounding box width in pixels
    pub width: u32,
    /// Bounding box height in pixels
    pub height: u32,
}

impl GlobalSpace {
    /// True when no output contributes to the space.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Clamp a point into the bounding box.
    pub fn clamp(&self, x: f64, y: f64) -> (f64, f64) {
        if self.is_empty() {
            return (self.x as f64, self.y as f64);
        }
        let max_x = (self.x + self.width as i32 - 1) as f64;
        let max_y = (self.y + self.height as i32 - 1) as f64;
        (
            x.clamp(self.x as f64, max_x),
            y.clamp(self.y as f64, max_y),
        )
    }
}

/// Fixed-capacity arena of output geometries, indexed by slot.
pub struct OutputLayout {
    slots: Vec<Option<OutputGeometry>>,
}

impl Default for OutputLayout {
    fn default() -> Self {
        Self::new()
    }
}

impl OutputLayout {
    /// Create an empty arena with `MAX_DRAWABLE_LAYERS` slots.
    pub fn new() -> Self {
        Self {
            slots: vec![None; MAX_DRAWABLE_LAYERS],
        }
    }

    /// Geometry record in `slot`, if occupied.
    pub fn get(&self, slot: usize) -> Option<&OutputGeometry> {
        self.slots.get(slot).and_then(|entry| entry.as_ref())
    }

    /// Mutable geometry record in `slot`, if occupied.
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut OutputGeometry> {
        self.slots.get_mut(slot).and_then(|entry| entry.as_mut())
    }

    /// Occupy `slot` with a fresh, uninitialized geometry record.
    pub fn occupy(&mut self, slot: usize) {
        self.slots[slot] = Some(OutputGeometry::default());
    }

    /// Clear `slot`.
    pub fn clear(&mut self, slot: usize) {
        self.slots[slot] = None;
    }

    /// Iterate over initialized outputs as `(slot, geometry)`.
    pub fn initialized(&self) -> impl Iterator<Item = (usize, &OutputGeometry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, entry)| entry.as_ref().map(|geometry| (slot, geometry)))
            .filter(|(_, geometry)| geometry.init_done)
    }

    /// Lowest-slot initialized output, used as the recovery anchor when the
    /// cursor is left outside every output.
    pub fn first_initialized(&self) -> Option<(usize, &OutputGeometry)> {
        self.initialized().next()
    }

    /// True when every occupied slot has finished geometry initialization.
    pub fn all_initialized(&self) -> bool {
        self.slots
            .iter()
            .flatten()
            .all(|geometry| geometry.init_done)
    }

    /// True when any initialized output contains the global pixel.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.initialized().any(|(_, geometry)| geometry.contains(x, y))
    }

    /// Resolve a global pixel to the output containing it.
    pub fn locate(&self, x: i32, y: i32) -> Option<ScreenLocalCoord> {
        self.initialized()
            .find(|(_, geometry)| geometry.contains(x, y))
            .map(|(slot, geometry)| ScreenLocalCoord {
                output: slot,
                x: x - geometry.x,
                y: y - geometry.y,
            })
    }

    /// Translate an output-local pixel back to global space.
    pub fn to_global(&self, slot: usize, local_x: i32, local_y: i32) -> Option<(i32, i32)> {
        self.get(slot)
            .filter(|geometry| geometry.init_done)
            .map(|geometry| (geometry.x + local_x, geometry.y + local_y))
    }

    /// Recompute the global space from the initialized outputs.
    ///
    /// Verifies that the union of outputs covers the bounding box with no
    /// voids. With `tolerate_gaps` the verification failure downgrades to a
    /// warning (hot-unplug leaves transient voids until the compositor
    /// re-squishes the layout); otherwise it is an error.
    pub fn recompute_global_space(
        &self,
        tolerate_gaps: bool,
    ) -> Result<GlobalSpace, GeometryError> {
        let rects: Vec<&OutputGeometry> = self
            .initialized()
            .map(|(_, geometry)| geometry)
            .filter(|geometry| !geometry.is_zero())
            .collect();

        if rects.is_empty() {
            return Ok(GlobalSpace::default());
        }

        let mut min_x = i32::MAX;
        let mut min_y = i32::MAX;
        let mut max_x = i32::MIN;
        let mut max_y = i32::MIN;
        for rect in &rects {
            min_x = min_x.min(rect.x);
            min_y = min_y.min(rect.y);
            max_x = max_x.max(rect.x + rect.width);
            max_y = max_y.max(rect.y + rect.height);
        }

        let space = GlobalSpace {
            x: min_x,
            y: min_y,
            width: (max_x - min_x) as u32,
            height: (max_y - min_y) as u32,
        };

        if !union_covers_bounds(&rects) {
            if tolerate_gaps {
                warn!(
                    "output layout has gaps, tolerating until the compositor settles ({}x{} at {},{})",
                    space.width, space.height, space.x, space.y
                );
            } else {
                return Err(GeometryError::LayoutGap);
            }
        }

        debug!(
            "global space {}x{} at ({}, {}), {} outputs",
            space.width,
            space.height,
            space.x,
            space.y,
            rects.len()
        );
        Ok(space)
    }
}

/// Check that the rectangles cover their own bounding box completely.
///
/// Coordinate compression: every x and y edge splits the bounding box into a
/// grid whose cells are each either fully inside or fully outside every
/// rectangle, so testing one interior point per cell is exact.
fn union_covers_bounds(rects: &[&OutputGeometry]) -> bool {
    let mut xs: Vec<i32> = rects
        .iter()
        .flat_map(|rect| [rect.x, rect.x + rect.width])
        .collect();
    let mut ys: Vec<i32> = rects
        .iter()
        .flat_map(|rect| [rect.y, rect.y + rect.height])
        .collect();
    xs.sort_unstable();
    xs.dedup();
    ys.sort_unstable();
    ys.dedup();

    for window_x in xs.windows(2) {
        for window_y in ys.windows(2) {
            let cell_x = window_x[0];
            let cell_y = window_y[0];
            let covered = rects.iter().any(|rect| rect.contains(cell_x, cell_y));
            if !covered {
                return false;
            }
        }
    }
    true
}
