//! Virtual Cursor Traversal
//!
//! Software model of an absolute cursor moving through the compositor's
//! global pixel space. The global space may transiently contain voids
//! (pixels inside the bounding box that no output occupies), and the cursor
//! must never be placed in one: motion is resolved by walking the straight
//! line pixel by pixel and gliding along output edges when the line would
//! leave every output.
//!
//! A straight move out of an output into a void therefore stops at the
//! output's edge rather than teleporting to the next output, and a move that
//! crosses directly between edge-adjacent outputs passes through smoothly.

use crate::geometry::{GlobalSpace, OutputLayout};

/// Current and previous virtual-cursor position in global-space pixels.
///
/// Both points always lie within the union of initialized outputs, unless no
/// output is initialized at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct CursorPosition {
    /// Current position
    pub x: f64,
    /// Current position
    pub y: f64,
    /// Position before the most recent motion
    pub prev_x: f64,
    /// Position before the most recent motion
    pub prev_y: f64,
}

/// Which outputs a motion touched, for overlay redraw bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionOutcome {
    /// Output slot the cursor was on before the motion
    pub from: Option<usize>,
    /// Output slot the cursor is on after the motion
    pub to: Option<usize>,
}

impl CursorPosition {
    /// Apply a relative motion of `(dx, dy)` pixels.
    pub fn apply_relative(
        &mut self,
        layout: &OutputLayout,
        space: &GlobalSpace,
        dx: f64,
        dy: f64,
    ) -> MotionOutcome {
        self.recover(layout);
        let target_x = self.x + dx;
        let target_y = self.y + dy;
        self.travel(layout, space, target_x, target_y)
    }

    /// Move toward an absolute global-space position.
    pub fn apply_absolute(
        &mut self,
        layout: &OutputLayout,
        space: &GlobalSpace,
        x: f64,
        y: f64,
    ) -> MotionOutcome {
        self.recover(layout);
        self.travel(layout, space, x, y)
    }

    /// Reset onto the first initialized output when the current position is
    /// stranded outside every output (an output disappeared under it).
    fn recover(&mut self, layout: &OutputLayout) {
        let px = self.x.round() as i32;
        let py = self.y.round() as i32;
        if layout.contains(px, py) {
            return;
        }
        if let Some((_, geometry)) = layout.first_initialized() {
            self.x = geometry.x as f64;
            self.y = geometry.y as f64;
            self.prev_x = self.x;
            self.prev_y = self.y;
        }
    }

    fn travel(
        &mut self,
        layout: &OutputLayout,
        space: &GlobalSpace,
        target_x: f64,
        target_y: f64,
    ) -> MotionOutcome {
        let start_x = self.x.round() as i32;
        let start_y = self.y.round() as i32;
        let from = layout.locate(start_x, start_y).map(|local| local.output);

        if layout.first_initialized().is_none() {
            // No output to traverse; leave the position untouched.
            return MotionOutcome { from: None, to: None };
        }

        let (clamped_x, clamped_y) = space.clamp(target_x, target_y);
        let end_x = clamped_x.round() as i32;
        let end_y = clamped_y.round() as i32;

        let (final_x, final_y, unobstructed) =
            walk(layout, (start_x, start_y), (end_x, end_y));

        self.prev_x = self.x;
        self.prev_y = self.y;
        if unobstructed {
            // The full path was on outputs; keep the sub-pixel remainder.
            self.x = clamped_x;
            self.y = clamped_y;
        } else {
            self.x = final_x as f64;
            self.y = final_y as f64;
        }

        let to = layout.locate(final_x, final_y).map(|local| local.output);
        MotionOutcome { from, to }
    }
}

/// Walk the integer pixel line from `start` to `end`, gliding along output
/// edges where the line would enter a void. Returns the final pixel and
/// whether the original end was reached without obstruction.
fn walk(layout: &OutputLayout, start: (i32, i32), mut end: (i32, i32)) -> (i32, i32, bool) {
    let mut cur = start;
    let mut unobstructed = true;

    loop {
        if cur == end {
            return (cur.0, cur.1, unobstructed);
        }

        match first_void_crossing(layout, cur, end) {
            None => return (end.0, end.1, unobstructed),
            Some((last_valid, void_pixel)) => {
                unobstructed = false;
                let step_x = void_pixel.0 - last_valid.0;
                let step_y = void_pixel.1 - last_valid.1;

                // Glide along the edge just crossed. When the step was
                // diagonal the x-axis glide wins the tie.
                if step_x > 0 && layout.contains(void_pixel.0 - 1, void_pixel.1) {
                    cur = (void_pixel.0 - 1, void_pixel.1);
                    end.0 = void_pixel.0 - 1;
                } else if step_x < 0 && layout.contains(void_pixel.0 + 1, void_pixel.1) {
                    cur = (void_pixel.0 + 1, void_pixel.1);
                    end.0 = void_pixel.0 + 1;
                } else if step_y > 0 && layout.contains(void_pixel.0, void_pixel.1 - 1) {
                    cur = (void_pixel.0, void_pixel.1 - 1);
                    end.1 = void_pixel.1 - 1;
                } else if step_y < 0 && layout.contains(void_pixel.0, void_pixel.1 + 1) {
                    cur = (void_pixel.0, void_pixel.1 + 1);
                    end.1 = void_pixel.1 + 1;
                } else {
                    // Boxed into a corner; stop at the last valid pixel.
                    return (last_valid.0, last_valid.1, false);
                }
            }
        }
    }
}

/// Step along the line from `start` to `end` with the dominant axis
/// advancing one pixel at a time. Returns the last valid pixel and the
/// first void pixel, or `None` when the whole line stays on outputs.
fn first_void_crossing(
    layout: &OutputLayout,
    start: (i32, i32),
    end: (i32, i32),
) -> Option<((i32, i32), (i32, i32))> {
    let dx = end.0 - start.0;
    let dy = end.1 - start.1;
    let steps = dx.abs().max(dy.abs());
    let mut last_valid = start;

    for step in 1..=steps {
        let progress = step as f64 / steps as f64;
        let pixel = (
            start.0 + (dx as f64 * progress).round() as i32,
            start.1 + (dy as f64 * progress).round() as i32,
        );
        if layout.contains(pixel.0, pixel.1) {
            last_valid = pixel;
        } else {
            return Some((last_valid, pixel));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::OutputGeometry;

    fn layout_of(geometries: &[(i32, i32, i32, i32)]) -> (OutputLayout, GlobalSpace) {
        let mut layout = OutputLayout::new();
        for (slot, &(x, y, width, height)) in geometries.iter().enumerate() {
            layout.occupy(slot);
            *layout.get_mut(slot).unwrap() = OutputGeometry {
                x,
                y,
                width,
                height,
                init_done: true,
            };
        }
        let space = layout.recompute_global_space(true).unwrap();
        (layout, space)
    }

    fn cursor_at(x: f64, y: f64) -> CursorPosition {
        CursorPosition {
            x,
            y,
            prev_x: x,
            prev_y: y,
        }
    }

    #[test]
    fn test_motion_stops_at_void_edge() {
        // Two outputs with a 100-pixel vertical void between them. A
        // straight downward motion must stop at the upper output's last
        // row, not land in the void or on the lower output.
        let (layout, space) = layout_of(&[(0, 0, 800, 600), (0, 700, 800, 600)]);
        let mut cursor = cursor_at(400.0, 500.0);

        let outcome = cursor.apply_relative(&layout, &space, 0.0, 500.0);
        assert_eq!((cursor.x, cursor.y), (400.0, 599.0));
        assert_eq!(outcome.from, Some(0));
        assert_eq!(outcome.to, Some(0));
    }

    #[test]
    fn test_motion_crosses_adjacent_seam() {
        // Side-by-side outputs: a diagonal motion crosses the shared edge
        // without sticking.
        let (layout, space) = layout_of(&[(0, 0, 800, 600), (800, 0, 800, 600)]);
        let mut cursor = cursor_at(700.0, 300.0);

        let outcome = cursor.apply_relative(&layout, &space, 500.0, 50.0);
        assert_eq!((cursor.x, cursor.y), (1200.0, 350.0));
        assert_eq!(outcome.from, Some(0));
        assert_eq!(outcome.to, Some(1));
    }

    #[test]
    fn test_motion_clamps_to_global_bounds() {
        let (layout, space) = layout_of(&[(0, 0, 800, 600)]);
        let mut cursor = cursor_at(400.0, 300.0);

        cursor.apply_relative(&layout, &space, 10_000.0, -10_000.0);
        assert_eq!((cursor.x, cursor.y), (799.0, 0.0));
    }

    #[test]
    fn test_diagonal_exit_prefers_x_glide() {
        // An L-shaped layout whose inner corner the cursor exits
        // diagonally: both the pixel left of the void and the pixel above
        // it are valid, so the tie-break must pick the x-axis glide and
        // slide down the tall output's right edge.
        let (layout, space) = layout_of(&[(0, 0, 100, 200), (100, 0, 100, 100)]);
        let mut cursor = cursor_at(90.0, 90.0);

        cursor.apply_relative(&layout, &space, 20.0, 20.0);
        assert_eq!((cursor.x, cursor.y), (99.0, 110.0));
    }

    #[test]
    fn test_boxed_corner_stops_at_last_valid_pixel() {
        // A diagonal step off the output's corner where neither glide
        // candidate is valid: the cursor stays on the last valid pixel.
        let (layout, space) = layout_of(&[(0, 0, 100, 100), (150, 150, 50, 50)]);
        let mut cursor = cursor_at(99.0, 99.0);

        cursor.apply_relative(&layout, &space, 2.0, 2.0);
        assert_eq!((cursor.x, cursor.y), (99.0, 99.0));
    }

    #[test]
    fn test_motion_clamps_with_full_coverage() {
        // With a gap-free layout, clamping to the global bounds keeps the
        // whole path on outputs.
        let (layout, space) = layout_of(&[(0, 0, 100, 100)]);
        let mut cursor = cursor_at(50.0, 50.0);

        cursor.apply_relative(&layout, &space, 100.0, 100.0);
        assert_eq!((cursor.x, cursor.y), (99.0, 99.0));
    }

    #[test]
    fn test_recovery_resets_to_first_output() {
        // The cursor was stranded by a hot-unplug; the next motion snaps it
        // to the first initialized output before applying the delta.
        let (layout, space) = layout_of(&[(0, 0, 800, 600)]);
        let mut cursor = cursor_at(5_000.0, 5_000.0);

        cursor.apply_relative(&layout, &space, 5.0, 5.0);
        assert_eq!((cursor.x, cursor.y), (5.0, 5.0));
    }

    #[test]
    fn test_absolute_motion_walks_voids_too() {
        let (layout, space) = layout_of(&[(0, 0, 800, 600), (0, 700, 800, 600)]);
        let mut cursor = cursor_at(100.0, 100.0);

        // Absolute target sits inside the void band; the cursor glides down
        // the upper output and stops at its edge.
        cursor.apply_absolute(&layout, &space, 100.0, 650.0);
        assert_eq!((cursor.x, cursor.y), (100.0, 599.0));
    }

    #[test]
    fn test_no_outputs_leaves_position_unchanged() {
        let layout = OutputLayout::new();
        let space = GlobalSpace::default();
        let mut cursor = cursor_at(10.0, 20.0);

        let outcome = cursor.apply_relative(&layout, &space, 5.0, 5.0);
        assert_eq!((cursor.x, cursor.y), (10.0, 20.0));
        assert_eq!(outcome, MotionOutcome { from: None, to: None });
    }

    #[test]
    fn test_subpixel_remainder_survives_clear_path() {
        let (layout, space) = layout_of(&[(0, 0, 800, 600)]);
        let mut cursor = cursor_at(100.0, 100.0);

        cursor.apply_relative(&layout, &space, 0.25, 0.25);
        assert_eq!((cursor.x, cursor.y), (100.25, 100.25));
        assert_eq!((cursor.prev_x, cursor.prev_y), (100.0, 100.0));
    }
}
