//! Cursor traversal and layout scenarios
//!
//! Cross-module behavior of the output layout, global space, and the
//! pixel-walking cursor model: void avoidance, seam crossing, and the
//! hot-unplug recovery path.

use kloak::geometry::{GeometryError, GlobalSpace, OutputGeometry, OutputLayout};
use kloak::walker::CursorPosition;

fn occupy(layout: &mut OutputLayout, slot: usize, x: i32, y: i32, width: i32, height: i32) {
    layout.occupy(slot);
    *layout.get_mut(slot).unwrap() = OutputGeometry {
        x,
        y,
        width,
        height,
        init_done: true,
    };
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
fn vertical_void_is_never_entered() {
    // Outputs at (0,0) 800x600 and (0,700) 800x600 leave a 100-pixel void
    // between y=600 and y=700. A relative motion of (0, +500) from
    // (400, 500) must stop at (400, 599).
    let mut layout = OutputLayout::new();
    occupy(&mut layout, 0, 0, 0, 800, 600);
    occupy(&mut layout, 1, 0, 700, 800, 600);
    let space = layout.recompute_global_space(true).unwrap();

    let mut cursor = cursor_at(400.0, 500.0);
    cursor.apply_relative(&layout, &space, 0.0, 500.0);
    assert_eq!((cursor.x, cursor.y), (400.0, 599.0));

    // Nothing about the glide may have left the outputs.
    assert!(layout.contains(cursor.x.round() as i32, cursor.y.round() as i32));
}

#[test]
fn seam_between_adjacent_outputs_is_crossed_smoothly() {
    let mut layout = OutputLayout::new();
    occupy(&mut layout, 0, 0, 0, 800, 600);
    occupy(&mut layout, 1, 800, 0, 800, 600);
    let space = layout.recompute_global_space(false).unwrap();

    let mut cursor = cursor_at(700.0, 300.0);
    let outcome = cursor.apply_relative(&layout, &space, 500.0, 50.0);
    assert_eq!((cursor.x, cursor.y), (1200.0, 350.0));
    assert_eq!(outcome.from, Some(0));
    assert_eq!(outcome.to, Some(1));
}

#[test]
fn hot_unplug_recovers_layout_and_cursor() {
    let mut layout = OutputLayout::new();
    occupy(&mut layout, 0, 0, 0, 800, 600);
    occupy(&mut layout, 1, 800, 0, 800, 600);
    let space = layout.recompute_global_space(false).unwrap();
    assert_eq!(space.width, 1600);

    let mut cursor = cursor_at(1200.0, 300.0);

    // The output under the cursor disappears. The gap-tolerant recompute
    // must succeed, and a zero-length motion snaps the cursor back onto
    // the surviving output.
    layout.clear(1);
    let space = layout.recompute_global_space(true).unwrap();
    assert_eq!((space.x, space.y, space.width, space.height), (0, 0, 800, 600));

    let outcome = cursor.apply_relative(&layout, &space, 0.0, 0.0);
    assert_eq!((cursor.x, cursor.y), (0.0, 0.0));
    assert_eq!(outcome.to, Some(0));

    // The compositor re-advertises the second output at a squished
    // position; the strict recompute equals the new union exactly.
    occupy(&mut layout, 1, 0, 600, 800, 600);
    let space = layout.recompute_global_space(false).unwrap();
    assert_eq!((space.x, space.y, space.width, space.height), (0, 0, 800, 1200));
}

#[test]
fn gapped_startup_layout_is_rejected() {
    let mut layout = OutputLayout::new();
    occupy(&mut layout, 0, 0, 0, 800, 600);
    occupy(&mut layout, 1, 900, 0, 800, 600);
    assert!(matches!(
        layout.recompute_global_space(false),
        Err(GeometryError::LayoutGap)
    ));
}

#[test]
fn motion_in_empty_layout_is_inert() {
    let layout = OutputLayout::new();
    let space = GlobalSpace::default();
    let mut cursor = cursor_at(0.0, 0.0);
    cursor.apply_relative(&layout, &space, 100.0, 100.0);
    assert_eq!((cursor.x, cursor.y), (0.0, 0.0));
}

#[test]
fn long_diagonal_path_stays_on_outputs() {
    // Three outputs in an L; a long diagonal sweep across the whole space
    // must end on an output no matter how the glides compose.
    let mut layout = OutputLayout::new();
    occupy(&mut layout, 0, 0, 0, 1000, 1000);
    occupy(&mut layout, 1, 1000, 0, 1000, 500);
    occupy(&mut layout, 2, 0, 1000, 500, 500);
    let space = layout.recompute_global_space(true).unwrap();

    let mut cursor = cursor_at(10.0, 10.0);
    cursor.apply_relative(&layout, &space, 1900.0, 1400.0);
    assert!(layout.contains(cursor.x.round() as i32, cursor.y.round() as i32));

    cursor.apply_relative(&layout, &space, -1900.0, -1400.0);
    assert!(layout.contains(cursor.x.round() as i32, cursor.y.round() as i32));
}
