//! Crosshair Overlay
//!
//! One transparent fullscreen layer surface per output, holding a shared
//! memory pixel buffer. The only thing ever drawn is a red crosshair block
//! at the virtual cursor's position; updates are incremental, clearing the
//! previously drawn block and damaging just the touched rectangles.
//!
//! The surface is anchored to all four edges so the compositor sizes it to
//! the output, sits on the overlay layer, takes no keyboard focus, and has
//! an empty input region so clicks pass straight through.

use std::fs::File;
use std::os::fd::AsFd;

use memmap2::MmapMut;
use tracing::trace;
use wayland_client::protocol::{wl_buffer::WlBuffer, wl_shm, wl_shm_pool::WlShmPool, wl_surface::WlSurface};
use wayland_client::{Dispatch, QueueHandle};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1::ZwlrLayerSurfaceV1;

use crate::config::CURSOR_RADIUS;
use crate::entropy::EntropySource;
use crate::shm::{self, ShmError};

/// Crosshair color, ARGB8888.
pub const CROSSHAIR_COLOR: u32 = 0xFFFF_0000;

/// Background color, fully transparent.
pub const CLEAR_COLOR: u32 = 0x0000_0000;

/// Sentinel for "the cursor was not on this overlay last frame".
pub const NOT_ON_LAYER: i32 = -1;

/// Bytes per ARGB8888 pixel.
const BYTES_PER_PIXEL: u32 = 4;

/// Per-output drawing state.
pub struct DrawableLayer {
    /// Arena slot this layer occupies; doubles as buffer user data
    pub slot: usize,
    /// Backing surface
    pub surface: WlSurface,
    /// Layer-shell role object
    pub layer_surface: ZwlrLayerSurfaceV1,
    /// Buffer width in pixels, valid once configured
    pub width: u32,
    /// Buffer height in pixels, valid once configured
    pub height: u32,
    /// Row stride in bytes
    pub stride: u32,
    /// Pixel buffer size in bytes
    pub size: usize,
    /// Pool the per-frame buffers are cut from
    pool: Option<WlShmPool>,
    /// Mapped pixel storage
    pixels: Option<MmapMut>,
    /// Keeps the shm fd alive alongside the pool
    _shm_file: Option<File>,
    /// The compositor has acknowledged the layer surface configure
    pub configured: bool,
    /// The compositor has returned the previously attached buffer
    pub frame_released: bool,
    /// The cursor moved since the last draw
    pub frame_pending: bool,
    /// Cursor position drawn last frame, local pixels, or `NOT_ON_LAYER`
    pub last_drawn_x: i32,
    /// Cursor position drawn last frame, local pixels, or `NOT_ON_LAYER`
    pub last_drawn_y: i32,
}

impl DrawableLayer {
    /// Wrap a freshly created surface pair. The buffer comes later, on the
    /// first configure event.
    pub fn new(slot: usize, surface: WlSurface, layer_surface: ZwlrLayerSurfaceV1) -> Self {
        Self {
            slot,
            surface,
            layer_surface,
            width: 0,
            height: 0,
            stride: 0,
            size: 0,
            pool: None,
            pixels: None,
            _shm_file: None,
            configured: false,
            frame_released: true,
            frame_pending: true,
            last_drawn_x: NOT_ON_LAYER,
            last_drawn_y: NOT_ON_LAYER,
        }
    }

    /// (Re)build the pixel buffer for the configured dimensions.
    pub fn apply_configure<S>(
        &mut self,
        width: u32,
        height: u32,
        shm: &wl_shm::WlShm,
        qh: &QueueHandle<S>,
        entropy: &mut EntropySource,
    ) -> Result<(), ShmError>
    where
        S: Dispatch<WlShmPool, ()> + 'static,
    {
        // Drop the previous mapping and pool before replacing them.
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        self.pixels = None;
        self._shm_file = None;

        self.width = width;
        self.height = height;
        self.stride = width * BYTES_PER_PIXEL;
        self.size = (self.stride * height) as usize;

        let file = shm::create_shm_file(self.size as u64, entropy)?;
        let mapping = shm::map_mut(&file, self.size)?;
        let pool = shm.create_pool(file.as_fd(), self.size as i32, qh, ());

        self.pixels = Some(mapping);
        self._shm_file = Some(file);
        self.pool = Some(pool);
        self.configured = true;
        self.frame_pending = true;
        // A resize invalidates whatever was drawn before.
        self.last_drawn_x = NOT_ON_LAYER;
        self.last_drawn_y = NOT_ON_LAYER;
        Ok(())
    }

    /// Draw one frame: clear the previous crosshair block, paint the
    /// current one when the cursor is on this output, and commit.
    ///
    /// `cursor_local` is the cursor position in this output's local pixels,
    /// or `None` when the cursor is elsewhere.
    pub fn draw_frame<S>(&mut self, cursor_local: Option<(i32, i32)>, qh: &QueueHandle<S>)
    where
        S: Dispatch<WlBuffer, usize> + 'static,
    {
        if !self.frame_released || !self.configured {
            return;
        }
        let (pool, pixels) = match (self.pool.as_ref(), self.pixels.as_mut()) {
            (Some(pool), Some(pixels)) => (pool, pixels),
            _ => return,
        };
        self.frame_pending = false;

        let width = self.width as i32;
        let height = self.height as i32;

        if self.last_drawn_x >= 0 {
            paint_cursor_block(
                pixels,
                width,
                height,
                self.last_drawn_x,
                self.last_drawn_y,
                false,
            );
            let (dx, dy, dw, dh) = clamp_damage(
                self.last_drawn_x - CURSOR_RADIUS,
                self.last_drawn_y - CURSOR_RADIUS,
                2 * CURSOR_RADIUS + 1,
                2 * CURSOR_RADIUS + 1,
            );
            self.surface.damage_buffer(dx, dy, dw, dh);
        }

        if let Some((cx, cy)) = cursor_local {
            paint_cursor_block(pixels, width, height, cx, cy, true);
            let (dx, dy, dw, dh) = clamp_damage(
                cx - CURSOR_RADIUS,
                cy - CURSOR_RADIUS,
                2 * CURSOR_RADIUS + 1,
                2 * CURSOR_RADIUS + 1,
            );
            self.surface.damage_buffer(dx, dy, dw, dh);
            self.last_drawn_x = cx;
            self.last_drawn_y = cy;
        } else {
            self.last_drawn_x = NOT_ON_LAYER;
            self.last_drawn_y = NOT_ON_LAYER;
        }

        let buffer = pool.create_buffer(
            0,
            width,
            height,
            self.stride as i32,
            wl_shm::Format::Argb8888,
            qh,
            self.slot,
        );
        self.surface.attach(Some(&buffer), 0, 0);
        self.surface.commit();
        self.frame_released = false;

        trace!(slot = self.slot, cursor = ?cursor_local, "overlay frame committed");
    }

    /// Tear the layer down on output unplug.
    pub fn destroy(&mut self) {
        self.layer_surface.destroy();
        self.surface.destroy();
        if let Some(pool) = self.pool.take() {
            pool.destroy();
        }
        self.pixels = None;
        self._shm_file = None;
        self.configured = false;
    }
}

/// Paint the `(2·CURSOR_RADIUS+1)`-square block centered on `(cx, cy)`.
///
/// With `crosshair` the single horizontal and vertical lines through the
/// center are opaque red and the rest of the block transparent; without it
/// the whole block is cleared. Pixels outside the buffer are skipped.
pub fn paint_cursor_block(
    pixels: &mut [u8],
    width: i32,
    height: i32,
    cx: i32,
    cy: i32,
    crosshair: bool,
) {
    for y in (cy - CURSOR_RADIUS)..=(cy + CURSOR_RADIUS) {
        if y < 0 || y >= height {
            continue;
        }
        for x in (cx - CURSOR_RADIUS)..=(cx + CURSOR_RADIUS) {
            if x < 0 || x >= width {
                continue;
            }
            let color = if crosshair && (x == cx || y == cy) {
                CROSSHAIR_COLOR
            } else {
                CLEAR_COLOR
            };
            let offset = ((y * width + x) * BYTES_PER_PIXEL as i32) as usize;
            pixels[offset..offset + 4].copy_from_slice(&color.to_le_bytes());
        }
    }
}

/// Clamp a damage rectangle so negative origin coordinates collapse to
/// zero; the compositor rejects negative damage regions.
pub fn clamp_damage(x: i32, y: i32, width: i32, height: i32) -> (i32, i32, i32, i32) {
    (x.max(0), y.max(0), width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel_at(pixels: &[u8], width: i32, x: i32, y: i32) -> u32 {
        let offset = ((y * width + x) * 4) as usize;
        u32::from_le_bytes(pixels[offset..offset + 4].try_into().unwrap())
    }

    #[test]
    fn test_crosshair_lines_are_red() {
        let (width, height) = (100, 100);
        let mut pixels = vec![0u8; (width * height * 4) as usize];
        paint_cursor_block(&mut pixels, width, height, 50, 50, true);

        // Center lines within the block are red.
        assert_eq!(pixel_at(&pixels, width, 50, 50), CROSSHAIR_COLOR);
        assert_eq!(pixel_at(&pixels, width, 50 - CURSOR_RADIUS, 50), CROSSHAIR_COLOR);
        assert_eq!(pixel_at(&pixels, width, 50, 50 + CURSOR_RADIUS), CROSSHAIR_COLOR);
        // Off-axis block pixels are transparent.
        assert_eq!(pixel_at(&pixels, width, 51, 49), CLEAR_COLOR);
        // Pixels outside the block are untouched.
        assert_eq!(pixel_at(&pixels, width, 50 + CURSOR_RADIUS + 1, 50), 0);
    }

    #[test]
    fn test_clear_block_erases_crosshair() {
        let (width, height) = (100, 100);
        let mut pixels = vec![0u8; (width * height * 4) as usize];
        paint_cursor_block(&mut pixels, width, height, 50, 50, true);
        paint_cursor_block(&mut pixels, width, height, 50, 50, false);

        for y in 0..height {
            for x in 0..width {
                assert_eq!(pixel_at(&pixels, width, x, y), CLEAR_COLOR);
            }
        }
    }

    #[test]
    fn test_block_clips_at_buffer_edges() {
        let (width, height) = (20, 20);
        let mut pixels = vec![0u8; (width * height * 4) as usize];
        // Center near the corner; most of the block is off-buffer.
        paint_cursor_block(&mut pixels, width, height, 0, 0, true);

        assert_eq!(pixel_at(&pixels, width, 0, 0), CROSSHAIR_COLOR);
        assert_eq!(pixel_at(&pixels, width, CURSOR_RADIUS, 0), CROSSHAIR_COLOR);
        assert_eq!(pixel_at(&pixels, width, 1, 1), CLEAR_COLOR);
    }

    #[test]
    fn test_damage_clamps_negative_origin() {
        // A negative coordinate collapses to zero, the opposite coordinate
        // and the extents are preserved.
        assert_eq!(clamp_damage(-5, 10, 31, 31), (0, 10, 31, 31));
        assert_eq!(clamp_damage(10, -5, 31, 31), (10, 0, 31, 31));
        assert_eq!(clamp_damage(3, 4, 31, 31), (3, 4, 31, 31));
    }
}
