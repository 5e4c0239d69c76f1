//! Protocol Event Handlers
//!
//! One `Dispatch` impl per interface, each mutating the owned context
//! directly. Arena-backed objects (outputs, xdg-outputs, layer surfaces,
//! buffers) carry their slot index as user data so handlers address their
//! state without searching.

use std::fs::File;
use std::io::Write;
use std::os::fd::{AsFd, OwnedFd};

use memmap2::MmapOptions;
use tracing::{debug, trace, warn};
use wayland_client::globals::GlobalListContents;
use wayland_client::protocol::{
    wl_buffer::{self, WlBuffer},
    wl_compositor::WlCompositor,
    wl_keyboard::{self, WlKeyboard},
    wl_output::{self, WlOutput},
    wl_region::WlRegion,
    wl_registry::{self, WlRegistry},
    wl_seat::{self, WlSeat},
    wl_shm::WlShm,
    wl_shm_pool::WlShmPool,
    wl_surface::WlSurface,
};
use wayland_client::{delegate_noop, Connection, Dispatch, QueueHandle, WEnum};
use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1,
    zxdg_output_v1::{self, ZxdgOutputV1},
};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::ZwlrLayerShellV1,
    zwlr_layer_surface_v1::{self, ZwlrLayerSurfaceV1},
};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};

use super::KloakState;
use crate::shm;

impl Dispatch<WlRegistry, GlobalListContents> for KloakState {
    fn event(
        state: &mut Self,
        registry: &WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_output" => {
                    if version < 4 {
                        warn!("ignoring wl_output {name} with version {version} < 4");
                        return;
                    }
                    state.allocate_output(registry, name, qh);
                }
                "zxdg_output_manager_v1" => {
                    if state.xdg_output_manager.is_some() || version < 3 {
                        return;
                    }
                    let manager: ZxdgOutputManagerV1 = registry.bind(name, 3, qh, ());
                    state.adopt_xdg_output_manager(manager, qh);
                }
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => {
                state.remove_output(name);
            }
            _ => {}
        }
    }
}

impl Dispatch<WlSeat, ()> for KloakState {
    fn event(
        state: &mut Self,
        seat: &WlSeat,
        event: wl_seat::Event,
        _data: &(),
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_seat::Event::Capabilities { capabilities } => {
                let WEnum::Value(capabilities) = capabilities else {
                    return;
                };
                let has_keyboard = capabilities.contains(wl_seat::Capability::Keyboard);
                if has_keyboard && state.keyboard.is_none() {
                    // The seat keyboard is listened to for keymap
                    // descriptors only; key events come from the grabbed
                    // devices, never from here.
                    state.keyboard = Some(seat.get_keyboard(qh, ()));
                    debug!("listening for seat keymap updates");
                } else if !has_keyboard {
                    if let Some(keyboard) = state.keyboard.take() {
                        keyboard.release();
                    }
                }
            }
            wl_seat::Event::Name { name } => {
                debug!("seat name: {name}");
            }
            _ => {}
        }
    }
}

impl Dispatch<WlKeyboard, ()> for KloakState {
    fn event(
        state: &mut Self,
        _keyboard: &WlKeyboard,
        event: wl_keyboard::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_keyboard::Event::Keymap { format, fd, size } = event {
            if format != WEnum::Value(wl_keyboard::KeymapFormat::XkbV1) {
                return;
            }
            state.handle_keymap(fd, size);
        }
        // Enter/leave/key/modifiers from the seat are not replayed; the
        // grabbed devices are the authoritative input source.
    }
}

impl Dispatch<WlOutput, usize> for KloakState {
    fn event(
        state: &mut Self,
        _output: &WlOutput,
        event: wl_output::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let slot = *data;
        match event {
            wl_output::Event::Done => {
                let Some(geometry) = state.layout.get_mut(slot) else {
                    return;
                };
                if geometry.is_zero() {
                    // Geometry incomplete; wait for the next done signal.
                    trace!(slot, "output done with zero geometry, ignoring");
                    return;
                }
                geometry.init_done = true;
                debug!(
                    slot,
                    x = geometry.x,
                    y = geometry.y,
                    width = geometry.width,
                    height = geometry.height,
                    "output geometry complete"
                );
                state.recompute_space(state.layout_settled);
            }
            // Physical geometry and modes are superseded by the logical
            // coordinates from the extended-output manager.
            _ => {}
        }
    }
}

impl Dispatch<ZxdgOutputV1, usize> for KloakState {
    fn event(
        state: &mut Self,
        _xdg_output: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let slot = *data;
        let Some(geometry) = state.layout.get_mut(slot) else {
            return;
        };
        match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => {
                geometry.x = x;
                geometry.y = y;
            }
            zxdg_output_v1::Event::LogicalSize { width, height } => {
                geometry.width = width;
                geometry.height = height;
            }
            // done is deprecated at manager version 3; wl_output.done is
            // the completion signal.
            _ => {}
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, usize> for KloakState {
    fn event(
        state: &mut Self,
        layer_surface: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        data: &usize,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let slot = *data;
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                layer_surface.ack_configure(serial);
                state.configure_layer(slot, width, height, qh);
            }
            zwlr_layer_surface_v1::Event::Closed => {
                // The output is going away; teardown happens on the
                // matching global_remove.
                debug!(slot, "layer surface closed");
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, usize> for KloakState {
    fn event(
        state: &mut Self,
        buffer: &WlBuffer,
        event: wl_buffer::Event,
        data: &usize,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        if let wl_buffer::Event::Release = event {
            // One buffer per frame; it is done the moment the compositor
            // lets go of it.
            buffer.destroy();
            if let Some(layer) = state.layers[*data].as_mut() {
                layer.frame_released = true;
            }
        }
    }
}

impl KloakState {
    /// Size (or resize) an overlay's pixel buffer and draw its first frame.
    fn configure_layer(&mut self, slot: usize, width: u32, height: u32, qh: &QueueHandle<Self>) {
        if width == 0 || height == 0 {
            return;
        }

        let Some(layer) = self.layers[slot].as_mut() else {
            return;
        };
        if let Err(error) = layer.apply_configure(width, height, &self.shm, qh, &mut self.entropy)
        {
            self.fail(
                anyhow::Error::new(error).context("Could not allocate an overlay frame buffer"),
            );
            return;
        }
        debug!(slot, width, height, "overlay configured");

        let cursor_local = self
            .layout
            .locate(self.cursor.x.round() as i32, self.cursor.y.round() as i32)
            .filter(|local| local.output == slot)
            .map(|local| (local.x, local.y));
        if let Some(layer) = self.layers[slot].as_mut() {
            layer.draw_frame(cursor_local, qh);
        }
    }

    /// Compositor keymap descriptor: drop exact duplicates, otherwise copy
    /// the bytes into a fresh shared-memory object, hand it to the virtual
    /// keyboard, and recompile the local state tracker.
    fn handle_keymap(&mut self, fd: OwnedFd, size: u32) {
        let file = File::from(fd);
        let mapping = match unsafe { MmapOptions::new().len(size as usize).map(&file) } {
            Ok(mapping) => mapping,
            Err(error) => {
                warn!("could not map keymap descriptor: {error}");
                return;
            }
        };

        if self.keymap.is_duplicate(&mapping) {
            trace!("dropping redundant keymap descriptor");
            return;
        }

        let mut forwarded = match shm::create_shm_file(size as u64, &mut self.entropy) {
            Ok(file) => file,
            Err(error) => {
                self.fail(anyhow::Error::new(error).context("Could not stage keymap forwarding"));
                return;
            }
        };
        if let Err(error) = forwarded.write_all(&mapping) {
            self.fail(
                anyhow::Error::new(error).context("Could not write keymap to shared memory"),
            );
            return;
        }
        self.virtual_keyboard.keymap(forwarded.as_fd(), size);

        if let Err(error) = self.keymap.install(mapping.to_vec()) {
            self.fail(anyhow::Error::new(error));
            return;
        }
        debug!("keymap forwarded to virtual keyboard ({size} bytes)");
    }
}

// Interfaces whose events carry nothing the daemon acts on.
delegate_noop!(KloakState: ignore WlCompositor);
delegate_noop!(KloakState: ignore WlShm);
delegate_noop!(KloakState: ignore WlShmPool);
delegate_noop!(KloakState: ignore WlSurface);
delegate_noop!(KloakState: ignore WlRegion);
delegate_noop!(KloakState: ignore ZwlrLayerShellV1);
delegate_noop!(KloakState: ignore ZxdgOutputManagerV1);
delegate_noop!(KloakState: ignore ZwlrVirtualPointerManagerV1);
delegate_noop!(KloakState: ignore ZwlrVirtualPointerV1);
delegate_noop!(KloakState: ignore ZwpVirtualKeyboardManagerV1);
delegate_noop!(KloakState: ignore ZwpVirtualKeyboardV1);
