//! Virtual Input Devices
//!
//! Wrappers around the zwlr-virtual-pointer and zwp-virtual-keyboard
//! protocol objects, plus the keymap-state tracker that keeps the virtual
//! keyboard's modifier picture consistent with the keys this daemon has
//! replayed.
//!
//! # Keycode conventions
//!
//! Emitted key events carry raw evdev keycodes. The XKB state tracker uses
//! the X11 convention, which is offset from evdev by a constant 8; the
//! offset is applied only when advancing the tracker, never to the code
//! sent over the wire.

use thiserror::Error;
use tracing::{debug, trace};
use wayland_client::backend::WaylandError;
use wayland_client::protocol::{wl_pointer, wl_seat::WlSeat};
use wayland_client::{Dispatch, QueueHandle};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::{self, ZwpVirtualKeyboardManagerV1},
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1,
};
use wayland_protocols_wlr::virtual_pointer::v1::client::{
    zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1,
    zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1,
};
use xkbcommon::xkb;

use crate::scheduler::ScrollSource;

/// Offset between evdev keycodes and XKB keycodes.
const KEYMAP_KEYCODE_OFFSET: u32 = 8;

/// wl_keyboard keymap format value for XKB text keymaps.
const KEYMAP_FORMAT_XKB_V1: u32 = 1;

/// Virtual-input error types
#[derive(Error, Debug)]
pub enum VirtualInputError {
    /// The compositor refused virtual-keyboard access for this client
    #[error("Compositor refused virtual keyboard access (unauthorized); cannot continue")]
    Unauthorized,

    /// The keymap text did not compile
    #[error("Could not compile keymap forwarded by the compositor")]
    KeymapCompile,
}

/// True when a connection-level protocol error is the virtual-keyboard
/// manager's "unauthorized" sentinel.
///
/// The protocol conveys the sentinel as an error on the manager interface;
/// any other failure keeps its generic fatal path.
pub fn keyboard_unauthorized(error: &WaylandError) -> bool {
    match error {
        WaylandError::Protocol(protocol_error) => {
            protocol_error.object_interface == "zwp_virtual_keyboard_manager_v1"
                && protocol_error.code
                    == zwp_virtual_keyboard_manager_v1::Error::Unauthorized as u32
        }
        WaylandError::Io(_) => false,
    }
}

/// Scroll axis of an emitted pointer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollAxis {
    /// Vertical wheel/finger motion
    Vertical,
    /// Horizontal wheel/finger motion
    Horizontal,
}

impl ScrollAxis {
    fn to_wire(self) -> wl_pointer::Axis {
        match self {
            ScrollAxis::Vertical => wl_pointer::Axis::VerticalScroll,
            ScrollAxis::Horizontal => wl_pointer::Axis::HorizontalScroll,
        }
    }
}

fn source_to_wire(source: ScrollSource) -> wl_pointer::AxisSource {
    match source {
        ScrollSource::Wheel => wl_pointer::AxisSource::Wheel,
        ScrollSource::Finger => wl_pointer::AxisSource::Finger,
        ScrollSource::Continuous => wl_pointer::AxisSource::Continuous,
    }
}

/// Virtual pointer wrapper.
///
/// All positions are absolute within the global space extent; the daemon's
/// cursor model owns the actual coordinates.
pub struct VirtualPointer {
    pointer: ZwlrVirtualPointerV1,
}

impl VirtualPointer {
    /// Create the process-wide virtual pointer on `seat`.
    pub fn new<State>(
        manager: &ZwlrVirtualPointerManagerV1,
        seat: &WlSeat,
        qh: &QueueHandle<State>,
    ) -> Self
    where
        State: Dispatch<ZwlrVirtualPointerV1, ()> + 'static,
    {
        let pointer = manager.create_virtual_pointer(Some(seat), qh, ());
        debug!("virtual pointer created");
        Self { pointer }
    }

    /// Move the pointer to an absolute position inside `extent`.
    pub fn motion_absolute(&self, time: u32, x: u32, y: u32, x_extent: u32, y_extent: u32) {
        self.pointer.motion_absolute(time, x, y, x_extent, y_extent);
    }

    /// Press or release a button, raw evdev code.
    pub fn button(&self, time: u32, button: u32, pressed: bool) {
        let state = if pressed {
            wl_pointer::ButtonState::Pressed
        } else {
            wl_pointer::ButtonState::Released
        };
        self.pointer.button(time, button, state);
    }

    /// Announce the physical source of the following axis events.
    pub fn axis_source(&self, source: ScrollSource) {
        self.pointer.axis_source(source_to_wire(source));
    }

    /// Emit one axis value. A value of exactly zero means the axis came to
    /// rest and is emitted as an axis-stop instead.
    pub fn axis(&self, time: u32, axis: ScrollAxis, value: f64) {
        if value == 0.0 {
            self.pointer.axis_stop(time, axis.to_wire());
        } else {
            self.pointer.axis(time, axis.to_wire(), value);
        }
    }

    /// Close the batch of pointer events for one logical frame.
    pub fn frame(&self) {
        self.pointer.frame();
    }
}

impl Drop for VirtualPointer {
    fn drop(&mut self) {
        self.pointer.destroy();
    }
}

/// Virtual keyboard wrapper.
pub struct VirtualKeyboard {
    keyboard: ZwpVirtualKeyboardV1,
}

impl VirtualKeyboard {
    /// Create the process-wide virtual keyboard on `seat`.
    ///
    /// The compositor may refuse the creation with the "unauthorized"
    /// protocol error; that surfaces on the next roundtrip and the caller
    /// maps it through [`keyboard_unauthorized`].
    pub fn new<State>(
        manager: &ZwpVirtualKeyboardManagerV1,
        seat: &WlSeat,
        qh: &QueueHandle<State>,
    ) -> Self
    where
        State: Dispatch<ZwpVirtualKeyboardV1, ()> + 'static,
    {
        let keyboard = manager.create_virtual_keyboard(seat, qh, ());
        debug!("virtual keyboard created");
        Self { keyboard }
    }

    /// Forward a keymap descriptor to the compositor.
    pub fn keymap(&self, fd: std::os::fd::BorrowedFd<'_>, size: u32) {
        self.keyboard.keymap(KEYMAP_FORMAT_XKB_V1, fd, size);
    }

    /// Push a modifier snapshot ahead of a key event.
    pub fn modifiers(&self, snapshot: ModifierSnapshot) {
        self.keyboard.modifiers(
            snapshot.depressed,
            snapshot.latched,
            snapshot.locked,
            snapshot.group,
        );
    }

    /// Press or release a key, raw evdev keycode.
    pub fn key(&self, time: u32, key: u32, pressed: bool) {
        let state = u32::from(pressed);
        self.keyboard.key(time, key, state);
    }
}

impl Drop for VirtualKeyboard {
    fn drop(&mut self) {
        self.keyboard.destroy();
    }
}

/// Modifier masks and layout group captured from the keymap state tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModifierSnapshot {
    /// Currently held modifiers
    pub depressed: u32,
    /// Latched modifiers
    pub latched: u32,
    /// Locked modifiers
    pub locked: u32,
    /// Effective layout group
    pub group: u32,
}

/// Local keymap-state tracker mirroring the keys replayed through the
/// virtual keyboard. Also remembers the last accepted keymap bytes so
/// redundant descriptors from the compositor are dropped without a
/// round-trip to the virtual keyboard.
pub struct KeymapTracker {
    context: xkb::Context,
    state: Option<xkb::State>,
    retained: Option<Vec<u8>>,
}

impl Default for KeymapTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl KeymapTracker {
    /// Create a tracker with no keymap installed.
    pub fn new() -> Self {
        Self {
            context: xkb::Context::new(xkb::CONTEXT_NO_FLAGS),
            state: None,
            retained: None,
        }
    }

    /// True when `bytes` matches the previously accepted keymap
    /// byte-for-byte and must be dropped silently.
    pub fn is_duplicate(&self, bytes: &[u8]) -> bool {
        self.retained
            .as_deref()
            .map(|retained| retained == bytes)
            .unwrap_or(false)
    }

    /// True once a keymap has been installed; key emission is held back
    /// until then.
    pub fn has_keymap(&self) -> bool {
        self.state.is_some()
    }

    /// Compile and retain a new keymap.
    pub fn install(&mut self, bytes: Vec<u8>) -> Result<(), VirtualInputError> {
        // The descriptor is NUL-terminated; the compiler wants the text.
        let text_end = bytes
            .iter()
            .position(|&byte| byte == 0)
            .unwrap_or(bytes.len());
        let text = String::from_utf8_lossy(&bytes[..text_end]).into_owned();

        let keymap = xkb::Keymap::new_from_string(
            &self.context,
            text,
            xkb::KEYMAP_FORMAT_TEXT_V1,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or(VirtualInputError::KeymapCompile)?;

        self.state = Some(xkb::State::new(&keymap));
        self.retained = Some(bytes);
        debug!("keymap installed, state tracker recompiled");
        Ok(())
    }

    /// Snapshot of the current modifier masks and layout group, or `None`
    /// before the first keymap arrives.
    pub fn modifier_snapshot(&self) -> Option<ModifierSnapshot> {
        let state = self.state.as_ref()?;
        Some(ModifierSnapshot {
            depressed: state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        })
    }

    /// Advance the tracker after a key was emitted. `raw_key` is the evdev
    /// code; the XKB offset is applied here and only here.
    pub fn advance_key(&mut self, raw_key: u32, pressed: bool) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let direction = if pressed {
            xkb::KeyDirection::Down
        } else {
            xkb::KeyDirection::Up
        };
        state.update_key((raw_key + KEYMAP_KEYCODE_OFFSET).into(), direction);
        trace!(raw_key, pressed, "keymap state advanced");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wayland_client::backend::protocol::ProtocolError;

    #[test]
    fn test_duplicate_keymap_detection() {
        let mut tracker = KeymapTracker::new();
        assert!(!tracker.is_duplicate(b"xkb_keymap {}"));

        // install() needs a complete XKB description, so seed the retained
        // bytes directly and drive the comparison.
        tracker.retained = Some(b"xkb_keymap {}".to_vec());
        assert!(tracker.is_duplicate(b"xkb_keymap {}"));
        assert!(!tracker.is_duplicate(b"xkb_keymap { different }"));
    }

    #[test]
    fn test_no_snapshot_before_keymap() {
        let tracker = KeymapTracker::new();
        assert!(!tracker.has_keymap());
        assert!(tracker.modifier_snapshot().is_none());
    }

    #[test]
    fn test_unauthorized_protocol_error_is_recognized() {
        let error = WaylandError::Protocol(ProtocolError {
            code: zwp_virtual_keyboard_manager_v1::Error::Unauthorized as u32,
            object_id: 42,
            object_interface: "zwp_virtual_keyboard_manager_v1".to_string(),
            message: "client unauthorized".to_string(),
        });
        assert!(keyboard_unauthorized(&error));

        let other = WaylandError::Protocol(ProtocolError {
            code: 0,
            object_id: 7,
            object_interface: "wl_surface".to_string(),
            message: "bad damage".to_string(),
        });
        assert!(!keyboard_unauthorized(&other));
    }
}
