//! Daemon Core
//!
//! The single owned context threaded through the event loop, and the loop
//! itself. All mutable state lives here: the output and overlay arenas, the
//! delay queue, the virtual-cursor model, and the virtual input devices.
//! There are no worker threads and no locks; every mutation happens between
//! two poll returns on the one thread.
//!
//! Loop shape per iteration: dispatch buffered compositor events, pull and
//! admit (or immediately apply) capture events, drain released packets,
//! redraw pending overlays, flush, then block in poll(2) on the compositor
//! socket and the capture fd with a timeout derived from the next release
//! or keep-alive deadline.

mod dispatch;

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, trace, warn};
use wayland_client::globals::{registry_queue_init, GlobalList};
use wayland_client::protocol::{
    wl_compositor::WlCompositor, wl_keyboard::WlKeyboard, wl_output::WlOutput,
    wl_registry::WlRegistry, wl_seat::WlSeat, wl_shm::WlShm,
};
use wayland_client::{Connection, DispatchError, QueueHandle};
use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1, zxdg_output_v1::ZxdgOutputV1,
};
use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1;
use wayland_protocols_wlr::layer_shell::v1::client::{
    zwlr_layer_shell_v1::{self, ZwlrLayerShellV1},
    zwlr_layer_surface_v1::{Anchor, KeyboardInteractivity},
};
use wayland_protocols_wlr::virtual_pointer::v1::client::zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1;

use crate::capture::{CaptureBackend, CaptureEvent};
use crate::clock::MonotonicClock;
use crate::config::{Config, MAX_DRAWABLE_LAYERS};
use crate::entropy::EntropySource;
use crate::geometry::{GlobalSpace, OutputLayout};
use crate::overlay::DrawableLayer;
use crate::scheduler::{DelayScheduler, InputPacket, PacketPayload};
use crate::virtual_input::{
    keyboard_unauthorized, KeymapTracker, ScrollAxis, VirtualInputError, VirtualKeyboard,
    VirtualPointer,
};
use crate::walker::{CursorPosition, MotionOutcome};

/// Namespace under which the overlay layer surfaces are registered.
const LAYER_NAMESPACE: &str = "com.kicksecure.kloak";

/// Wayland-side handle for one bound output.
pub(crate) struct OutputHandle {
    output: WlOutput,
    /// Registry name, the identity used on global_remove
    registry_name: u32,
    xdg_output: Option<ZxdgOutputV1>,
}

/// The daemon context. One instance owns every piece of process state.
pub struct KloakState {
    config: Config,
    clock: MonotonicClock,
    entropy: EntropySource,

    // Compositor globals
    compositor: WlCompositor,
    shm: WlShm,
    /// Kept for the lifetime of the daemon; the virtual devices were
    /// created against it
    #[allow(dead_code)]
    seat: WlSeat,
    keyboard: Option<WlKeyboard>,
    layer_shell: ZwlrLayerShellV1,
    xdg_output_manager: Option<ZxdgOutputManagerV1>,

    // Output and overlay arenas, indexed by the same slot
    outputs: Vec<Option<OutputHandle>>,
    layers: Vec<Option<DrawableLayer>>,
    layout: OutputLayout,
    global_space: GlobalSpace,
    /// First strict layout verification has passed; gaps after this point
    /// are transient hot-unplug states and only warn
    layout_settled: bool,

    // Virtual devices and keymap mirror
    virtual_pointer: VirtualPointer,
    virtual_keyboard: VirtualKeyboard,
    keymap: KeymapTracker,

    // Delay engine and cursor model
    scheduler: DelayScheduler,
    cursor: CursorPosition,
    keepalive_deadline_ms: u64,

    // Capture backend
    capture: CaptureBackend,

    /// Fatal error raised inside an event handler, picked up by the loop
    pending_fatal: Option<anyhow::Error>,
}

/// Connect, bind globals, create virtual devices, and run the loop until a
/// fatal error.
pub fn run(config: Config) -> Result<()> {
    let conn = Connection::connect_to_env()
        .context("Could not connect to the Wayland display; is the compositor running?")?;
    let (globals, mut event_queue) =
        registry_queue_init::<KloakState>(&conn).context("Could not enumerate Wayland globals")?;
    let qh = event_queue.handle();

    let mut state = KloakState::bind(&config, &globals, &qh)?;

    // Pick up the outputs that were advertised before we attached.
    let advertised: Vec<(u32, u32)> = globals.contents().with_list(|list| {
        list.iter()
            .filter(|global| global.interface == "wl_output")
            .map(|global| (global.name, global.version))
            .collect()
    });
    for (name, version) in advertised {
        if version < 4 {
            warn!("ignoring wl_output {name} with version {version} < 4");
            continue;
        }
        state.allocate_output(globals.registry(), name, &qh);
    }

    // Two roundtrips: the first delivers seat capabilities and output
    // geometry, the second the keymap and any protocol error from the
    // virtual-keyboard creation (the "unauthorized" sentinel).
    for _ in 0..2 {
        event_queue
            .roundtrip(&mut state)
            .map_err(fatal_from_dispatch)?;
        state.check_fatal()?;
    }

    info!(
        "kloak running: max delay {} ms, seat {}, {} output(s)",
        state.config.max_delay_ms,
        state.config.seat,
        state.layout.initialized().count()
    );

    loop {
        event_queue
            .dispatch_pending(&mut state)
            .map_err(fatal_from_dispatch)?;
        state.check_fatal()?;

        state.pump_capture()?;
        state.drain_released();
        state.maybe_keepalive()?;
        state.check_fatal()?;
        state.draw_pending_layers(&qh);

        event_queue.flush().context("Could not flush the Wayland connection")?;

        let Some(guard) = event_queue.prepare_read() else {
            // Events already queued; dispatch them first.
            continue;
        };

        let timeout = state.poll_timeout();
        let display_ready = {
            let mut fds = [
                PollFd::new(guard.connection_fd(), PollFlags::POLLIN),
                PollFd::new(state.capture.poll_fd(), PollFlags::POLLIN),
            ];
            loop {
                match poll(&mut fds, timeout) {
                    Ok(_) => break,
                    Err(Errno::EINTR) => continue,
                    Err(errno) => return Err(anyhow!("poll failed: {errno}")),
                }
            }
            let wake = PollFlags::POLLIN | PollFlags::POLLERR | PollFlags::POLLHUP;
            fds[0].revents().is_some_and(|revents| revents.intersects(wake))
        };

        if display_ready {
            guard
                .read()
                .map_err(|error| fatal_from_wayland(&error))?;
        } else {
            drop(guard);
        }
    }
}

impl KloakState {
    /// Bind every required global and assemble the context.
    fn bind(config: &Config, globals: &GlobalList, qh: &QueueHandle<Self>) -> Result<Self> {
        let compositor: WlCompositor = globals
            .bind(qh, 5..=6, ())
            .context("Compositor does not offer wl_compositor >= 5")?;
        let shm: WlShm = globals
            .bind(qh, 2..=2, ())
            .context("Compositor does not offer wl_shm >= 2")?;
        let seat: WlSeat = globals
            .bind(qh, 9..=9, ())
            .context("Compositor does not offer wl_seat >= 9")?;
        let layer_shell: ZwlrLayerShellV1 = globals
            .bind(qh, 4..=4, ())
            .context("Compositor does not offer zwlr_layer_shell_v1 >= 4")?;
        let pointer_manager: ZwlrVirtualPointerManagerV1 = globals
            .bind(qh, 2..=2, ())
            .context("Compositor does not offer zwlr_virtual_pointer_manager_v1 >= 2")?;
        let keyboard_manager: ZwpVirtualKeyboardManagerV1 = globals
            .bind(qh, 1..=1, ())
            .context("Compositor does not offer zwp_virtual_keyboard_manager_v1")?;

        // The extended-output manager may legitimately show up after the
        // raw outputs; logical geometry is created retroactively then.
        let xdg_output_manager: Option<ZxdgOutputManagerV1> =
            match globals.bind(qh, 3..=3, ()) {
                Ok(manager) => Some(manager),
                Err(error) => {
                    warn!("zxdg_output_manager_v1 not bound yet: {error}");
                    None
                }
            };

        let virtual_pointer = VirtualPointer::new(&pointer_manager, &seat, qh);
        let virtual_keyboard = VirtualKeyboard::new(&keyboard_manager, &seat, qh);

        let mut entropy = EntropySource::open()?;
        let clock = MonotonicClock::start();
        let capture = CaptureBackend::new(&config.seat)?;

        let keepalive_deadline_ms =
            entropy.uniform_in_closed_interval(0, config.max_delay_ms)?;

        Ok(Self {
            config: config.clone(),
            clock,
            entropy,
            compositor,
            shm,
            seat,
            keyboard: None,
            layer_shell,
            xdg_output_manager,
            outputs: (0..MAX_DRAWABLE_LAYERS).map(|_| None).collect(),
            layers: (0..MAX_DRAWABLE_LAYERS).map(|_| None).collect(),
            layout: OutputLayout::new(),
            global_space: GlobalSpace::default(),
            layout_settled: false,
            virtual_pointer,
            virtual_keyboard,
            keymap: KeymapTracker::new(),
            scheduler: DelayScheduler::new(config.max_delay_ms),
            cursor: CursorPosition::default(),
            keepalive_deadline_ms,
            capture,
            pending_fatal: None,
        })
    }

    /// Record a fatal error for the loop to pick up. The first one wins.
    pub(crate) fn fail(&mut self, error: anyhow::Error) {
        if self.pending_fatal.is_none() {
            self.pending_fatal = Some(error);
        }
    }

    fn check_fatal(&mut self) -> Result<()> {
        match self.pending_fatal.take() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Bind a newly advertised output into a free arena slot and give it
    /// its overlay surface.
    pub(crate) fn allocate_output(
        &mut self,
        registry: &WlRegistry,
        registry_name: u32,
        qh: &QueueHandle<Self>,
    ) {
        let Some(slot) = self.outputs.iter().position(|entry| entry.is_none()) else {
            warn!("out of output slots, ignoring output {registry_name}");
            return;
        };

        let output: WlOutput = registry.bind(registry_name, 4, qh, slot);
        self.layout.occupy(slot);

        let xdg_output = self
            .xdg_output_manager
            .as_ref()
            .map(|manager| manager.get_xdg_output(&output, qh, slot));

        let surface = self.compositor.create_surface(qh, ());
        // Display-only layer: an empty input region lets every click pass
        // through to whatever is underneath.
        let region = self.compositor.create_region(qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();

        let layer_surface = self.layer_shell.get_layer_surface(
            &surface,
            Some(&output),
            zwlr_layer_shell_v1::Layer::Overlay,
            LAYER_NAMESPACE.to_string(),
            qh,
            slot,
        );
        layer_surface.set_anchor(Anchor::Top | Anchor::Bottom | Anchor::Left | Anchor::Right);
        layer_surface.set_exclusive_zone(-1);
        layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);
        surface.commit();

        self.outputs[slot] = Some(OutputHandle {
            output,
            registry_name,
            xdg_output,
        });
        self.layers[slot] = Some(DrawableLayer::new(slot, surface, layer_surface));
        debug!(slot, registry_name, "output bound");
    }

    /// Tear down the output bound under `registry_name`, tolerating the
    /// transient layout gap this leaves.
    pub(crate) fn remove_output(&mut self, registry_name: u32) {
        let Some(slot) = self.outputs.iter().position(|entry| {
            entry
                .as_ref()
                .is_some_and(|handle| handle.registry_name == registry_name)
        }) else {
            return;
        };

        if let Some(mut layer) = self.layers[slot].take() {
            layer.destroy();
        }
        if let Some(handle) = self.outputs[slot].take() {
            if let Some(xdg_output) = handle.xdg_output {
                xdg_output.destroy();
            }
            handle.output.release();
        }
        self.layout.clear(slot);
        info!(slot, registry_name, "output removed");

        self.recompute_space(true);
        // Pull the cursor back onto a surviving output if it was stranded.
        let outcome = self
            .cursor
            .apply_relative(&self.layout, &self.global_space, 0.0, 0.0);
        self.flag_motion(outcome);
    }

    /// Late-bound extended-output manager: create the missing logical
    /// geometry handles for outputs bound before it appeared.
    pub(crate) fn adopt_xdg_output_manager(
        &mut self,
        manager: ZxdgOutputManagerV1,
        qh: &QueueHandle<Self>,
    ) {
        for (slot, entry) in self.outputs.iter_mut().enumerate() {
            if let Some(handle) = entry {
                if handle.xdg_output.is_none() {
                    handle.xdg_output = Some(manager.get_xdg_output(&handle.output, qh, slot));
                }
            }
        }
        self.xdg_output_manager = Some(manager);
        info!("extended-output manager bound, logical geometry requested");
    }

    /// Recompute the global space. Strict until the first layout settles,
    /// tolerant during removal and later churn.
    pub(crate) fn recompute_space(&mut self, tolerate_gaps: bool) {
        match self.layout.recompute_global_space(tolerate_gaps) {
            Ok(space) => {
                self.global_space = space;
                // Settled only once every bound output has reported real
                // geometry; a gap found before that is an init-time gap
                // and stays fatal.
                if !space.is_empty() && self.layout.all_initialized() {
                    self.layout_settled = true;
                }
                // Geometry moved under the overlays; repaint all of them.
                for layer in self.layers.iter_mut().flatten() {
                    layer.frame_pending = true;
                }
            }
            Err(error) => self.fail(anyhow::Error::new(error)),
        }
    }

    /// Pull every pending capture event; motion applies immediately,
    /// everything else is admitted into the delay queue.
    fn pump_capture(&mut self) -> Result<()> {
        let extent = (self.global_space.width, self.global_space.height);
        let mut events = Vec::new();
        self.capture
            .drain_events(extent, |event| events.push(event))
            .context("Input capture backend failed")?;

        let now = self.clock.now_ms();
        for event in events {
            self.handle_capture_event(event, now);
        }
        Ok(())
    }

    fn handle_capture_event(&mut self, event: CaptureEvent, now_ms: u64) {
        match event {
            CaptureEvent::MotionRelative { dx, dy } => {
                let outcome =
                    self.cursor
                        .apply_relative(&self.layout, &self.global_space, dx, dy);
                self.flag_motion(outcome);
                self.emit_cursor_position();
            }
            CaptureEvent::MotionAbsolute { x, y } => {
                let global_x = self.global_space.x as f64 + x;
                let global_y = self.global_space.y as f64 + y;
                let outcome =
                    self.cursor
                        .apply_absolute(&self.layout, &self.global_space, global_x, global_y);
                self.flag_motion(outcome);
                self.emit_cursor_position();
            }
            CaptureEvent::Button { button, pressed } => {
                self.admit(PacketPayload::Button { button, pressed }, now_ms);
            }
            CaptureEvent::Scroll {
                source,
                horizontal,
                vertical,
            } => {
                self.admit(
                    PacketPayload::Scroll {
                        source,
                        horizontal,
                        vertical,
                    },
                    now_ms,
                );
            }
            CaptureEvent::Key { key, pressed } => {
                self.admit(PacketPayload::Key { key, pressed }, now_ms);
            }
        }
    }

    fn admit(&mut self, payload: PacketPayload, now_ms: u64) {
        match self.scheduler.admit(payload, now_ms, &mut self.entropy) {
            Ok(release) => trace!(release, "packet admitted"),
            Err(error) => self.fail(anyhow::Error::new(error).context("Random source failed")),
        }
    }

    /// Drain and emit every packet whose release time has arrived.
    fn drain_released(&mut self) {
        let now = self.clock.now_ms();
        let mut ready = Vec::new();
        self.scheduler.drain_ready(now, |packet| ready.push(packet));
        for packet in ready {
            self.emit_packet(packet);
        }
    }

    fn emit_packet(&mut self, packet: InputPacket) {
        let time = self.clock.protocol_time();
        match packet.payload {
            PacketPayload::Key { key, pressed } => {
                // Modifier snapshot and key go out back to back in the same
                // iteration; nothing may interleave.
                let Some(snapshot) = self.keymap.modifier_snapshot() else {
                    trace!(key, "dropping key released before a keymap arrived");
                    return;
                };
                self.virtual_keyboard.modifiers(snapshot);
                self.virtual_keyboard.key(time, key, pressed);
                self.keymap.advance_key(key, pressed);
            }
            PacketPayload::Button { button, pressed } => {
                self.virtual_pointer.button(time, button, pressed);
                self.virtual_pointer.frame();
            }
            PacketPayload::Scroll {
                source,
                horizontal,
                vertical,
            } => {
                self.virtual_pointer.axis_source(source);
                if let Some(value) = vertical {
                    self.virtual_pointer.axis(time, ScrollAxis::Vertical, value);
                }
                if let Some(value) = horizontal {
                    self.virtual_pointer.axis(time, ScrollAxis::Horizontal, value);
                }
                self.virtual_pointer.frame();
            }
        }
    }

    /// Forward the current cursor position to the compositor.
    fn emit_cursor_position(&mut self) {
        if self.global_space.is_empty() {
            return;
        }
        let time = self.clock.protocol_time();
        let x = (self.cursor.x - self.global_space.x as f64).round().max(0.0) as u32;
        let y = (self.cursor.y - self.global_space.y as f64).round().max(0.0) as u32;
        self.virtual_pointer.motion_absolute(
            time,
            x,
            y,
            self.global_space.width,
            self.global_space.height,
        );
        self.virtual_pointer.frame();

        // Any pointer activity counts for idle purposes.
        self.reschedule_keepalive();
    }

    /// Emit the idle keep-alive when its randomized deadline expires: an
    /// absolute motion at the unchanged cursor pixel, so compositors do not
    /// hide the cursor while real events sit in the delay queue.
    fn maybe_keepalive(&mut self) -> Result<()> {
        let now = self.clock.now_ms();
        if now < self.keepalive_deadline_ms {
            return Ok(());
        }
        if self.global_space.is_empty() {
            // Nothing to report yet; rearm so the poll timeout stays sane.
            self.reschedule_keepalive();
            return Ok(());
        }
        self.emit_cursor_position();
        trace!("cursor keep-alive emitted");
        Ok(())
    }

    fn reschedule_keepalive(&mut self) {
        let now = self.clock.now_ms();
        match self
            .entropy
            .uniform_in_closed_interval(0, self.config.max_delay_ms)
        {
            Ok(delay) => self.keepalive_deadline_ms = now + delay,
            Err(error) => self.fail(anyhow::Error::new(error).context("Random source failed")),
        }
    }

    /// Flag the overlays the cursor left and entered for redraw.
    fn flag_motion(&mut self, outcome: MotionOutcome) {
        for slot in [outcome.from, outcome.to].into_iter().flatten() {
            if let Some(layer) = self.layers[slot].as_mut() {
                layer.frame_pending = true;
            }
        }
    }

    /// Redraw every overlay that both needs and can take a frame.
    fn draw_pending_layers(&mut self, qh: &QueueHandle<Self>) {
        let cursor_pixel = self.layout.locate(
            self.cursor.x.round() as i32,
            self.cursor.y.round() as i32,
        );
        for layer in self.layers.iter_mut().flatten() {
            if !layer.frame_pending || !layer.frame_released || !layer.configured {
                continue;
            }
            let cursor_local = cursor_pixel
                .filter(|local| local.output == layer.slot)
                .map(|local| (local.x, local.y));
            layer.draw_frame(cursor_local, qh);
        }
    }

    /// Poll timeout until the next scheduler release or keep-alive
    /// deadline, whichever is sooner.
    fn poll_timeout(&self) -> PollTimeout {
        let now = self.clock.now_ms();
        let next = match self.scheduler.next_release() {
            Some(release) => release.min(self.keepalive_deadline_ms),
            None => self.keepalive_deadline_ms,
        };
        let wait = next.saturating_sub(now).min(u16::MAX as u64) as u16;
        PollTimeout::from(wait)
    }
}

/// Map a dispatch failure to the daemon's fatal diagnostics, recognizing
/// the virtual-keyboard authorization sentinel.
fn fatal_from_dispatch(error: DispatchError) -> anyhow::Error {
    match error {
        DispatchError::Backend(backend) => fatal_from_wayland(&backend),
        other => anyhow!("Wayland dispatch failed: {other}"),
    }
}

fn fatal_from_wayland(error: &wayland_client::backend::WaylandError) -> anyhow::Error {
    if keyboard_unauthorized(error) {
        anyhow::Error::new(VirtualInputError::Unauthorized)
    } else {
        anyhow!("Lost the Wayland connection: {error}")
    }
}
