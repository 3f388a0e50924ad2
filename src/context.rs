//! The display lifecycle: acquisition, render binding, frame presentation,
//! and strictly ordered teardown
//!
//! Acquisition order is device -> resolution -> CRTC snapshot -> render
//! surface -> flips. [`DisplayContext::teardown`] unwinds in exact reverse:
//! flip wait -> framebuffers/buffers -> EGL surface/context -> GBM
//! surface/device -> CRTC restore -> master release -> device close. The
//! order is carried by the code structure (RAII drop order inside
//! [`RenderSurface`], explicit sequence here), not by convention at call
//! sites.

use std::time::Duration;

use drm::control::{framebuffer, Device as ControlDevice, Mode};
use drm::Device;
use tracing::{debug, info, warn};

use crate::device::{self, Card};
use crate::error::Error;
use crate::flip::PageFlipCoordinator;
use crate::kms::{self, connector_handle, crtc_handle, CrtcStateGuard, Selection};
use crate::surface::{FrontBuffer, RenderSurface};
use crate::Result;

/// A presented frame: the locked GBM buffer and its DRM framebuffer.
struct Frame {
    buffer: FrontBuffer,
    fb: framebuffer::Handle,
}

/// Owned aggregate for one display-lifecycle run. Single-threaded; mutated
/// only by the sequential setup/present/teardown calls.
pub struct DisplayContext {
    card: Card,
    selection: Selection,
    mode: Mode,
    saved: CrtcStateGuard,
    render: Option<RenderSurface>,
    /// Buffer currently scanned out.
    current: Option<Frame>,
    /// Buffer an outstanding flip is moving onto the screen.
    next: Option<Frame>,
    flip: PageFlipCoordinator,
    is_master: bool,
}

impl DisplayContext {
    /// Discover a usable device and display output, select a mode, and
    /// snapshot the CRTC before anything is mutated.
    pub fn acquire() -> Result<Self> {
        let card = device::open_first_with_output()?;

        // Master is needed for mode-setting; the kernel grants it
        // implicitly to the only open, so a refusal here is not fatal yet.
        let is_master = match card.acquire_master_lock() {
            Ok(()) => true,
            Err(e) => {
                debug!("could not become DRM master: {}", e);
                false
            }
        };

        let topology = kms::read_topology(&card)?;
        let selection = kms::resolve(&topology)?;
        let mode = kms::lookup_mode(&card, &selection)?;
        info!(
            "mode chosen [{}]: h: {}, v: {}",
            selection.mode.name, selection.mode.hdisplay, selection.mode.vdisplay
        );

        let saved = CrtcStateGuard::capture(&card, selection.crtc_id)?;

        Ok(DisplayContext {
            card,
            selection,
            mode,
            saved,
            render: None,
            current: None,
            next: None,
            flip: PageFlipCoordinator::new(),
            is_master,
        })
    }

    /// Create the GBM surface and EGL context at the selected mode's
    /// dimensions and make the context current.
    pub fn bind_render_surface(&mut self) -> Result<()> {
        let (width, height) = (
            u32::from(self.selection.mode.hdisplay),
            u32::from(self.selection.mode.vdisplay),
        );
        self.render = Some(RenderSurface::bind(&self.card, width, height)?);
        Ok(())
    }

    /// Swap the EGL surface and put the produced buffer on screen: the
    /// first frame programs the CRTC, later frames go through an
    /// event-generating page flip.
    pub fn present_frame(&mut self, flip_timeout: Duration) -> Result<()> {
        let render = self.render.as_ref().ok_or(Error::NoRenderSurface)?;

        render.egl.swap_buffers()?;
        let buffer = render.gbm.lock_front_buffer()?;
        let fb = self.card.add_framebuffer(&buffer, 24, 32)?;
        let frame = Frame { buffer, fb };

        if self.current.is_none() {
            let set = self.card.set_crtc(
                crtc_handle(self.selection.crtc_id)?,
                Some(fb),
                (0, 0),
                &[connector_handle(self.selection.connector_id)?],
                Some(self.mode),
            );
            if let Err(e) = set {
                self.release_frame(frame);
                return Err(e.into());
            }
            self.current = Some(frame);
            debug!("initial frame set on crtc {}", self.selection.crtc_id);
            return Ok(());
        }

        // Wait out a still-pending flip before queueing another. Once it
        // completed, the last submitted buffer is the one on screen, and
        // the buffer it replaced can be retired.
        self.flip.wait_idle(&self.card, flip_timeout)?;
        if let Some(promoted) = self.next.take() {
            if let Some(retired) = self.current.replace(promoted) {
                self.release_frame(retired);
            }
        }

        if let Err(e) = self.flip.submit(&self.card, self.selection.crtc_id, frame.fb) {
            self.release_frame(frame);
            return Err(e);
        }
        self.next = Some(frame);
        Ok(())
    }

    fn release_frame(&self, frame: Frame) {
        if let Err(e) = self.card.destroy_framebuffer(frame.fb) {
            warn!("destroy_framebuffer: {}", e);
        }
        drop(frame.buffer);
    }

    /// Unwind everything in strict reverse acquisition order. Consumes the
    /// context; the device handle closes when it is dropped at the end.
    pub fn teardown(mut self, flip_timeout: Duration) -> Result<()> {
        let mut first_error: Option<Error> = None;

        match self.flip.wait_idle(&self.card, flip_timeout) {
            Ok(()) => {}
            Err(e @ Error::FlipTimeout(_)) => {
                // Destroying the render stack under a pending flip is
                // driver-undefined; leak it and still restore the CRTC.
                warn!("{}; leaking render surface", e);
                std::mem::forget(self.render.take());
                std::mem::forget(self.next.take());
                std::mem::forget(self.current.take());
                first_error = Some(e);
            }
            Err(e) => first_error = Some(e),
        }

        // Framebuffers and their buffers go before the surfaces they
        // reference, flip-order: next, then current.
        for frame in [self.next.take(), self.current.take()].into_iter().flatten() {
            self.release_frame(frame);
        }

        // EGL surface -> context -> terminate -> GBM surface -> device.
        drop(self.render.take());

        if let Err(e) = self.saved.restore(&self.card, self.selection.connector_id) {
            warn!("CRTC restore failed: {}", e);
            first_error.get_or_insert(e);
        }

        if self.is_master {
            if let Err(e) = self.card.release_master_lock() {
                debug!("release_master_lock: {}", e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
