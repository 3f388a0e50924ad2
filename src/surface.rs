//! Render surface binding: GBM scanout surface plus EGL context
//!
//! Creating a working ES2 context over a GBM surface is the actual check
//! here: if the driver stack is misconfigured, one of the steps below
//! (display init, config selection, context/surface creation, make
//! current) fails, and every one of them is fail-fast.

use std::ffi::CStr;
use std::os::fd::{AsFd, AsRawFd};
use std::os::raw::c_void;

use gbm_sys::{
    gbm_bo, gbm_bo_get_handle, gbm_bo_get_stride, gbm_create_device, gbm_device,
    gbm_device_destroy, gbm_device_get_backend_name, gbm_surface, gbm_surface_create,
    gbm_surface_destroy, gbm_surface_lock_front_buffer, gbm_surface_release_buffer,
    gbm_bo_flags,
};
use khronos_egl as egl;
use tracing::{debug, info};

use crate::device::Card;
use crate::error::Error;
use crate::Result;

/// 32-bit packed RGB, no alpha ('XR24'). Fixed scanout format.
const GBM_FORMAT_XRGB8888: u32 = 0x3432_5258;

const SURFACELESS_EXTENSION: &str = "EGL_KHR_surfaceless_context";

type EglInstance = egl::DynamicInstance<egl::EGL1_4>;

/// Exactly one config must have come back from a capped-at-one
/// `choose_config` request; zero means nothing on the stack satisfies
/// the attribute minimums.
fn single_config<T>(mut configs: Vec<T>) -> Result<T> {
    if configs.len() != 1 {
        return Err(Error::ConfigSelection(configs.len()));
    }
    Ok(configs.remove(0))
}

/// GBM device and scanout/rendering surface at the selected mode's size.
///
/// Owns a duplicated device descriptor so the GBM objects stay valid
/// independent of the caller's [`Card`].
pub struct GbmScanout {
    device: *mut gbm_device,
    surface: *mut gbm_surface,
    width: u32,
    height: u32,
    // Keeps the descriptor the GBM device was created on alive.
    _fd: Card,
}

impl GbmScanout {
    pub fn create(card: &Card, width: u32, height: u32) -> Result<Self> {
        let fd = card.try_clone()?;

        let device = unsafe { gbm_create_device(fd.as_fd().as_raw_fd()) };
        if device.is_null() {
            return Err(Error::Gbm("gbm_create_device failed".into()));
        }

        let backend = unsafe { CStr::from_ptr(gbm_device_get_backend_name(device)) };
        info!("gbm backend: {}", backend.to_string_lossy());

        let usage =
            gbm_bo_flags::GBM_BO_USE_SCANOUT as u32 | gbm_bo_flags::GBM_BO_USE_RENDERING as u32;
        let surface =
            unsafe { gbm_surface_create(device, width, height, GBM_FORMAT_XRGB8888, usage) };
        if surface.is_null() {
            unsafe { gbm_device_destroy(device) };
            return Err(Error::Gbm(format!(
                "gbm_surface_create {width}x{height} failed"
            )));
        }

        Ok(GbmScanout {
            device,
            surface,
            width,
            height,
            _fd: fd,
        })
    }

    fn device_ptr(&self) -> *mut gbm_device {
        self.device
    }

    fn surface_ptr(&self) -> *mut gbm_surface {
        self.surface
    }

    /// Take the buffer the last buffer swap rendered into. Valid only
    /// after a completed `swap_buffers` on the bound EGL surface.
    pub fn lock_front_buffer(&self) -> Result<FrontBuffer> {
        let bo = unsafe { gbm_surface_lock_front_buffer(self.surface) };
        if bo.is_null() {
            return Err(Error::Gbm("gbm_surface_lock_front_buffer failed".into()));
        }
        let gem_handle = std::num::NonZeroU32::new(unsafe { gbm_bo_get_handle(bo).u32_ })
            .ok_or_else(|| {
                unsafe { gbm_surface_release_buffer(self.surface, bo) };
                Error::Gbm("front buffer has no GEM handle".into())
            })?;
        Ok(FrontBuffer {
            bo,
            surface: self.surface,
            gem_handle: gem_handle.into(),
            width: self.width,
            height: self.height,
        })
    }
}

impl Drop for GbmScanout {
    fn drop(&mut self) {
        unsafe {
            gbm_surface_destroy(self.surface);
            gbm_device_destroy(self.device);
        }
    }
}

/// A locked front buffer, released back to its surface on drop.
///
/// Must not outlive the [`GbmScanout`] it came from; the display context
/// enforces that by dropping its buffers before the render surface.
pub struct FrontBuffer {
    bo: *mut gbm_bo,
    surface: *mut gbm_surface,
    gem_handle: drm::buffer::Handle,
    width: u32,
    height: u32,
}

impl FrontBuffer {
    pub fn stride(&self) -> u32 {
        unsafe { gbm_bo_get_stride(self.bo) }
    }
}

impl drm::buffer::Buffer for FrontBuffer {
    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn format(&self) -> drm::buffer::DrmFourcc {
        drm::buffer::DrmFourcc::Xrgb8888
    }

    fn pitch(&self) -> u32 {
        self.stride()
    }

    fn handle(&self) -> drm::buffer::Handle {
        self.gem_handle
    }
}

impl Drop for FrontBuffer {
    fn drop(&mut self) {
        unsafe { gbm_surface_release_buffer(self.surface, self.bo) };
    }
}

/// EGL display, context, and window surface bound over a GBM surface.
pub struct EglBinding {
    instance: EglInstance,
    display: egl::Display,
    context: egl::Context,
    surface: egl::Surface,
}

impl EglBinding {
    /// Connect EGL to the GBM device, validate the platform, and build a
    /// current ES2 context with a window surface over the GBM surface.
    pub fn bind(gbm: &GbmScanout) -> Result<Self> {
        let instance = unsafe { EglInstance::load_required() }
            .map_err(|e| Error::Egl(format!("loading libEGL: {e}")))?;

        let display = unsafe { instance.get_display(gbm.device_ptr() as *mut c_void) }
            .ok_or_else(|| Error::Egl("no EGL display for GBM device".into()))?;
        let (major, minor) = instance.initialize(display)?;

        let extensions = instance
            .query_string(Some(display), egl::EXTENSIONS)?
            .to_string_lossy()
            .into_owned();
        let apis = instance
            .query_string(Some(display), egl::CLIENT_APIS)?
            .to_string_lossy()
            .into_owned();
        info!("EGL {}.{}, client APIs: {}", major, minor, apis);
        debug!("EGL extensions: {}", extensions);

        // Without surfaceless-context support this binding cannot work at
        // all; that is a configuration error, not a retryable one.
        if !extensions
            .split_whitespace()
            .any(|e| e == SURFACELESS_EXTENSION)
        {
            return Err(Error::MissingExtension(SURFACELESS_EXTENSION));
        }

        instance.bind_api(egl::OPENGL_ES_API)?;

        let config_attribs = [
            egl::SURFACE_TYPE,
            egl::WINDOW_BIT,
            egl::RENDERABLE_TYPE,
            egl::OPENGL_ES2_BIT,
            egl::RED_SIZE,
            1,
            egl::GREEN_SIZE,
            1,
            egl::BLUE_SIZE,
            1,
            egl::ALPHA_SIZE,
            0,
            egl::DEPTH_SIZE,
            1,
            egl::NONE,
        ];

        // The criteria are all minimums, which real drivers satisfy with
        // dozens of configs; request a single one and fail only when the
        // stack offers none at all.
        let mut configs = Vec::with_capacity(1);
        instance.choose_config(display, &config_attribs, &mut configs)?;
        let config = single_config(configs)?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = instance.create_context(display, config, None, &context_attribs)?;

        let surface = unsafe {
            instance.create_window_surface(
                display,
                config,
                gbm.surface_ptr() as egl::NativeWindowType,
                None,
            )
        }?;

        instance.make_current(display, Some(surface), Some(surface), Some(context))?;
        info!("EGL context current over {}x{} GBM surface", gbm.width, gbm.height);

        Ok(EglBinding {
            instance,
            display,
            context,
            surface,
        })
    }

    /// Post the back buffer; afterwards the rendered frame can be locked
    /// out of the GBM surface.
    pub fn swap_buffers(&self) -> Result<()> {
        self.instance.swap_buffers(self.display, self.surface)?;
        Ok(())
    }
}

impl Drop for EglBinding {
    fn drop(&mut self) {
        // Unbind, then surface -> context -> terminate.
        let _ = self.instance.make_current(self.display, None, None, None);
        if let Err(e) = self.instance.destroy_surface(self.display, self.surface) {
            debug!("destroy_surface: {}", e);
        }
        if let Err(e) = self.instance.destroy_context(self.display, self.context) {
            debug!("destroy_context: {}", e);
        }
        if let Err(e) = self.instance.terminate(self.display) {
            debug!("terminate: {}", e);
        }
    }
}

/// The full render binding. Field order gives the strict destroy order:
/// EGL objects go before the GBM surface and device they wrap.
pub struct RenderSurface {
    pub egl: EglBinding,
    pub gbm: GbmScanout,
}

impl RenderSurface {
    pub fn bind(card: &Card, width: u32, height: u32) -> Result<Self> {
        let gbm = GbmScanout::create(card, width, height)?;
        let egl = EglBinding::bind(&gbm)?;
        Ok(RenderSurface { egl, gbm })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_config_accepts_one() {
        assert_eq!(single_config(vec![7u32]).unwrap(), 7);
    }

    /// A capped request can only return zero or one config; zero is the
    /// unsatisfiable-attributes failure.
    #[test]
    fn test_single_config_rejects_empty() {
        match single_config(Vec::<u32>::new()) {
            Err(Error::ConfigSelection(found)) => assert_eq!(found, 0),
            other => panic!("expected ConfigSelection error, got {other:?}"),
        }
    }
}
