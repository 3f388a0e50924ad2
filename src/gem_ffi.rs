//! Raw ioctl payloads for the vendor GEM interfaces
//!
//! Hand-written `#[repr(C)]` mirrors of the structures in the libdrm
//! vendor headers (i915_drm.h, radeon_drm.h, amdgpu_drm.h,
//! nouveau_drm.h), plus the ioctl request-code arithmetic. The amdgpu
//! payloads are in/out unions at the ABI level; that union stays confined
//! to this module.

#![allow(non_camel_case_types)]

use std::io;
use std::os::raw::c_ulong;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const DRM_IOCTL_TYPE: u32 = 0x64; // 'd'
const DRM_COMMAND_BASE: u32 = 0x40;

const fn ioc(dir: u32, nr: u32, size: usize) -> c_ulong {
    ((dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_TYPE << 8) | nr) as c_ulong
}

const fn iow<T>(nr: u32) -> c_ulong {
    ioc(IOC_WRITE, nr, std::mem::size_of::<T>())
}

const fn iowr<T>(nr: u32) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, std::mem::size_of::<T>())
}

/// Issue one ioctl, mapping the errno convention to `io::Error`.
///
/// # Safety
/// `req` must point to a payload matching the request code's layout.
pub unsafe fn drm_ioctl<T>(
    fd: std::os::raw::c_int,
    request: c_ulong,
    req: *mut T,
    call: &'static str,
) -> crate::Result<()> {
    let ret = libc::ioctl(fd, request as _, req);
    if ret < 0 {
        return Err(crate::error::Error::Ioctl {
            call,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

// -------------------------------------------------------------------------
// Core GEM

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_gem_close {
    pub handle: u32,
    pub pad: u32,
}

pub const DRM_IOCTL_GEM_CLOSE: c_ulong = iow::<drm_gem_close>(0x09);

// -------------------------------------------------------------------------
// i915

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_i915_gem_create {
    pub size: u64,
    pub handle: u32,
    pub pad: u32,
}

/// Legacy GEM mmap: the kernel maps the object and hands back a CPU
/// pointer in `addr_ptr`.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_i915_gem_mmap {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
    pub flags: u64,
}

pub const DRM_IOCTL_I915_GEM_CREATE: c_ulong =
    iowr::<drm_i915_gem_create>(DRM_COMMAND_BASE + 0x1b);
pub const DRM_IOCTL_I915_GEM_MMAP: c_ulong = iowr::<drm_i915_gem_mmap>(DRM_COMMAND_BASE + 0x1e);

// -------------------------------------------------------------------------
// radeon

pub const RADEON_GEM_DOMAIN_GTT: u32 = 0x2;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_radeon_gem_create {
    pub size: u64,
    pub alignment: u64,
    pub handle: u32,
    pub initial_domain: u32,
    pub flags: u32,
}

/// Returns an offset to be passed to `mmap(2)` on the device fd.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_radeon_gem_mmap {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
}

pub const DRM_IOCTL_RADEON_GEM_CREATE: c_ulong =
    iowr::<drm_radeon_gem_create>(DRM_COMMAND_BASE + 0x1d);
pub const DRM_IOCTL_RADEON_GEM_MMAP: c_ulong =
    iowr::<drm_radeon_gem_mmap>(DRM_COMMAND_BASE + 0x1e);

// -------------------------------------------------------------------------
// amdgpu

pub const AMDGPU_GEM_DOMAIN_GTT: u64 = 0x2;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_create_in {
    pub bo_size: u64,
    pub alignment: u64,
    pub domains: u64,
    pub domain_flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_create_out {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_gem_create {
    pub r#in: drm_amdgpu_gem_create_in,
    pub out: drm_amdgpu_gem_create_out,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_mmap_in {
    pub handle: u32,
    pub pad: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_amdgpu_gem_mmap_out {
    pub addr_ptr: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union drm_amdgpu_gem_mmap {
    pub r#in: drm_amdgpu_gem_mmap_in,
    pub out: drm_amdgpu_gem_mmap_out,
}

pub const DRM_IOCTL_AMDGPU_GEM_CREATE: c_ulong =
    iowr::<drm_amdgpu_gem_create>(DRM_COMMAND_BASE + 0x00);
pub const DRM_IOCTL_AMDGPU_GEM_MMAP: c_ulong =
    iowr::<drm_amdgpu_gem_mmap>(DRM_COMMAND_BASE + 0x01);

// -------------------------------------------------------------------------
// nouveau

pub const NOUVEAU_GEM_DOMAIN_GART: u32 = 0x2;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_nouveau_gem_info {
    pub handle: u32,
    pub domain: u32,
    pub size: u64,
    pub offset: u64,
    /// mmap offset on the device fd.
    pub map_handle: u64,
    pub tile_mode: u32,
    pub tile_flags: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct drm_nouveau_gem_new {
    pub info: drm_nouveau_gem_info,
    pub channel_hint: u32,
    pub align: u32,
}

pub const DRM_IOCTL_NOUVEAU_GEM_NEW: c_ulong =
    iowr::<drm_nouveau_gem_new>(DRM_COMMAND_BASE + 0x40);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_layouts_match_abi() {
        assert_eq!(std::mem::size_of::<drm_gem_close>(), 8);
        assert_eq!(std::mem::size_of::<drm_i915_gem_create>(), 16);
        assert_eq!(std::mem::size_of::<drm_i915_gem_mmap>(), 40);
        assert_eq!(std::mem::size_of::<drm_radeon_gem_create>(), 32);
        assert_eq!(std::mem::size_of::<drm_radeon_gem_mmap>(), 32);
        assert_eq!(std::mem::size_of::<drm_amdgpu_gem_create>(), 32);
        assert_eq!(std::mem::size_of::<drm_amdgpu_gem_mmap>(), 8);
        assert_eq!(std::mem::size_of::<drm_nouveau_gem_info>(), 40);
        assert_eq!(std::mem::size_of::<drm_nouveau_gem_new>(), 48);
    }

    #[test]
    fn test_request_code_arithmetic() {
        // _IOW('d', 0x09, 8 bytes)
        assert_eq!(DRM_IOCTL_GEM_CLOSE, 0x4008_6409);
        // _IOWR('d', 0x5b, 16 bytes)
        assert_eq!(DRM_IOCTL_I915_GEM_CREATE, 0xc010_645b);
    }
}
