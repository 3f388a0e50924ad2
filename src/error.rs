//! Error types for the graphics stack checks

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DRM subsystem unavailable (no /dev/dri device nodes)")]
    DriverUnavailable,

    #[error("no DRM device node could be opened")]
    NoDevice,

    #[error("devices opened, but none exposes a connected display output")]
    NoViableDisplay,

    #[error("no active connector found")]
    NoActiveConnector,

    #[error("no active encoder found")]
    NoActiveEncoder,

    #[error("KMS object id is zero")]
    InvalidId,

    #[error("required EGL extension missing: {0}")]
    MissingExtension(&'static str),

    #[error("EGL config selection matched {0} configurations, expected exactly 1")]
    ConfigSelection(usize),

    #[error("EGL error: {0}")]
    Egl(String),

    #[error("GBM error: {0}")]
    Gbm(String),

    #[error("page flip already pending")]
    FlipPending,

    #[error("page flip did not complete within {0:?}")]
    FlipTimeout(Duration),

    #[error("render surface not bound")]
    NoRenderSurface,

    #[error("GEM read-back mismatch at slot {slot}: wrote {expected:#010x}, read {found:#010x}")]
    GemVerify {
        slot: usize,
        expected: u32,
        found: u32,
    },

    #[error("{call} failed: {source}")]
    Ioctl {
        call: &'static str,
        source: std::io::Error,
    },

    #[error("environment check failed: {0}")]
    Environment(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<khronos_egl::Error> for Error {
    fn from(e: khronos_egl::Error) -> Self {
        Error::Egl(e.to_string())
    }
}
