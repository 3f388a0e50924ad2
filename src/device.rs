//! DRM device node discovery
//!
//! Probes `/dev/dri/card0` .. `card15` and hands out an owned [`Card`]
//! handle. Two selection policies exist because the checks need different
//! things: the plain device and GEM checks take any node that opens, while
//! the display lifecycle needs a node that actually drives an output.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use drm::control::Device as ControlDevice;
use drm::Device;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::kms;
use crate::Result;

/// Upper bound on probed card minors, matching the kernel's DRM_MAX_MINOR.
pub const MAX_CARDS: u32 = 16;

/// An owned, open DRM device node.
pub struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Open a device node read-write, non-blocking, close-on-exec.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
            .open(path)?;
        Ok(Card(file))
    }

    /// Duplicate the underlying descriptor (shares the open file description).
    pub fn try_clone(&self) -> std::io::Result<Self> {
        Ok(Card(self.0.try_clone()?))
    }

    /// Kernel driver name for this node, e.g. "i915" or "amdgpu".
    pub fn driver_name(&self) -> Result<String> {
        let driver = self.get_driver()?;
        Ok(driver.name().to_string_lossy().into_owned())
    }
}

/// Path of the Nth card node.
pub fn card_path(minor: u32) -> PathBuf {
    PathBuf::from(format!("/dev/dri/card{minor}"))
}

/// Whether the DRM subsystem is present at all. Checked before enumeration
/// so "driver not loaded" stays distinguishable from "no usable node".
pub fn driver_available() -> bool {
    let Ok(entries) = std::fs::read_dir("/dev/dri") else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.file_name().to_string_lossy().starts_with("card"))
}

/// All card node paths that currently exist.
pub fn existing_card_paths() -> Vec<PathBuf> {
    (0..MAX_CARDS)
        .map(card_path)
        .filter(|p| p.exists())
        .collect()
}

/// First-viable policy: the first node that opens wins.
pub fn open_first_card() -> Result<Card> {
    if !driver_available() {
        return Err(Error::DriverUnavailable);
    }
    for path in existing_card_paths() {
        match Card::open(&path) {
            Ok(card) => {
                info!("opened {}", path.display());
                return Ok(card);
            }
            Err(e) => {
                debug!("skipping {}: {}", path.display(), e);
            }
        }
    }
    Err(Error::NoDevice)
}

/// First-with-active-output policy: open each candidate and accept the
/// first whose resources report a connected connector with at least one
/// mode. Nodes that fail to open or expose no output are skipped.
pub fn open_first_with_output() -> Result<Card> {
    if !driver_available() {
        return Err(Error::DriverUnavailable);
    }

    let mut any_opened = false;
    for path in existing_card_paths() {
        let card = match Card::open(&path) {
            Ok(card) => card,
            Err(e) => {
                debug!("skipping {}: {}", path.display(), e);
                continue;
            }
        };
        any_opened = true;

        match kms::read_topology(&card) {
            Ok(topology) if topology.has_active_connector() => {
                info!("selected {} for the display lifecycle", path.display());
                return Ok(card);
            }
            Ok(_) => {
                debug!("{}: no connected connector, continuing", path.display());
            }
            Err(e) => {
                warn!("{}: resource query failed: {}", path.display(), e);
            }
        }
    }

    if any_opened {
        Err(Error::NoViableDisplay)
    } else {
        Err(Error::NoDevice)
    }
}
