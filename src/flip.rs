//! Page-flip completion tracking
//!
//! The kernel signals flip completion asynchronously on the device's event
//! stream. Destroying the rendering surface or context while a flip is
//! outstanding is driver-undefined behavior, so teardown gates on
//! [`PageFlipCoordinator::wait_idle`]. The wait takes a caller-supplied
//! timeout and reports a lost completion event as a distinct error rather
//! than blocking forever.

use std::os::fd::{AsFd, AsRawFd};
use std::time::{Duration, Instant};

use drm::control::{framebuffer, Device as ControlDevice, Event, PageFlipFlags};
use tracing::{debug, trace, warn};

use crate::device::Card;
use crate::error::Error;
use crate::kms::crtc_handle;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlipState {
    Idle,
    FlipRequested { crtc_id: u32 },
}

/// Tracks the single outstanding page flip.
#[derive(Debug)]
pub struct PageFlipCoordinator {
    state: FlipState,
}

impl Default for PageFlipCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PageFlipCoordinator {
    pub fn new() -> Self {
        PageFlipCoordinator {
            state: FlipState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.state == FlipState::Idle
    }

    /// Submit an event-generating flip of `fb` onto the CRTC. At most one
    /// flip may be outstanding.
    pub fn submit(&mut self, card: &Card, crtc_id: u32, fb: framebuffer::Handle) -> Result<()> {
        if !self.is_idle() {
            return Err(Error::FlipPending);
        }
        card.page_flip(crtc_handle(crtc_id)?, fb, PageFlipFlags::EVENT, None)?;
        self.state = FlipState::FlipRequested { crtc_id };
        debug!("page flip submitted on crtc {}", crtc_id);
        Ok(())
    }

    /// Feed one decoded completion event into the state machine. Only a
    /// page-flip event for the outstanding CRTC clears the gate; anything
    /// else is ignored. Returns whether the event was consumed.
    fn note_completion(&mut self, crtc_id: u32) -> bool {
        match self.state {
            FlipState::FlipRequested { crtc_id: pending } if pending == crtc_id => {
                self.state = FlipState::Idle;
                true
            }
            FlipState::FlipRequested { crtc_id: pending } => {
                warn!(
                    "ignoring page-flip event for crtc {} while waiting on crtc {}",
                    crtc_id, pending
                );
                false
            }
            FlipState::Idle => {
                trace!("page-flip event for crtc {} with nothing pending", crtc_id);
                false
            }
        }
    }

    /// Block until the outstanding flip (if any) completes, polling the
    /// device and draining its event stream.
    pub fn wait_idle(&mut self, card: &Card, timeout: Duration) -> Result<()> {
        if self.is_idle() {
            return Ok(());
        }
        debug!("waiting for pending page flip to complete");

        let deadline = Instant::now() + timeout;
        while !self.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::FlipTimeout(timeout));
            }

            let mut pfd = libc::pollfd {
                fd: card.as_fd().as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let millis = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;
            let ret = unsafe { libc::poll(&mut pfd, 1, millis) };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Ioctl {
                    call: "poll",
                    source: err,
                });
            }
            if ret == 0 {
                return Err(Error::FlipTimeout(timeout));
            }

            for event in card.receive_events()? {
                if let Event::PageFlip(flip) = event {
                    self.note_completion(flip.crtc.into());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_idle() {
        let coordinator = PageFlipCoordinator::new();
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_completion_clears_matching_crtc() {
        let mut coordinator = PageFlipCoordinator {
            state: FlipState::FlipRequested { crtc_id: 50 },
        };
        assert!(coordinator.note_completion(50));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_mismatched_crtc_does_not_clear() {
        let mut coordinator = PageFlipCoordinator {
            state: FlipState::FlipRequested { crtc_id: 50 },
        };
        assert!(!coordinator.note_completion(51));
        assert!(!coordinator.is_idle());
        // The matching event still clears afterwards.
        assert!(coordinator.note_completion(50));
        assert!(coordinator.is_idle());
    }

    #[test]
    fn test_no_spurious_transition_when_idle() {
        let mut coordinator = PageFlipCoordinator::new();
        assert!(!coordinator.note_completion(50));
        assert!(coordinator.is_idle());
    }
}
