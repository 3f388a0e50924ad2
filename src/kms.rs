//! KMS resource resolution and CRTC state capture/restore
//!
//! The resolver works on a plain-data snapshot of the device's topology
//! ([`KmsTopology`]) rather than on live handles, so the selection rules
//! can be exercised without hardware. Selection is strictly first-match:
//! no scoring, no preference for resolution or refresh rate.

use std::num::NonZeroU32;

use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, Mode};
use tracing::{debug, info};

use crate::device::Card;
use crate::error::Error;
use crate::Result;

/// Mode descriptor in plain data form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeDesc {
    pub name: String,
    pub clock: u32,
    pub hdisplay: u16,
    pub vdisplay: u16,
    pub vrefresh: u32,
}

impl std::fmt::Display for ModeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}@{}", self.hdisplay, self.vdisplay, self.vrefresh)
    }
}

impl From<&Mode> for ModeDesc {
    fn from(mode: &Mode) -> Self {
        let (hdisplay, vdisplay) = mode.size();
        ModeDesc {
            name: mode.name().to_string_lossy().into_owned(),
            clock: mode.clock(),
            hdisplay,
            vdisplay,
            vrefresh: mode.vrefresh(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConnectorDesc {
    pub id: u32,
    pub connected: bool,
    /// Encoder currently driving this connector, if any.
    pub encoder_id: Option<u32>,
    pub modes: Vec<ModeDesc>,
}

#[derive(Debug, Clone)]
pub struct EncoderDesc {
    pub id: u32,
    /// CRTC currently assigned to this encoder, if any.
    pub crtc_id: Option<u32>,
    /// CRTCs this encoder can drive, expanded from the possible-CRTC
    /// bitmask in resource order.
    pub possible_crtcs: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct CrtcDesc {
    pub id: u32,
    /// Currently programmed mode, if the CRTC is active.
    pub mode: Option<ModeDesc>,
}

/// Snapshot of every connector, encoder, and CRTC a device exposes.
#[derive(Debug, Clone, Default)]
pub struct KmsTopology {
    pub connectors: Vec<ConnectorDesc>,
    pub encoders: Vec<EncoderDesc>,
    pub crtcs: Vec<CrtcDesc>,
}

impl KmsTopology {
    pub fn has_active_connector(&self) -> bool {
        self.connectors
            .iter()
            .any(|c| c.connected && !c.modes.is_empty())
    }

    fn encoder(&self, id: u32) -> Option<&EncoderDesc> {
        self.encoders.iter().find(|e| e.id == id)
    }

    fn crtc(&self, id: u32) -> Option<&CrtcDesc> {
        self.crtcs.iter().find(|c| c.id == id)
    }
}

/// Where the selected mode came from. The live path needs this to fetch
/// the matching [`Mode`] object for programming the CRTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSource {
    /// Mode read from the CRTC already driving the connector.
    CurrentCrtc,
    /// Connector's first advertised mode (fallback path).
    ConnectorFirst,
}

/// Result of display resource resolution.
#[derive(Debug, Clone)]
pub struct Selection {
    pub connector_id: u32,
    pub crtc_id: u32,
    pub mode: ModeDesc,
    pub mode_source: ModeSource,
}

/// Query the device into a [`KmsTopology`].
pub fn read_topology(card: &Card) -> Result<KmsTopology> {
    let res = card.resource_handles()?;

    let mut connectors = Vec::with_capacity(res.connectors().len());
    for &handle in res.connectors() {
        let info = card.get_connector(handle, false)?;
        connectors.push(ConnectorDesc {
            id: handle.into(),
            connected: info.state() == connector::State::Connected,
            encoder_id: info.current_encoder().map(Into::into),
            modes: info.modes().iter().map(ModeDesc::from).collect(),
        });
    }

    let mut encoders = Vec::with_capacity(res.encoders().len());
    for &handle in res.encoders() {
        let info = card.get_encoder(handle)?;
        encoders.push(EncoderDesc {
            id: handle.into(),
            crtc_id: info.crtc().map(Into::into),
            possible_crtcs: res
                .filter_crtcs(info.possible_crtcs())
                .into_iter()
                .map(Into::into)
                .collect(),
        });
    }

    let mut crtcs = Vec::with_capacity(res.crtcs().len());
    for &handle in res.crtcs() {
        let info = card.get_crtc(handle)?;
        crtcs.push(CrtcDesc {
            id: handle.into(),
            mode: info.mode().as_ref().map(ModeDesc::from),
        });
    }

    Ok(KmsTopology {
        connectors,
        encoders,
        crtcs,
    })
}

/// Select a (connector, CRTC, mode) tuple.
///
/// First connected connector with modes wins. If it already references an
/// encoder with an active CRTC, that CRTC and its current mode are taken
/// directly; otherwise every encoder is scanned for the first CRTC allowed
/// by its possible-CRTC mask, and the connector's first advertised mode is
/// used. Any incomplete encoder association (dangling encoder id, encoder
/// without a CRTC, CRTC without a programmed mode) drops to the fallback
/// scan, which is also what the kernel-side query failures amount to.
pub fn resolve(topology: &KmsTopology) -> Result<Selection> {
    let connector = topology
        .connectors
        .iter()
        .find(|c| c.connected && !c.modes.is_empty())
        .ok_or(Error::NoActiveConnector)?;

    debug!(
        "connector {} connected with {} modes",
        connector.id,
        connector.modes.len()
    );

    if let Some(encoder) = connector.encoder_id.and_then(|id| topology.encoder(id)) {
        if let Some(crtc) = encoder.crtc_id.and_then(|id| topology.crtc(id)) {
            if let Some(mode) = &crtc.mode {
                info!(
                    "connector {} -> encoder {} -> crtc {} ({})",
                    connector.id, encoder.id, crtc.id, mode
                );
                return Ok(Selection {
                    connector_id: connector.id,
                    crtc_id: crtc.id,
                    mode: mode.clone(),
                    mode_source: ModeSource::CurrentCrtc,
                });
            }
        }
    }

    // No usable encoder association: first encoder whose mask admits a CRTC.
    for encoder in &topology.encoders {
        for crtc in &topology.crtcs {
            if encoder.possible_crtcs.contains(&crtc.id) {
                let mode = connector.modes[0].clone();
                info!(
                    "fallback: connector {} -> encoder {} -> crtc {} ({})",
                    connector.id, encoder.id, crtc.id, mode
                );
                return Ok(Selection {
                    connector_id: connector.id,
                    crtc_id: crtc.id,
                    mode,
                    mode_source: ModeSource::ConnectorFirst,
                });
            }
        }
    }

    Err(Error::NoActiveEncoder)
}

/// Fetch the [`Mode`] object the selection refers to, for CRTC programming.
pub fn lookup_mode(card: &Card, selection: &Selection) -> Result<Mode> {
    match selection.mode_source {
        ModeSource::CurrentCrtc => {
            let info = card.get_crtc(crtc_handle(selection.crtc_id)?)?;
            info.mode().ok_or(Error::NoActiveEncoder)
        }
        ModeSource::ConnectorFirst => {
            let info = card.get_connector(connector_handle(selection.connector_id)?, false)?;
            info.modes().first().copied().ok_or(Error::NoActiveConnector)
        }
    }
}

pub fn connector_handle(id: u32) -> Result<connector::Handle> {
    Ok(NonZeroU32::new(id).ok_or(Error::InvalidId)?.into())
}

pub fn crtc_handle(id: u32) -> Result<crtc::Handle> {
    Ok(NonZeroU32::new(id).ok_or(Error::InvalidId)?.into())
}

/// CRTC configuration observed before this process touched anything.
#[derive(Debug, Clone)]
pub struct SavedCrtc {
    pub crtc_id: u32,
    pub position: (u32, u32),
    pub framebuffer: Option<framebuffer::Handle>,
    pub mode: Option<Mode>,
}

/// Captures the pre-existing CRTC configuration and restores it exactly
/// once during teardown. A guard that never captured restores nothing.
#[derive(Debug, Default)]
pub struct CrtcStateGuard {
    saved: Option<SavedCrtc>,
}

impl CrtcStateGuard {
    /// Guard with nothing to restore (resolution never got far enough).
    pub fn empty() -> Self {
        CrtcStateGuard { saved: None }
    }

    /// Snapshot the CRTC's current configuration. Must run after
    /// resolution and before any mutating call.
    pub fn capture(card: &Card, crtc_id: u32) -> Result<Self> {
        let info = card.get_crtc(crtc_handle(crtc_id)?)?;
        let saved = SavedCrtc {
            crtc_id,
            position: info.position(),
            framebuffer: info.framebuffer(),
            mode: info.mode(),
        };
        debug!(
            "captured crtc {} state: pos {:?}, fb {:?}",
            crtc_id, saved.position, saved.framebuffer
        );
        Ok(CrtcStateGuard { saved: Some(saved) })
    }

    pub fn is_captured(&self) -> bool {
        self.saved.is_some()
    }

    /// Re-apply the captured configuration. The first call consumes the
    /// snapshot; later calls (and calls on an empty guard) do nothing.
    pub fn restore(&mut self, card: &Card, connector_id: u32) -> Result<()> {
        let Some(saved) = self.saved.take() else {
            return Ok(());
        };
        info!("restoring crtc {}", saved.crtc_id);
        card.set_crtc(
            crtc_handle(saved.crtc_id)?,
            saved.framebuffer,
            saved.position,
            &[connector_handle(connector_id)?],
            saved.mode,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(name: &str, h: u16, v: u16, refresh: u32) -> ModeDesc {
        ModeDesc {
            name: name.to_string(),
            clock: u32::from(h) * u32::from(v) * refresh / 1000,
            hdisplay: h,
            vdisplay: v,
            vrefresh: refresh,
        }
    }

    /// One connector with a live encoder/CRTC association and 1920x1080@60
    /// programmed: resolver must return that CRTC and that exact mode.
    #[test]
    fn test_resolve_existing_encoder() {
        let current = mode("1920x1080", 1920, 1080, 60);
        let topology = KmsTopology {
            connectors: vec![ConnectorDesc {
                id: 31,
                connected: true,
                encoder_id: Some(40),
                modes: vec![mode("1024x768", 1024, 768, 75), current.clone()],
            }],
            encoders: vec![EncoderDesc {
                id: 40,
                crtc_id: Some(50),
                possible_crtcs: vec![50],
            }],
            crtcs: vec![CrtcDesc {
                id: 50,
                mode: Some(current.clone()),
            }],
        };

        let sel = resolve(&topology).unwrap();
        assert_eq!(sel.connector_id, 31);
        assert_eq!(sel.crtc_id, 50);
        assert_eq!(sel.mode, current);
        assert_eq!(sel.mode_source, ModeSource::CurrentCrtc);
        assert_eq!(sel.mode.to_string(), "1920x1080@60");
    }

    /// Connector without an encoder, two encoders of which only the second
    /// may drive the second CRTC: resolver must pick that pair and the
    /// connector's first advertised mode.
    #[test]
    fn test_resolve_fallback_mask() {
        let preferred = mode("1280x720", 1280, 720, 60);
        let topology = KmsTopology {
            connectors: vec![ConnectorDesc {
                id: 31,
                connected: true,
                encoder_id: None,
                modes: vec![preferred.clone(), mode("640x480", 640, 480, 60)],
            }],
            encoders: vec![
                EncoderDesc {
                    id: 40,
                    crtc_id: None,
                    possible_crtcs: vec![],
                },
                EncoderDesc {
                    id: 41,
                    crtc_id: None,
                    // bit 1 of the mask: second CRTC only
                    possible_crtcs: vec![51],
                },
            ],
            crtcs: vec![
                CrtcDesc { id: 50, mode: None },
                CrtcDesc { id: 51, mode: None },
            ],
        };

        let sel = resolve(&topology).unwrap();
        assert_eq!(sel.crtc_id, 51);
        assert_eq!(sel.mode, preferred);
        assert_eq!(sel.mode_source, ModeSource::ConnectorFirst);
    }

    /// No encoder admits any CRTC: clean failure, never a default.
    #[test]
    fn test_resolve_no_usable_encoder() {
        let topology = KmsTopology {
            connectors: vec![ConnectorDesc {
                id: 31,
                connected: true,
                encoder_id: None,
                modes: vec![mode("800x600", 800, 600, 60)],
            }],
            encoders: vec![
                EncoderDesc {
                    id: 40,
                    crtc_id: None,
                    possible_crtcs: vec![],
                },
                EncoderDesc {
                    id: 41,
                    crtc_id: None,
                    possible_crtcs: vec![],
                },
            ],
            crtcs: vec![
                CrtcDesc { id: 50, mode: None },
                CrtcDesc { id: 51, mode: None },
            ],
        };

        assert!(matches!(resolve(&topology), Err(Error::NoActiveEncoder)));
    }

    #[test]
    fn test_resolve_no_connected_connector() {
        let topology = KmsTopology {
            connectors: vec![
                ConnectorDesc {
                    id: 31,
                    connected: false,
                    encoder_id: None,
                    modes: vec![mode("800x600", 800, 600, 60)],
                },
                ConnectorDesc {
                    id: 32,
                    connected: true,
                    encoder_id: None,
                    modes: vec![],
                },
            ],
            encoders: vec![],
            crtcs: vec![],
        };

        assert!(matches!(resolve(&topology), Err(Error::NoActiveConnector)));
    }

    /// A dangling encoder reference falls through to the mask scan instead
    /// of failing outright.
    #[test]
    fn test_resolve_dangling_encoder_reference() {
        let preferred = mode("1280x720", 1280, 720, 60);
        let topology = KmsTopology {
            connectors: vec![ConnectorDesc {
                id: 31,
                connected: true,
                encoder_id: Some(99),
                modes: vec![preferred.clone()],
            }],
            encoders: vec![EncoderDesc {
                id: 40,
                crtc_id: None,
                possible_crtcs: vec![50],
            }],
            crtcs: vec![CrtcDesc { id: 50, mode: None }],
        };

        let sel = resolve(&topology).unwrap();
        assert_eq!(sel.crtc_id, 50);
        assert_eq!(sel.mode, preferred);
        assert_eq!(sel.mode_source, ModeSource::ConnectorFirst);
    }

    #[test]
    fn test_first_match_wins() {
        let first = mode("1024x768", 1024, 768, 60);
        let topology = KmsTopology {
            connectors: vec![
                ConnectorDesc {
                    id: 31,
                    connected: true,
                    encoder_id: None,
                    modes: vec![first.clone()],
                },
                ConnectorDesc {
                    id: 32,
                    connected: true,
                    encoder_id: None,
                    modes: vec![mode("3840x2160", 3840, 2160, 144)],
                },
            ],
            encoders: vec![EncoderDesc {
                id: 40,
                crtc_id: None,
                possible_crtcs: vec![50, 51],
            }],
            crtcs: vec![
                CrtcDesc { id: 50, mode: None },
                CrtcDesc { id: 51, mode: None },
            ],
        };

        // No preference for the higher-resolution connector or later CRTC.
        let sel = resolve(&topology).unwrap();
        assert_eq!(sel.connector_id, 31);
        assert_eq!(sel.crtc_id, 50);
        assert_eq!(sel.mode, first);
    }

    #[test]
    fn test_guard_empty_is_noop() {
        let guard = CrtcStateGuard::empty();
        assert!(!guard.is_captured());
    }

    #[test]
    fn test_guard_restore_consumes_snapshot() {
        let mut guard = CrtcStateGuard {
            saved: Some(SavedCrtc {
                crtc_id: 50,
                position: (0, 0),
                framebuffer: None,
                mode: None,
            }),
        };
        assert!(guard.is_captured());
        let taken = guard.saved.take().unwrap();
        assert_eq!(taken.crtc_id, 50);
        // Second restore has nothing left to apply.
        assert!(!guard.is_captured());
        assert!(guard.saved.take().is_none());
    }
}
