//! Video environment sanity checks
//!
//! Two independent pass/fail probes with no shared state: classify the
//! GPU hardware from `lspci` output, and scan the X server log for known
//! failure signatures (a stack that silently fell back to software
//! rendering passes every other check in this suite).

use std::path::Path;
use std::process::Command;

use tracing::{info, warn};

use crate::error::Error;
use crate::Result;

pub const XORG_LOG_PATH: &str = "/var/log/Xorg.0.log";

/// Vendor families recognized on VGA/3D controller lines.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VideoEnv {
    pub intel: bool,
    pub amd: bool,
    pub nvidia: bool,
    pub virtualbox: bool,
    pub vmware: bool,
}

impl VideoEnv {
    pub fn is_empty(&self) -> bool {
        *self == VideoEnv::default()
    }
}

impl std::fmt::Display for VideoEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = Vec::new();
        if self.virtualbox {
            names.push("VirtualBox");
        }
        if self.vmware {
            names.push("VMware");
        }
        if self.intel {
            names.push("Intel");
        }
        if self.amd {
            names.push("AMD");
        }
        if self.nvidia {
            names.push("Nvidia");
        }
        if names.is_empty() {
            names.push("unknown");
        }
        write!(f, "{}", names.join(" "))
    }
}

/// Whether `token` appears as a whole word. "ati" and "amd" are short
/// enough to hide inside other vendor names ("Corporation" contains
/// "ati"), so the AMD predicate cannot use plain substring search.
fn has_token(line: &str, token: &str) -> bool {
    line.split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == token)
}

/// Classify `lspci` output into vendor flags. Only VGA and 3D controller
/// lines count.
pub fn classify_lspci(output: &str) -> VideoEnv {
    let mut env = VideoEnv::default();
    for line in output.lines() {
        let line = line.to_ascii_lowercase();
        if !line.contains("vga") && !line.contains("3d") {
            continue;
        }
        if line.contains("virtualbox") {
            env.virtualbox = true;
        } else if line.contains("vmware") {
            env.vmware = true;
        } else if line.contains("intel") {
            env.intel = true;
        } else if has_token(&line, "ati") || has_token(&line, "amd") {
            env.amd = true;
        } else if line.contains("nvidia") {
            env.nvidia = true;
        }
    }
    env
}

/// Known bad signatures in the X server log: AIGLX failures, disabled
/// direct rendering, the software-rasterizer GLX provider, and DRI1-style
/// indirect rendering.
pub fn log_line_is_failure(line: &str) -> bool {
    let lower = line.to_ascii_lowercase();
    (line.contains("(EE)") && lower.contains("aiglx error"))
        || (lower.contains("direct rendering") && lower.contains("disabled"))
        || lower.contains("glx: initialized driswrast gl provider")
        || lower.contains("direct rendering: dri enabled")
}

/// Scan an X server log body for failure signatures.
pub fn scan_server_log(body: &str) -> Result<()> {
    for line in body.lines() {
        if log_line_is_failure(line) {
            return Err(Error::Environment(format!(
                "X server log signature: {}",
                line.trim()
            )));
        }
    }
    Ok(())
}

/// Run both probes against the live system.
pub fn check() -> Result<()> {
    match Command::new("lspci").output() {
        Ok(output) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let env = classify_lspci(&stdout);
            info!("video env: {}", env);
            if env.is_empty() {
                return Err(Error::Environment(
                    "no recognized video controller in lspci output".into(),
                ));
            }
        }
        Err(e) => {
            // No lspci on the box is not a graphics failure.
            warn!("lspci unavailable, skipping hardware classification: {}", e);
        }
    }

    let log_path = Path::new(XORG_LOG_PATH);
    if log_path.exists() {
        let body = std::fs::read_to_string(log_path)?;
        scan_server_log(&body)?;
        info!("no failure signatures in {}", XORG_LOG_PATH);
    } else {
        info!("{} not present, skipping log scan", XORG_LOG_PATH);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_mixed_controllers() {
        let lspci = "\
00:02.0 VGA compatible controller: Intel Corporation HD Graphics 630\n\
01:00.0 3D controller: NVIDIA Corporation GP107M [GeForce GTX 1050 Mobile]\n\
02:00.0 Ethernet controller: Realtek Semiconductor Co., Ltd. RTL8111\n";
        let env = classify_lspci(lspci);
        assert!(env.intel);
        assert!(env.nvidia);
        assert!(!env.amd);
        assert!(!env.is_empty());
        assert_eq!(env.to_string(), "Intel Nvidia");
    }

    /// "Corporation" contains "ati"; an NVIDIA controller must not be
    /// classified as AMD, while the usual AMD vendor spellings still are.
    #[test]
    fn test_classify_amd_requires_vendor_token() {
        let env = classify_lspci(
            "01:00.0 VGA compatible controller: NVIDIA Corporation GM206 [GeForce GTX 960]\n",
        );
        assert!(env.nvidia);
        assert!(!env.amd);

        let env = classify_lspci(
            "03:00.0 VGA compatible controller: Advanced Micro Devices, Inc. [AMD/ATI] Navi 23\n",
        );
        assert!(env.amd);
        let env = classify_lspci(
            "01:05.0 VGA compatible controller: ATI Technologies Inc RS880 [Radeon HD 4200]\n",
        );
        assert!(env.amd);
    }

    #[test]
    fn test_classify_virtual_machines() {
        let env = classify_lspci(
            "00:02.0 VGA compatible controller: VMware SVGA II Adapter\n",
        );
        assert!(env.vmware);
        let env = classify_lspci(
            "00:02.0 VGA compatible controller: InnoTek Systemberatung GmbH VirtualBox Graphics Adapter\n",
        );
        assert!(env.virtualbox);
    }

    #[test]
    fn test_classify_non_video_lines_ignored() {
        let env = classify_lspci(
            "00:1f.3 Audio device: Intel Corporation Sunrise Point-LP HD Audio\n",
        );
        assert!(env.is_empty());
        assert_eq!(env.to_string(), "unknown");
    }

    #[test]
    fn test_log_failure_signatures() {
        assert!(log_line_is_failure(
            "[    10.212] (EE) AIGLX error: dlopen of /usr/lib/dri/i965_dri.so failed"
        ));
        assert!(log_line_is_failure(
            "[    10.310] (II) GLX: direct rendering is disabled"
        ));
        assert!(log_line_is_failure(
            "[    10.311] (II) GLX: Initialized DRISWRAST GL provider for screen 0"
        ));
        assert!(!log_line_is_failure(
            "[    10.312] (II) GLX: Initialized DRI2 GL provider for screen 0"
        ));
        assert!(!log_line_is_failure("[    10.313] (II) AIGLX: enabled GLX_ARB_create_context"));
    }

    #[test]
    fn test_scan_stops_at_first_signature() {
        let body = "\
[    10.1] (II) modeset(0): glamor initialized\n\
[    10.2] (II) GLX: direct rendering is disabled\n";
        match scan_server_log(body) {
            Err(Error::Environment(message)) => {
                assert!(message.contains("direct rendering"));
            }
            other => panic!("expected Environment error, got {other:?}"),
        }
        assert!(scan_server_log("[    10.1] (II) all fine\n").is_ok());
    }
}
