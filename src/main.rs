//! drm-stack-check - validate the machine's graphics stack
//!
//! Runs a fixed sequence of checks against live hardware and exits
//! non-zero at the first failure. Meant to run on a virtual console,
//! without a display server owning the devices.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use drm_stack_check::runner::{self, Check, CheckOptions};
use drm_stack_check::{device, environment, gem, DisplayContext, Vendor};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "drm-stack-check")]
#[command(about = "Validate the DRM/KMS, GEM and GBM/EGL graphics stack", long_about = None)]
struct Args {
    /// Enable verbose debug output
    #[arg(short, long)]
    verbose: bool,

    /// Upper bound in milliseconds for page-flip completion waits
    #[arg(long, default_value_t = 5000)]
    flip_timeout_ms: u64,

    /// Stop after the KMS check; skip render-surface binding and flips
    #[arg(long)]
    skip_render: bool,
}

/// Open every reachable device node once.
fn check_device_nodes(_: &CheckOptions) -> drm_stack_check::Result<()> {
    let card = device::open_first_card()?;
    info!("first viable node driver: {}", card.driver_name()?);
    drop(card);

    for path in device::existing_card_paths() {
        match device::Card::open(&path) {
            Ok(_) => info!("{} opens", path.display()),
            Err(e) => warn!("{}: {}", path.display(), e),
        }
    }
    Ok(())
}

fn check_environment(_: &CheckOptions) -> drm_stack_check::Result<()> {
    environment::check()
}

/// Discovery, resolution, CRTC snapshot, and ordered teardown, with no
/// rendering in between.
fn check_kms(options: &CheckOptions) -> drm_stack_check::Result<()> {
    let context = DisplayContext::acquire()?;
    context.teardown(options.flip_timeout)
}

/// GEM buffer round trip on every node with a recognized vendor.
fn check_gem(_: &CheckOptions) -> drm_stack_check::Result<()> {
    if !device::driver_available() {
        return Err(drm_stack_check::Error::DriverUnavailable);
    }
    for path in device::existing_card_paths() {
        let card = match device::Card::open(&path) {
            Ok(card) => card,
            Err(e) => {
                warn!("{}: {}", path.display(), e);
                continue;
            }
        };
        let driver = card.driver_name()?;
        match Vendor::from_driver_name(&driver) {
            Some(vendor) => {
                info!("{}: driver {}", path.display(), driver);
                gem::run_buffer_test(&card, vendor)?;
            }
            None => info!("{}: driver {} not covered, skipping", path.display(), driver),
        }
    }
    Ok(())
}

/// The full lifecycle: render-surface binding plus a flip cycle, with
/// teardown gated on flip completion.
fn check_rendering(options: &CheckOptions) -> drm_stack_check::Result<()> {
    let mut context = DisplayContext::acquire()?;
    if let Err(e) = context.bind_render_surface() {
        let _ = context.teardown(options.flip_timeout);
        return Err(e);
    }

    // Two frames: the first programs the CRTC, the second goes through an
    // event-generating page flip that teardown must wait out.
    let presented = context
        .present_frame(options.flip_timeout)
        .and_then(|_| context.present_frame(options.flip_timeout));
    match presented {
        Ok(()) => context.teardown(options.flip_timeout),
        Err(e) => {
            let _ = context.teardown(options.flip_timeout);
            Err(e)
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let options = CheckOptions {
        flip_timeout: Duration::from_millis(args.flip_timeout_ms),
    };

    let mut checks = vec![
        Check {
            name: "device nodes",
            run: check_device_nodes,
        },
        Check {
            name: "environment",
            run: check_environment,
        },
        Check {
            name: "kms",
            run: check_kms,
        },
        Check {
            name: "gem",
            run: check_gem,
        },
    ];
    if !args.skip_render {
        checks.push(Check {
            name: "rendering",
            run: check_rendering,
        });
    }

    if runner::run_sequence(&checks, &options).is_some() {
        std::process::exit(1);
    }
    info!("all checks passed");
    Ok(())
}
