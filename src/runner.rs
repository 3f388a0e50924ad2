//! Table-driven check sequencing
//!
//! Checks run in order and the sequence halts at the first failure; the
//! binary maps that to its exit code.

use std::time::Duration;

use tracing::{error, info};

use crate::Result;

/// Options shared by every check.
#[derive(Debug, Clone)]
pub struct CheckOptions {
    /// Upper bound on waiting for a page-flip completion event.
    pub flip_timeout: Duration,
}

impl Default for CheckOptions {
    fn default() -> Self {
        CheckOptions {
            flip_timeout: Duration::from_millis(5000),
        }
    }
}

/// A named check in the sequence.
pub struct Check {
    pub name: &'static str,
    pub run: fn(&CheckOptions) -> Result<()>,
}

/// Run the checks in order. Returns the name of the first failing check,
/// or `None` when everything passed.
pub fn run_sequence(checks: &[Check], options: &CheckOptions) -> Option<&'static str> {
    for check in checks {
        info!("start {}", check.name);
        match (check.run)(options) {
            Ok(()) => info!("{} passed", check.name),
            Err(e) => {
                error!("{} failed: {}", check.name, e);
                return Some(check.name);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn passing(_: &CheckOptions) -> Result<()> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn failing(_: &CheckOptions) -> Result<()> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Err(Error::NoDevice)
    }

    #[test]
    fn test_halts_at_first_failure() {
        CALLS.store(0, Ordering::SeqCst);
        let checks = [
            Check {
                name: "first",
                run: passing,
            },
            Check {
                name: "second",
                run: failing,
            },
            Check {
                name: "third",
                run: passing,
            },
        ];

        let failed = run_sequence(&checks, &CheckOptions::default());
        assert_eq!(failed, Some("second"));
        // The third check never ran.
        assert_eq!(CALLS.load(Ordering::SeqCst), 2);
    }

    fn quiet_passing(_: &CheckOptions) -> Result<()> {
        Ok(())
    }

    #[test]
    fn test_all_pass() {
        let checks = [Check {
            name: "only",
            run: quiet_passing,
        }];
        assert_eq!(run_sequence(&checks, &CheckOptions::default()), None);
    }
}
