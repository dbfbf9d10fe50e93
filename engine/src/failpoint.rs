//! Fault injection for crash-recovery tests.
//!
//! The copy engine calls [`hit`] at every transition boundary. Outside of
//! test builds it is a no-op. In tests, a registry keyed by source path
//! decides whether to panic there (simulating the process dying at that
//! boundary) or to return an I/O error.

use std::io;
use std::path::Path;

use crate::model::Stage;

/// A place in the copy engine where a fault can be injected.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailSite {
    /// Right after the commit of a stage returned
    AfterStage(Stage),
    /// After a streaming progress commit at or past `min_bytes`
    CopyProgress { min_bytes: u64 },
    /// Inside a chunk's read/write, on the I/O helper thread
    ChunkIo,
    /// Just before the temp file is renamed into place
    Rename,
}

#[cfg(not(test))]
#[inline(always)]
pub fn hit(_source: &Path, _site: FailSite) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
pub use registry::{arm, disarm, hit, FailAction};

#[cfg(test)]
mod registry {
    use super::*;
    use parking_lot::Mutex;
    use std::path::PathBuf;

    /// What happens when an armed site is reached.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FailAction {
        /// Panic, abandoning everything not yet durable
        Crash,
        /// Fail with `EXDEV` as a rename across devices would
        CrossDevice,
        /// Fail with a generic I/O error
        Error(io::ErrorKind),
        /// Block for this long, then carry on
        Stall(std::time::Duration),
    }

    struct Armed {
        source: PathBuf,
        site: FailSite,
        action: FailAction,
        remaining: u32,
    }

    static REGISTRY: Mutex<Vec<Armed>> = parking_lot::const_mutex(Vec::new());

    /// Arm `site` for `source`, firing `times` times.
    pub fn arm(source: &Path, site: FailSite, action: FailAction, times: u32) {
        REGISTRY.lock().push(Armed {
            source: source.to_path_buf(),
            site,
            action,
            remaining: times,
        });
    }

    /// Drop every fault armed for `source`.
    pub fn disarm(source: &Path) {
        REGISTRY.lock().retain(|armed| armed.source != source);
    }

    fn matches(armed: FailSite, reached: FailSite) -> bool {
        match (armed, reached) {
            (FailSite::CopyProgress { min_bytes }, FailSite::CopyProgress { min_bytes: at }) => {
                at >= min_bytes
            }
            (a, b) => a == b,
        }
    }

    #[cfg(unix)]
    fn cross_device_error() -> io::Error {
        io::Error::from_raw_os_error(libc::EXDEV)
    }

    #[cfg(windows)]
    fn cross_device_error() -> io::Error {
        // ERROR_NOT_SAME_DEVICE
        io::Error::from_raw_os_error(17)
    }

    pub fn hit(source: &Path, site: FailSite) -> io::Result<()> {
        let action = {
            let mut registry = REGISTRY.lock();
            let index = registry
                .iter()
                .position(|a| a.source == source && a.remaining > 0 && matches(a.site, site));
            match index {
                Some(i) => {
                    registry[i].remaining -= 1;
                    let action = registry[i].action;
                    if registry[i].remaining == 0 {
                        registry.remove(i);
                    }
                    action
                }
                None => return Ok(()),
            }
        };

        match action {
            FailAction::Crash => panic!("injected crash at {:?} for {}", site, source.display()),
            FailAction::CrossDevice => Err(cross_device_error()),
            FailAction::Error(kind) => Err(io::Error::new(kind, "injected failure")),
            FailAction::Stall(delay) => {
                std::thread::sleep(delay);
                Ok(())
            }
        }
    }
}
