//! File-based control channel shared with the render engine.
//!
//! The session directory is the only mutable resource shared between the
//! engine and the preview pipeline. There is no lock: exposure writers clear
//! every `control_gain_*` sentinel before creating the new one, and readers
//! must cope with seeing none or several of them for a moment.

use crate::error::SessionError;
use crate::model::{Exposure, PreviewTarget};
use rand::RngCore;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

const GAIN_PREFIX: &str = "control_gain_";
const SCRATCH_INPUT: &str = "t.pfm";
const SCRATCH_OUTPUT: &str = "t.bmp";
const RAW_EXT: &str = "pfm";
pub const DISPLAY_EXT: &str = "bmp";
const CLOSE_ATTEMPTS: usize = 3;

#[derive(Debug)]
pub struct ControlChannel {
    dir: PathBuf,
    closed: AtomicBool,
}

/// Default parent for control directories: the per-user runtime dir (tmpfs
/// on most Linux systems), falling back to the system temp dir.
pub fn default_root() -> PathBuf {
    dirs::runtime_dir().unwrap_or_else(std::env::temp_dir)
}

/// Generate a random directory name for a new session.
fn gen_dir_name() -> String {
    let mut b = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut b);
    format!("iile-{:016x}", u64::from_le_bytes(b))
}

/// Parse the gain encoded in a sentinel file name.
fn parse_gain(name: &str) -> Option<i32> {
    name.strip_prefix(GAIN_PREFIX)?.parse().ok()
}

impl ControlChannel {
    /// Create a fresh session directory under `root`.
    pub fn open(root: &Path) -> Result<Self, SessionError> {
        fs::create_dir_all(root).map_err(|source| SessionError::Environment {
            path: root.to_path_buf(),
            source,
        })?;
        let dir = root.join(gen_dir_name());
        // create_dir (not _all) so an existing directory is never adopted.
        fs::create_dir(&dir).map_err(|source| SessionError::Environment {
            path: dir.clone(),
            source,
        })?;
        tracing::info!(dir = %dir.display(), "control directory created");
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    /// Raw frame written by the engine for `target`.
    pub fn frame_path(&self, target: PreviewTarget) -> PathBuf {
        self.dir.join(format!("{}.{}", target.file_stem(), RAW_EXT))
    }

    /// Display image produced by the tonemap pipeline for `target`.
    pub fn display_path(&self, target: PreviewTarget) -> PathBuf {
        self.dir.join(format!("{}.{}", target.file_stem(), DISPLAY_EXT))
    }

    pub fn scratch_input(&self) -> PathBuf {
        self.dir.join(SCRATCH_INPUT)
    }

    /// Where the converter leaves its output for [`Self::scratch_input`].
    pub fn scratch_output(&self) -> PathBuf {
        self.dir.join(SCRATCH_OUTPUT)
    }

    /// Replace the gain sentinel with one encoding `gain`.
    ///
    /// Clear-then-write: between the two steps a reader can observe no
    /// sentinel at all.
    pub fn write_exposure(&self, gain: i32) -> io::Result<()> {
        self.clear_exposure()?;
        let path = self.dir.join(format!("{GAIN_PREFIX}{gain}"));
        fs::File::create(&path)?;
        tracing::debug!(gain, "exposure sentinel written");
        Ok(())
    }

    /// Remove every gain sentinel, handing exposure back to the engine.
    pub fn clear_exposure(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_str().and_then(parse_gain).is_none() {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {}
                // Someone else cleared it first.
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn set_exposure(&self, exposure: Exposure) -> io::Result<()> {
        match exposure {
            Exposure::Auto => self.clear_exposure(),
            Exposure::Manual(gain) => self.write_exposure(gain),
        }
    }

    /// Current exposure as the engine would see it.
    ///
    /// No sentinel means auto-exposure. When a concurrent writer leaves more
    /// than one behind, the newest file wins and ties go to the higher gain.
    pub fn read_exposure(&self) -> io::Result<Exposure> {
        let mut best: Option<(SystemTime, i32)> = None;
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let Some(gain) = entry.file_name().to_str().and_then(parse_gain) else {
                continue;
            };
            // The file may vanish between listing and stat.
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if best.map_or(true, |b| (modified, gain) > b) {
                best = Some((modified, gain));
            }
        }
        Ok(best.map_or(Exposure::Auto, |(_, gain)| Exposure::Manual(gain)))
    }

    /// Recursively delete the session directory. Best effort and idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for attempt in 1..=CLOSE_ATTEMPTS {
            match fs::remove_dir_all(&self.dir) {
                Ok(()) => {
                    tracing::info!(dir = %self.dir.display(), "control directory removed");
                    return;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => return,
                // A writer may have dropped a new file in mid-removal; try again.
                Err(e) if attempt < CLOSE_ATTEMPTS => {
                    tracing::debug!(attempt, error = %e, "retrying control directory removal");
                }
                Err(e) => {
                    tracing::warn!(dir = %self.dir.display(), error = %e, "failed to remove control directory");
                }
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}
