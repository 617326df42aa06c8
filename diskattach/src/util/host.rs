//! Host filesystem roots and readiness polling.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Where the kernel exposes its state.
///
/// Production code uses the real roots; tests point these at scratch
/// directories laid out like sysfs and procfs.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// sysfs root (`/sys`)
    pub sys_root: PathBuf,
    /// procfs root (`/proc`)
    pub proc_root: PathBuf,
    /// Mount table for this namespace (`/proc/self/mountinfo`)
    pub mountinfo: PathBuf,
    /// Device node directory (`/dev`)
    pub dev_root: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            sys_root: PathBuf::from("/sys"),
            proc_root: PathBuf::from("/proc"),
            mountinfo: PathBuf::from("/proc/self/mountinfo"),
            dev_root: PathBuf::from("/dev"),
        }
    }
}

impl HostPaths {
    pub fn block_dir(&self) -> PathBuf {
        self.sys_root.join("block")
    }

    pub fn module_dir(&self, module: &str) -> PathBuf {
        self.sys_root.join("module").join(module)
    }

    pub fn device_node(&self, name: &str) -> PathBuf {
        self.dev_root.join(name)
    }
}

/// Bounded polling policy for device nodes that appear asynchronously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Readiness {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for Readiness {
    fn default() -> Self {
        Self {
            attempts: crate::constants::readiness::ATTEMPTS,
            delay_ms: crate::constants::readiness::DELAY_MS,
        }
    }
}

impl Readiness {
    pub fn new(attempts: u32, delay_ms: u64) -> Self {
        Self { attempts, delay_ms }
    }

    /// Poll `check` until it returns true or attempts run out.
    ///
    /// The check runs at least once.
    pub fn wait_until(&self, mut check: impl FnMut() -> bool) -> bool {
        let attempts = self.attempts.max(1);
        for attempt in 0..attempts {
            if check() {
                return true;
            }
            if attempt + 1 < attempts {
                std::thread::sleep(Duration::from_millis(self.delay_ms));
            }
        }
        false
    }
}

/// Whether `path` lies at or below one of `roots`.
///
/// `..` is rejected outright. The path is then resolved through the
/// filesystem: its deepest existing ancestor is canonicalized and the
/// missing components appended, so a symlink cannot lead out of a root.
/// A path that is itself a symlink, or that passes through a dangling
/// one, is never within.
pub fn is_within_roots(path: &Path, roots: &[PathBuf]) -> bool {
    use std::path::Component;

    if !path.is_absolute() || path.components().any(|c| c == Component::ParentDir) {
        return false;
    }
    let normalized: PathBuf = path
        .components()
        .filter(|c| *c != Component::CurDir)
        .collect();
    if is_symlink(&normalized) {
        return false;
    }
    let Some(resolved) = resolve_existing(&normalized) else {
        return false;
    };
    roots.iter().any(|root| {
        let root = resolve_existing(root).unwrap_or_else(|| root.clone());
        resolved.starts_with(root)
    })
}

fn is_symlink(path: &Path) -> bool {
    path.symlink_metadata()
        .is_ok_and(|m| m.file_type().is_symlink())
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// components that do not exist yet.
fn resolve_existing(path: &Path) -> Option<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                return Some(missing.iter().rev().fold(canonical, |acc, c| acc.join(c)));
            }
            // Present but unresolvable: a dangling link
            Err(_) if existing.symlink_metadata().is_ok() => return None,
            Err(_) => {
                missing.push(existing.file_name()?);
                existing = existing.parent()?;
            }
        }
    }
}
