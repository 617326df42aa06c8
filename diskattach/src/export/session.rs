//! Export session records.
//!
//! One JSON record per exported image lives in the run directory next to
//! the server's socket and pid file. Creating the record is the endpoint
//! claim: the create is exclusive, so of two concurrent exporters exactly
//! one wins and starts the server.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use diskattach_shared::errors::{DiskError, DiskResult};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use super::Endpoint;
use crate::image::DiskFormat;

/// A live (or claimed) export of one disk image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportSession {
    pub image: PathBuf,
    pub format: DiskFormat,
    pub endpoint: Endpoint,
    /// Server PID. `None` while the claim holder is still starting it.
    pub pid: Option<u32>,
    /// Kernel device currently bound to this export.
    pub device: Option<PathBuf>,
    pub claimed_at: DateTime<Utc>,
}

impl ExportSession {
    pub fn claim(image: PathBuf, format: DiskFormat, endpoint: Endpoint) -> Self {
        Self {
            image,
            format,
            endpoint,
            pid: None,
            device: None,
            claimed_at: Utc::now(),
        }
    }

    /// Seconds since the claim was written.
    pub fn age_secs(&self) -> i64 {
        (Utc::now() - self.claimed_at).num_seconds()
    }
}

/// Session records under a run directory.
#[derive(Debug, Clone)]
pub struct SessionStore {
    run_dir: PathBuf,
}

impl SessionStore {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn record_path(&self, endpoint: &Endpoint) -> PathBuf {
        self.run_dir.join(format!("{}.json", endpoint.export_name))
    }

    pub fn pid_path(&self, endpoint: &Endpoint) -> PathBuf {
        self.run_dir.join(format!("{}.pid", endpoint.export_name))
    }

    pub fn lock_path(&self, endpoint: &Endpoint) -> PathBuf {
        self.run_dir.join(format!("{}.lock", endpoint.export_name))
    }

    pub fn ensure_dir(&self) -> DiskResult<()> {
        std::fs::create_dir_all(&self.run_dir).map_err(|e| {
            DiskError::Storage(format!(
                "Failed to create run directory {}: {}",
                self.run_dir.display(),
                e
            ))
        })
    }

    pub fn load(&self, endpoint: &Endpoint) -> DiskResult<Option<ExportSession>> {
        read_record(&self.record_path(endpoint))
    }

    /// Exclusively create the record for `session.endpoint`.
    ///
    /// Returns `false` when another invocation already holds the claim.
    pub fn claim(&self, session: &ExportSession) -> DiskResult<bool> {
        self.ensure_dir()?;
        let file = self.write_temp(session)?;
        match file.persist_noclobber(self.record_path(&session.endpoint)) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(DiskError::Storage(format!(
                "Failed to claim endpoint {}: {}",
                session.endpoint, e.error
            ))),
        }
    }

    /// Atomically replace the record.
    pub fn save(&self, session: &ExportSession) -> DiskResult<()> {
        self.ensure_dir()?;
        let file = self.write_temp(session)?;
        file.persist(self.record_path(&session.endpoint))
            .map_err(|e| {
                DiskError::Storage(format!(
                    "Failed to save session for {}: {}",
                    session.endpoint, e.error
                ))
            })?;
        Ok(())
    }

    /// Remove the record, socket and pid file. Missing files are fine.
    pub fn remove(&self, endpoint: &Endpoint) -> DiskResult<()> {
        for path in [
            self.record_path(endpoint),
            endpoint.socket.clone(),
            self.pid_path(endpoint),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DiskError::Storage(format!(
                        "Failed to remove {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }
        Ok(())
    }

    /// Every readable record in the run directory.
    pub fn list(&self) -> DiskResult<Vec<ExportSession>> {
        let entries = match std::fs::read_dir(&self.run_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut sessions = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match read_record(&path) {
                Ok(Some(session)) => sessions.push(session),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable session record"),
            }
        }
        sessions.sort_by(|a, b| a.endpoint.export_name.cmp(&b.endpoint.export_name));
        Ok(sessions)
    }

    fn write_temp(&self, session: &ExportSession) -> DiskResult<NamedTempFile> {
        let json = serde_json::to_vec_pretty(session)
            .map_err(|e| DiskError::Internal(format!("Failed to serialize session: {}", e)))?;
        let mut file = NamedTempFile::new_in(&self.run_dir)?;
        file.write_all(&json)?;
        file.as_file().sync_all()?;
        Ok(file)
    }
}

fn read_record(path: &Path) -> DiskResult<Option<ExportSession>> {
    let content = match std::fs::read(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&content).map(Some).map_err(|e| {
        DiskError::Storage(format!("Corrupt session record {}: {}", path.display(), e))
    })
}
