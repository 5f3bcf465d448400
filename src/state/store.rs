//! Persistent daemon state.
//!
//! The snapshot lives in memory behind one async mutex and is written back
//! after every mutation. On load the file is structurally checked before it
//! is decoded; a corrupted file is moved aside with a timestamped name and
//! the daemon continues from defaults.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::model::DaemonState;
use crate::config::DaemonConfig;
use crate::error::StateError;
use crate::events::{EventBus, LogLevel};

pub struct StateStore {
    path: PathBuf,
    events: EventBus,
    /// `None` until first access or after [`StateStore::reload`].
    cached: Mutex<Option<DaemonState>>,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>, events: EventBus) -> Self {
        Self {
            path: path.into(),
            events,
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current snapshot (a clone).
    pub async fn load(&self) -> Result<DaemonState, StateError> {
        let mut cached = self.cached.lock().await;
        if cached.is_none() {
            *cached = Some(self.read_from_disk().await?);
        }
        Ok(cached.clone().unwrap_or_default())
    }

    /// Drop the in-memory copy and read the file again.
    pub async fn reload(&self) -> Result<DaemonState, StateError> {
        let mut cached = self.cached.lock().await;
        let state = self.read_from_disk().await?;
        *cached = Some(state.clone());
        Ok(state)
    }

    /// Load, apply `f`, and persist, all under the lock. The in-memory copy
    /// only changes once the write succeeds.
    pub async fn update<R>(&self, f: impl FnOnce(&mut DaemonState) -> R) -> Result<R, StateError> {
        let mut cached = self.cached.lock().await;
        let mut state = match cached.as_ref() {
            Some(state) => state.clone(),
            None => self.read_from_disk().await?,
        };
        let out = f(&mut state);
        self.write(&state).await?;
        *cached = Some(state);
        Ok(out)
    }

    /// Like [`StateStore::update`], but nothing is written when `f` fails.
    pub async fn try_update<R, E>(&self, f: impl FnOnce(&mut DaemonState) -> Result<R, E>) -> Result<R, E>
    where
        E: From<StateError>,
    {
        let mut cached = self.cached.lock().await;
        let mut state = match cached.as_ref() {
            Some(state) => state.clone(),
            None => self.read_from_disk().await?,
        };
        let out = f(&mut state)?;
        self.write(&state).await?;
        *cached = Some(state);
        Ok(out)
    }

    async fn read_from_disk(&self) -> Result<DaemonState, StateError> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No state file, starting from defaults");
                return Ok(DaemonState::default());
            }
            Err(source) => {
                return Err(StateError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        let reason = match check_structure(&text) {
            Err(reason) => reason.to_string(),
            Ok(()) => match serde_json::from_str::<DaemonState>(&text) {
                Ok(state) => return self.with_valid_config(state).await,
                Err(e) => e.to_string(),
            },
        };

        let backup = self.backup_corrupted().await?;
        let message = format!(
            "State file {} is corrupted ({reason}); moved to {} and reset to defaults",
            self.path.display(),
            backup.display()
        );
        warn!(path = %self.path.display(), backup = %backup.display(), %reason, "Corrupted state file");
        self.events.log(LogLevel::Warn, message);

        let state = DaemonState::default();
        self.write(&state).await?;
        Ok(state)
    }

    /// A snapshot can decode cleanly yet hold a config the scheduler cannot
    /// run with. Such a config is replaced by the defaults.
    async fn with_valid_config(&self, mut state: DaemonState) -> Result<DaemonState, StateError> {
        let Err(reason) = state.config.validate() else {
            return Ok(state);
        };
        warn!(path = %self.path.display(), %reason, "Invalid config in state file");
        self.events.log(
            LogLevel::Warn,
            format!("State file config is invalid ({reason}); using default config"),
        );
        state.config = DaemonConfig::default();
        self.write(&state).await?;
        Ok(state)
    }

    async fn backup_corrupted(&self) -> Result<PathBuf, StateError> {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupted-{stamp}"));
        let backup = self.path.with_file_name(name);
        tokio::fs::rename(&self.path, &backup)
            .await
            .map_err(|source| StateError::Io {
                path: backup.clone(),
                source,
            })?;
        Ok(backup)
    }

    /// Whole-file write through a sibling temp file.
    async fn write(&self, state: &DaemonState) -> Result<(), StateError> {
        let json = serde_json::to_string_pretty(state)?;
        let io_err = |source| StateError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)?;
        Ok(())
    }
}

/// Cheap structural check run before decoding: the text must be one
/// brace-balanced top-level object with nothing after it.
pub fn check_structure(text: &str) -> Result<(), &'static str> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err("empty file");
    }
    if !trimmed.starts_with('{') {
        return Err("does not start with an object");
    }

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut closed_at = None;

    for (i, c) in trimmed.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err("unbalanced closing brace");
                }
                if depth == 0 {
                    closed_at = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    match closed_at {
        None if in_string => Err("unterminated string"),
        None => Err("unbalanced braces"),
        Some(i) if !trimmed[i + 1..].trim().is_empty() => Err("content after top-level object"),
        Some(_) => Ok(()),
    }
}
