//! Persisted selection state
//!
//! The selected target survives restarts as a small JSON record in the
//! user's local data directory. The store is a seam so the selection logic
//! can be driven by any key-value persistence.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use itarget_core::prelude::*;
use itarget_core::Target;

/// Opaque persistence seam for the selected target.
pub trait SelectionStore {
    fn load(&self) -> Result<Option<Target>>;
    fn save(&self, target: Option<&Target>) -> Result<()>;
}

/// Serialized state file shape.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    selected_target: Option<Target>,
}

/// JSON file store under `~/.local/share/itarget/state.json`.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new() -> Self {
        let base = dirs::data_local_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: base.join("itarget").join("state.json"),
        }
    }

    /// Store state at an explicit path.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for JsonFileStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStore for JsonFileStore {
    fn load(&self) -> Result<Option<Target>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // A corrupt state file is discarded, not fatal; the user just picks
        // a target again.
        let state: StateFile = serde_json::from_str(&contents).unwrap_or_else(|e| {
            warn!("Discarding unreadable state file: {}", e);
            StateFile::default()
        });

        Ok(state.selected_target)
    }

    fn save(&self, target: Option<&Target>) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }

        let state = StateFile {
            selected_target: target.cloned(),
        };
        std::fs::write(&self.path, serde_json::to_string_pretty(&state)?)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::sample_simulator;

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path().join("nested").join("state.json"));

        let target: Target = sample_simulator("SIM-1").into();
        store.save(Some(&target)).unwrap();

        assert_eq!(store.load().unwrap(), Some(target));
    }

    #[test]
    fn test_save_none_clears_selection() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::at(dir.path().join("state.json"));

        let target: Target = sample_simulator("SIM-1").into();
        store.save(Some(&target)).unwrap();
        store.save(None).unwrap();

        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_file_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "not json{").unwrap();

        let store = JsonFileStore::at(&path);
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_state_file_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = JsonFileStore::at(&path);

        let target: Target = sample_simulator("SIM-1").into();
        store.save(Some(&target)).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"selected_target\""));
    }
}
