//! JSON file persistence.
//!
//! Each stored resource type gets one `<name>.json` file in the
//! configured storage directory.

use rdsys_api::{RdError, RdResult};
use std::path::{Path, PathBuf};

/// A JSON file store for one resource type.
#[derive(Debug, Clone)]
pub struct JsonStore {
    filename: PathBuf,
}

impl JsonStore {
    /// Construct a store writing to `<dir>/<name>.json`.
    pub fn new(name: &str, dir: &Path) -> Self {
        Self {
            filename: dir.join(format!("{name}.json")),
        }
    }

    /// Decode the file's content.
    pub fn load(&self) -> RdResult<serde_json::Value> {
        tracing::debug!(file = %self.filename.display(), "loading state");
        let data = std::fs::read(&self.filename)
            .map_err(RdError::persistence)?;
        serde_json::from_slice(&data).map_err(RdError::persistence)
    }

    /// Encode the given value to the file, creating the directory if
    /// needed.
    pub fn save(&self, value: &serde_json::Value) -> RdResult<()> {
        tracing::debug!(file = %self.filename.display(), "saving state");
        if let Some(dir) = self.filename.parent() {
            std::fs::create_dir_all(dir).map_err(RdError::persistence)?;
        }
        let data =
            serde_json::to_vec(value).map_err(RdError::persistence)?;
        std::fs::write(&self.filename, data).map_err(RdError::persistence)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::new("obfs4", dir.path());
        assert!(store.load().is_err());
        let value = serde_json::json!({ "relations": {}, "resources": [] });
        store.save(&value).unwrap();
        assert_eq!(value, store.load().unwrap());
    }
}
