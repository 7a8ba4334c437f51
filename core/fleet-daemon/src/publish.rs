//! Writes published view-models to disk for the renderer.

use fleet_core::board::atomic_write;
use fleet_core::{FleetError, Result, ViewModel, ViewPublisher};
use std::path::Path;
use std::sync::mpsc::Receiver;

pub fn render(view: &ViewModel) -> Result<String> {
    serde_json::to_string_pretty(view).map_err(|source| FleetError::Json {
        context: "serializing view-model".to_string(),
        source,
    })
}

pub fn write_view(path: &Path, view: &ViewModel) -> Result<()> {
    atomic_write(path, &render(view)?)
}

/// Mirrors every publish into `path` until the publisher goes away.
///
/// Notifications that pile up while a write is in progress collapse into
/// one write of the latest view.
pub fn follow(publisher: &ViewPublisher, updates: Receiver<u64>, path: &Path) {
    let mut written = 0;
    while let Ok(version) = updates.recv() {
        let newest = updates.try_iter().fold(version, u64::max);
        if newest <= written {
            continue;
        }
        let view = publisher.latest();
        match write_view(path, &view) {
            Ok(()) => {
                written = view.version;
                tracing::debug!(version = view.version, path = %path.display(), "View written");
            }
            Err(err) => {
                tracing::warn!(error = %err, path = %path.display(), "Failed to write view");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_view_is_complete_json() {
        let temp = tempfile::tempdir().expect("temp dir");
        let path = temp.path().join("nested").join("view.json");
        write_view(&path, &ViewModel::empty()).expect("write view");

        let raw = fs_err::read_to_string(&path).expect("read view");
        let parsed: serde_json::Value = serde_json::from_str(&raw).expect("parse view");
        assert_eq!(parsed["version"], 0);
        assert!(parsed["rows"].as_array().expect("rows").is_empty());
    }
}
