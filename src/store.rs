//! Persisted custom configs.
//!
//! The store is a single key-value slot file (`prefs/<namespace>.json`)
//! mapping string keys to string values. The custom config list lives under
//! one key as a JSON array of JSON-encoded documents. Every mutation rewrites
//! the whole file through a temp file + rename.

use std::fs;
use std::io::Write;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};

use crate::candidate::CandidateConfig;
use crate::config;
use crate::error::{AppError, Result, ValidationError};

pub const NAMESPACE: &str = "vless_configs";
pub const CUSTOM_CONFIGS_KEY: &str = "custom_configs";

#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl ConfigStore {
    /// Store backed by `~/.config/vlessmux/prefs/vless_configs.json`.
    #[must_use]
    pub fn open_default() -> Self {
        Self::at(config::prefs_dir().join(format!("{}.json", NAMESPACE)))
    }

    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All stored configs in insertion order; unreadable entries are skipped.
    pub fn list(&self) -> Vec<CandidateConfig> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        match self.load() {
            Ok((_, entries)) => entries,
            Err(e) => {
                tracing::warn!(path = ?self.path.display().to_string(), error = %e, "prefs_read_failed");
                Vec::new()
            }
        }
    }

    /// Append `raw` after validating it. A slot file that cannot be read is
    /// an error; it is never replaced.
    pub fn add(&self, raw: &str) -> std::result::Result<(), ValidationError> {
        let candidate = CandidateConfig::from_json(raw)
            .map_err(|e| ValidationError::InvalidFormat(e.to_string()))?;

        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (slot, mut entries) = self.load()?;
        let incoming = candidate.to_value();
        if entries.iter().any(|existing| existing.to_value() == incoming) {
            tracing::info!(label = %candidate.label(), "custom_config_duplicate");
            return Err(ValidationError::Duplicate);
        }

        let label = candidate.label();
        entries.push(candidate);
        self.save(slot, &entries)?;
        tracing::info!(label = %label, count = entries.len(), "custom_config_added");
        Ok(())
    }

    /// Remove the entry at `index` (as returned by [`list`](Self::list)).
    /// Out-of-range indexes are ignored.
    pub fn remove(&self, index: usize) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (slot, mut entries) = self.load()?;
        if index >= entries.len() {
            tracing::debug!(index, count = entries.len(), "custom_config_remove_out_of_range");
            return Ok(());
        }
        let removed = entries.remove(index);
        self.save(slot, &entries)?;
        tracing::info!(label = %removed.label(), count = entries.len(), "custom_config_removed");
        Ok(())
    }

    /// The whole slot plus its decoded custom configs. Only individual
    /// entries are skipped; an unreadable file or list is an error.
    fn load(&self) -> Result<(Map<String, Value>, Vec<CandidateConfig>)> {
        let slot = read_slot(&self.path)?;
        let raw_entries: Vec<String> = match slot.get(CUSTOM_CONFIGS_KEY) {
            None => Vec::new(),
            Some(Value::String(encoded)) => serde_json::from_str(encoded)?,
            Some(_) => {
                return Err(AppError::Config(format!(
                    "{} in {} is not a string",
                    CUSTOM_CONFIGS_KEY,
                    self.path.display()
                )))
            }
        };

        let entries = raw_entries
            .iter()
            .enumerate()
            .filter_map(|(idx, raw)| match CandidateConfig::from_json(raw) {
                Ok(cfg) => Some(cfg),
                Err(e) => {
                    tracing::warn!(index = idx, error = %e, "custom_config_entry_skipped");
                    None
                }
            })
            .collect();
        Ok((slot, entries))
    }

    /// Write `entries` back into `slot`, keeping its other keys.
    fn save(&self, mut slot: Map<String, Value>, entries: &[CandidateConfig]) -> Result<()> {
        let encoded_entries = entries
            .iter()
            .map(CandidateConfig::to_json)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let encoded = serde_json::to_string(&encoded_entries)?;

        slot.insert(CUSTOM_CONFIGS_KEY.to_string(), Value::String(encoded));
        let payload = serde_json::to_string_pretty(&Value::Object(slot))?;
        write_atomic(&self.path, payload.as_bytes())
    }
}

fn read_slot(path: &Path) -> Result<Map<String, Value>> {
    let json = match fs::read_to_string(path) {
        Ok(json) => json,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<Value>(&json)? {
        Value::Object(map) => Ok(map),
        _ => Err(AppError::Config(format!(
            "{} does not hold a JSON object",
            path.display()
        ))),
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| AppError::Config(format!("{} has no parent directory", path.display())))?;
    config::ensure_private_dir(parent)?;

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| NAMESPACE.to_string());
    let tmp_path = parent.join(format!(".{}.tmp-{}-{}", file_name, std::process::id(), nanos));

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(&tmp_path)?;
    let written = file.write_all(data).and_then(|()| file.sync_all());
    drop(file);
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }

    if let Err(e) = fs::rename(&tmp_path, path) {
        let _ = fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::tests::sample_doc;
    use std::sync::Arc;

    fn scratch_store() -> (ConfigStore, PathBuf) {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("time")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "vlessmux-store-test-{}-{}",
            std::process::id(),
            unique
        ));
        let store = ConfigStore::at(dir.join("prefs").join("vless_configs.json"));
        (store, dir)
    }

    fn raw(label: &str, port: u16) -> String {
        sample_doc(label, "203.0.113.7", port).to_string()
    }

    #[test]
    fn empty_store_lists_nothing() {
        let (store, dir) = scratch_store();
        assert!(store.list().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn add_persists_in_insertion_order() {
        let (store, dir) = scratch_store();
        store.add(&raw("first", 443)).expect("add first");
        store.add(&raw("second", 8443)).expect("add second");

        let reopened = ConfigStore::at(store.path().to_path_buf());
        let labels: Vec<String> = reopened.list().iter().map(CandidateConfig::label).collect();
        assert_eq!(labels, vec!["first", "second"]);

        let mode = fs::metadata(store.path()).expect("metadata").permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn slot_is_double_encoded() {
        let (store, dir) = scratch_store();
        store.add(&raw("first", 443)).expect("add");

        let slot = read_slot(store.path()).expect("read slot");
        let encoded = slot[CUSTOM_CONFIGS_KEY].as_str().expect("string value");
        let entries: Vec<String> = serde_json::from_str(encoded).expect("array of strings");
        assert_eq!(entries.len(), 1);
        assert!(CandidateConfig::from_json(&entries[0]).is_ok());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn duplicate_is_rejected() {
        let (store, dir) = scratch_store();
        store.add(&raw("first", 443)).expect("add");
        // same document, different whitespace and key order
        let reordered = serde_json::to_string_pretty(&sample_doc("first", "203.0.113.7", 443))
            .expect("pretty");
        let err = store.add(&reordered).expect_err("duplicate");
        assert!(matches!(err, ValidationError::Duplicate));
        assert_eq!(store.list().len(), 1);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn invalid_input_is_rejected() {
        let (store, dir) = scratch_store();
        let err = store.add("{not json").expect_err("invalid");
        assert!(matches!(err, ValidationError::InvalidFormat(_)));
        let err = store.add("[1,2]").expect_err("not an object");
        assert!(matches!(err, ValidationError::InvalidFormat(_)));
        assert!(store.list().is_empty());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn remove_by_index_and_ignore_out_of_range() {
        let (store, dir) = scratch_store();
        store.add(&raw("a", 1)).expect("add");
        store.add(&raw("b", 2)).expect("add");
        store.add(&raw("c", 3)).expect("add");

        store.remove(1).expect("remove");
        store.remove(17).expect("out of range is fine");
        let labels: Vec<String> = store.list().iter().map(CandidateConfig::label).collect();
        assert_eq!(labels, vec!["a", "c"]);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_entries_are_skipped_on_read() {
        let (store, dir) = scratch_store();
        let encoded = serde_json::to_string(&vec![
            raw("good", 443),
            "not json at all".to_string(),
            "[\"array\"]".to_string(),
            raw("also-good", 8443),
        ])
        .expect("encode");
        let mut slot = Map::new();
        slot.insert(CUSTOM_CONFIGS_KEY.to_string(), Value::String(encoded));
        slot.insert("other_key".to_string(), Value::String("kept".to_string()));
        write_atomic(store.path(), Value::Object(slot).to_string().as_bytes()).expect("seed");

        let labels: Vec<String> = store.list().iter().map(CandidateConfig::label).collect();
        assert_eq!(labels, vec!["good", "also-good"]);

        store.remove(0).expect("remove");
        let slot = read_slot(store.path()).expect("read slot");
        assert_eq!(slot["other_key"], Value::String("kept".to_string()));
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn unreadable_slot_blocks_mutations_and_is_kept() {
        let (store, dir) = scratch_store();
        let original = "[\"not\", \"an\", \"object\"]";
        write_atomic(store.path(), original.as_bytes()).expect("seed");

        assert!(store.list().is_empty());
        assert!(matches!(
            store.add(&raw("new", 443)),
            Err(ValidationError::Storage(_))
        ));
        assert!(store.remove(0).is_err());
        assert_eq!(fs::read_to_string(store.path()).expect("read"), original);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn malformed_list_value_blocks_mutations() {
        let (store, dir) = scratch_store();
        let mut slot = Map::new();
        slot.insert(CUSTOM_CONFIGS_KEY.to_string(), Value::String("{broken".to_string()));
        slot.insert("other_key".to_string(), Value::String("kept".to_string()));
        let original = Value::Object(slot).to_string();
        write_atomic(store.path(), original.as_bytes()).expect("seed");

        assert!(matches!(
            store.add(&raw("new", 443)),
            Err(ValidationError::Storage(_))
        ));
        assert_eq!(fs::read_to_string(store.path()).expect("read"), original);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn concurrent_adds_do_not_lose_updates() {
        let (store, dir) = scratch_store();
        let store = Arc::new(store);
        let handles: Vec<_> = (0..8u16)
            .map(|i| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || store.add(&raw(&format!("cfg-{}", i), 1000 + i)))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join").expect("add");
        }
        assert_eq!(store.list().len(), 8);
        let _ = fs::remove_dir_all(dir);
    }
}
