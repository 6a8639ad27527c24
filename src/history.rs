use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::AppError;

/// One remembered device. Most-recent-first on disk, deduplicated by serial.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeviceRecord {
    pub serial: String,
    pub model: String,
    /// Network address for Wi-Fi devices, used to offer reconnects.
    pub address: Option<String>,
    pub last_seen: String,
}

impl DeviceRecord {
    pub fn new(serial: impl Into<String>, model: impl Into<String>, address: Option<String>) -> Self {
        Self {
            serial: serial.into(),
            model: model.into(),
            address,
            last_seen: Utc::now().to_rfc3339(),
        }
    }
}

pub fn history_path() -> PathBuf {
    if let Ok(path) = std::env::var("DROIDGLASS_HISTORY_PATH") {
        return PathBuf::from(path);
    }
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    home.join(".droidglass_history.json")
}

pub fn load_history(path: &Path) -> Vec<DeviceRecord> {
    let Ok(raw) = fs::read_to_string(path) else {
        return Vec::new();
    };
    serde_json::from_str(&raw).unwrap_or_default()
}

pub fn save_history(path: &Path, records: &[DeviceRecord]) -> Result<(), AppError> {
    if let Some(parent) = path.parent() {
        let _ = fs::create_dir_all(parent);
    }
    let payload = serde_json::to_string_pretty(records)
        .map_err(|err| AppError::system(format!("Failed to serialize history: {err}"), ""))?;
    fs::write(path, payload)
        .map_err(|err| AppError::system(format!("Failed to write history: {err}"), ""))?;
    Ok(())
}

/// Prepends (or refreshes) one record and trims to the bound.
pub fn record_device(
    path: &Path,
    record: DeviceRecord,
    max_entries: usize,
) -> Result<Vec<DeviceRecord>, AppError> {
    let mut records = load_history(path);
    records.retain(|entry| entry.serial != record.serial);
    records.insert(0, record);
    records.truncate(max_entries.max(1));
    save_history(path, &records)?;
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_first_and_deduplicates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");

        record_device(&path, DeviceRecord::new("A1", "Pixel 6", None), 3).expect("record");
        record_device(&path, DeviceRecord::new("B2", "Galaxy S22", None), 3).expect("record");
        let records =
            record_device(&path, DeviceRecord::new("A1", "Pixel 6 Pro", None), 3).expect("record");

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].serial, "A1");
        assert_eq!(records[0].model, "Pixel 6 Pro");
        assert_eq!(records[1].serial, "B2");
    }

    #[test]
    fn trims_to_bound() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.json");
        for idx in 0..5 {
            record_device(
                &path,
                DeviceRecord::new(format!("serial-{idx}"), "Model", None),
                3,
            )
            .expect("record");
        }
        let records = load_history(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].serial, "serial-4");
        assert_eq!(records[2].serial, "serial-2");
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let records = load_history(&dir.path().join("absent.json"));
        assert!(records.is_empty());
    }
}
