//! Query time cursor.
//!
//! The cursor is the `start_timestamp` key of the mission config file. It is
//! advanced after each query cycle by rewriting that one key in place.

use crate::sync_engine::catalog_client::{format_timestamp, TIMESTAMP_FORMAT};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::info;

pub const CURSOR_KEY: &str = "start_timestamp";

pub trait CursorStore: Send + Sync {
    fn load(&self) -> Result<DateTime<Utc>>;
    fn store(&self, next: DateTime<Utc>) -> Result<()>;
}

pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .with_context(|| format!("Invalid timestamp {:?}, expected YYYY-MM-DDTHH:MM:SSZ", s))?;
    Ok(naive.and_utc())
}

pub struct TomlCursorStore {
    path: PathBuf,
}

impl TomlCursorStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<toml::Table> {
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file: {:?}", self.path))?;
        content
            .parse::<toml::Table>()
            .with_context(|| format!("Failed to parse config file: {:?}", self.path))
    }
}

impl CursorStore for TomlCursorStore {
    fn load(&self) -> Result<DateTime<Utc>> {
        let table = self.read_table()?;
        let value = table
            .get(CURSOR_KEY)
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("{} is missing from {:?}", CURSOR_KEY, self.path))?;
        parse_timestamp(value)
    }

    /// Comments and key order of the file are not preserved.
    fn store(&self, next: DateTime<Utc>) -> Result<()> {
        let mut table = self.read_table()?;
        let formatted = format_timestamp(&next);
        table.insert(
            CURSOR_KEY.to_string(),
            toml::Value::String(formatted.clone()),
        );
        let content = toml::to_string(&table)?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {:?}", self.path))?;

        info!("Cursor advanced to {}", formatted);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_load_and_store_keep_other_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s1_config.toml");
        std::fs::write(
            &path,
            "start_timestamp = \"2024-01-01T00:00:00Z\"\ncollection = \"SENTINEL-1\"\ntime_window = 60\n",
        )
        .unwrap();
        let store = TomlCursorStore::new(&path);

        assert_eq!(
            store.load().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
        );

        store
            .store(Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap())
            .unwrap();
        assert_eq!(
            store.load().unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 30, 0).unwrap()
        );

        let table: toml::Table = std::fs::read_to_string(&path).unwrap().parse().unwrap();
        assert_eq!(table["collection"].as_str(), Some("SENTINEL-1"));
        assert_eq!(table["time_window"].as_integer(), Some(60));
        assert!(!dir.path().join("s1_config.toml.tmp").exists());
    }

    #[test]
    fn test_missing_cursor_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("s2_config.toml");
        std::fs::write(&path, "collection = \"SENTINEL-2\"\n").unwrap();
        let err = TomlCursorStore::new(&path).load().unwrap_err().to_string();
        assert!(err.contains("start_timestamp"));
    }

    #[test]
    fn test_parse_timestamp_rejects_other_formats() {
        assert!(parse_timestamp("2024-01-01T00:00:00Z").is_ok());
        assert!(parse_timestamp("2024-01-01 00:00:00").is_err());
    }
}
