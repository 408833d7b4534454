//! Where products live on disk once downloaded.

use super::mission::Mission;
use lazy_static::lazy_static;
use regex::Regex;
use std::path::{Path, PathBuf};

lazy_static! {
    static ref SENSING_DATE: Regex = Regex::new(r"(\d{4})(\d{2})(\d{2})T\d{6}").unwrap();
}

/// Maps a sensing identity to the directory its products are stored in.
pub trait PathResolver: Send + Sync {
    fn storage_dir(&self, identity: &str) -> PathBuf;
}

/// `<output_dir>/<mission root>/YYYY/MM/DD`, dated by the first timestamp in
/// the identity. Identities without a timestamp go to `<mission root>/undated`.
pub struct DatePartitionedResolver {
    output_dir: PathBuf,
    default_mission: Mission,
}

impl DatePartitionedResolver {
    pub fn new<P: AsRef<Path>>(output_dir: P, default_mission: Mission) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            default_mission,
        }
    }
}

impl PathResolver for DatePartitionedResolver {
    fn storage_dir(&self, identity: &str) -> PathBuf {
        let mission = Mission::of_product(identity).unwrap_or(self.default_mission);
        let root = self.output_dir.join(mission.descriptor().storage_root);
        match SENSING_DATE.captures(identity) {
            Some(caps) => root.join(&caps[1]).join(&caps[2]).join(&caps[3]),
            None => root.join("undated"),
        }
    }
}

/// Everything in one directory. Handy for tests and flat archives.
pub struct FlatResolver {
    dir: PathBuf,
}

impl FlatResolver {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }
}

impl PathResolver for FlatResolver {
    fn storage_dir(&self, _identity: &str) -> PathBuf {
        self.dir.clone()
    }
}

/// True when any file in `dir` has a name starting with `identity`.
pub fn exists_on_disk(dir: &Path, identity: &str) -> bool {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return false,
    };
    entries
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().starts_with(identity))
}
