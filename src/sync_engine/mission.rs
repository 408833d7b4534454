//! Per-mission behaviour table.
//!
//! Product names start with the mission code (`S1A_...`, `S2B_...`), so the
//! rules for a product are looked up from its name, not from the mission the
//! process was started for.

use clap::ValueEnum;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref TWO_TIMESTAMPS: Regex = Regex::new(r"^(.*?\d{8}T\d{6}_\d{8}T\d{6})").unwrap();
    static ref ONE_TIMESTAMP: Regex = Regex::new(r"^(.*?\d{8}T\d{6})").unwrap();
    static ref ARCHIVE_SUFFIXES: Regex = Regex::new(r"(\.\w+){1,2}$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mission {
    S1,
    S2,
    S3,
    S5,
    S6,
}

/// How a product name maps to its sensing identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityRule {
    /// Keep everything up to and including the second `YYYYMMDDTHHMMSS`.
    SensingStartAndStop,
    /// Keep everything up to and including the first `YYYYMMDDTHHMMSS`.
    SensingStart,
}

#[derive(Debug, Clone, Copy)]
pub struct MissionDescriptor {
    pub mission: Mission,
    /// Default catalog collection name.
    pub collection: &'static str,
    pub identity_rule: IdentityRule,
    /// Extension of the downloaded payload, without the dot.
    pub file_extension: &'static str,
    /// Directory under `output_dir` holding this mission's products.
    pub storage_root: &'static str,
}

const DESCRIPTORS: [MissionDescriptor; 5] = [
    MissionDescriptor {
        mission: Mission::S1,
        collection: "SENTINEL-1",
        identity_rule: IdentityRule::SensingStartAndStop,
        file_extension: "zip",
        storage_root: "Sentinel-1",
    },
    MissionDescriptor {
        mission: Mission::S2,
        collection: "SENTINEL-2",
        identity_rule: IdentityRule::SensingStart,
        file_extension: "zip",
        storage_root: "Sentinel-2",
    },
    MissionDescriptor {
        mission: Mission::S3,
        collection: "SENTINEL-3",
        identity_rule: IdentityRule::SensingStartAndStop,
        file_extension: "zip",
        storage_root: "Sentinel-3",
    },
    MissionDescriptor {
        mission: Mission::S5,
        collection: "SENTINEL-5P",
        identity_rule: IdentityRule::SensingStartAndStop,
        file_extension: "nc",
        storage_root: "Sentinel-5P",
    },
    MissionDescriptor {
        mission: Mission::S6,
        collection: "SENTINEL-6",
        identity_rule: IdentityRule::SensingStartAndStop,
        file_extension: "zip",
        storage_root: "Sentinel-6",
    },
];

impl Mission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mission::S1 => "s1",
            Mission::S2 => "s2",
            Mission::S3 => "s3",
            Mission::S5 => "s5",
            Mission::S6 => "s6",
        }
    }

    pub fn descriptor(&self) -> &'static MissionDescriptor {
        match self {
            Mission::S1 => &DESCRIPTORS[0],
            Mission::S2 => &DESCRIPTORS[1],
            Mission::S3 => &DESCRIPTORS[2],
            Mission::S5 => &DESCRIPTORS[3],
            Mission::S6 => &DESCRIPTORS[4],
        }
    }

    /// Mission of a product, from the first two characters of its name.
    pub fn of_product(product_name: &str) -> Option<Mission> {
        match product_name.get(..2)? {
            "S1" => Some(Mission::S1),
            "S2" => Some(Mission::S2),
            "S3" => Some(Mission::S3),
            "S5" => Some(Mission::S5),
            "S6" => Some(Mission::S6),
            _ => None,
        }
    }
}

impl fmt::Display for Mission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog `Name` with up to two trailing suffixes removed
/// (`X.SAFE.zip` → `X`, `X.nc` → `X`).
pub fn canonical_name(catalog_name: &str) -> String {
    ARCHIVE_SUFFIXES.replace(catalog_name, "").into_owned()
}

/// The part of a product name that only depends on sensing time. Later
/// reprocessings of the same acquisition share it, so it is what the on-disk
/// check matches against. Names from unknown missions, or without the
/// expected timestamps, are their own identity.
pub fn sensing_identity(product_name: &str) -> String {
    let rule = match Mission::of_product(product_name) {
        Some(mission) => mission.descriptor().identity_rule,
        None => return product_name.to_string(),
    };
    let pattern: &Regex = match rule {
        IdentityRule::SensingStartAndStop => &TWO_TIMESTAMPS,
        IdentityRule::SensingStart => &ONE_TIMESTAMP,
    };
    pattern
        .captures(product_name)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| product_name.to_string())
}

/// Payload extension for a product, `nc` for Sentinel-5P and `zip` otherwise.
pub fn file_extension(product_name: &str) -> &'static str {
    Mission::of_product(product_name)
        .map(|m| m.descriptor().file_extension)
        .unwrap_or("zip")
}
