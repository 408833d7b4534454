//! Table definition shared by the work queue and the failure ledger.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, DEFAULT_TIMESTAMP};

pub const PRODUCTS_TABLE_NAME: &str = "products";

/// Both database files carry exactly this table. External tooling reads these
/// files, so the column shape must not drift.
pub const PRODUCTS_TABLE: Table = Table {
    name: PRODUCTS_TABLE_NAME,
    columns: &[
        sqlite_column!("name", &SqlType::Text, is_primary_key = true),
        sqlite_column!("id", &SqlType::Text),
        sqlite_column!("attempts", &SqlType::Integer, default_value = Some("0")),
        sqlite_column!("progress", &SqlType::Text, default_value = Some("'Pending'")),
        sqlite_column!(
            "created",
            &SqlType::Timestamp,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "modified",
            &SqlType::Timestamp,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
};
