mod table_schema;

pub use table_schema::{check_file_integrity, Column, SqlType, Table, DEFAULT_TIMESTAMP};
