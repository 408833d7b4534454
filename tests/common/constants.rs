#![allow(dead_code)]

// Sentinel-1 products with distinct sensing times, all sensed on 2024-03-01.
pub const S1_PRODUCT_A: &str =
    "S1A_IW_GRDH_1SDV_20240301T120000_20240301T120025_052000_064A4B_1A2B";
pub const S1_PRODUCT_B: &str =
    "S1A_IW_GRDH_1SDV_20240301T120100_20240301T120125_052000_064A4B_3C4D";
pub const S1_PRODUCT_C: &str =
    "S1A_IW_GRDH_1SDV_20240301T120200_20240301T120225_052000_064A4B_5E6F";

pub const CATALOG_URL: &str = "https://catalog.test/odata/v1";

/// Catalog ids are derived from names so assertions can recompute them.
pub fn catalog_id(name: &str) -> String {
    format!("id-{}", name)
}
