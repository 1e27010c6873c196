//! Byte-unit conversions shared by every presentation layer.
//!
//! All conversions use the binary divisor so that a size rendered in KB, MB
//! or GB always round-trips through the same factor.

use crate::model::SizeUnit;

pub const UNIT_DIVISOR: f64 = 1024.0;

pub fn convert_bytes_to_kb(bytes: u64) -> f64 {
    bytes as f64 / UNIT_DIVISOR
}

pub fn convert_bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / UNIT_DIVISOR.powi(2)
}

pub fn convert_bytes_to_gb(bytes: u64) -> f64 {
    bytes as f64 / UNIT_DIVISOR.powi(3)
}

pub fn convert_gb_to_mb(gb: f64) -> f64 {
    gb * UNIT_DIVISOR
}

/// Renders `bytes` in the requested unit. `Auto` switches from MB to GB once
/// the value reaches 1024 MB.
pub fn format_size(bytes: u64, unit: SizeUnit) -> String {
    let gb = convert_bytes_to_gb(bytes);
    let use_gb = match unit {
        SizeUnit::Gb => true,
        SizeUnit::Mb => false,
        SizeUnit::Auto => convert_gb_to_mb(gb) >= UNIT_DIVISOR,
    };

    if use_gb {
        format!("{gb:.2} GB")
    } else {
        format!("{:.2} MB", convert_gb_to_mb(gb))
    }
}

/// Compact rendering with an adaptive binary unit, used in log lines.
pub fn human_bytes(value: u64) -> String {
    humansize::format_size(value, humansize::BINARY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_share_the_binary_divisor() {
        assert_eq!(convert_bytes_to_kb(2048), 2.0);
        assert_eq!(convert_bytes_to_mb(5_242_880), 5.0);
        assert_eq!(convert_bytes_to_gb(1_073_741_824), 1.0);
        assert_eq!(convert_gb_to_mb(1.5), 1536.0);
        assert_eq!(convert_gb_to_mb(convert_bytes_to_gb(7_340_032)), 7.0);
    }

    #[test]
    fn auto_unit_switches_at_one_gigabyte() {
        assert_eq!(format_size(7_340_032, SizeUnit::Auto), "7.00 MB");
        assert_eq!(format_size(1_073_741_824, SizeUnit::Auto), "1.00 GB");
        assert_eq!(format_size(1_073_741_823, SizeUnit::Auto), "1024.00 MB");
        assert_eq!(format_size(536_870_912, SizeUnit::Gb), "0.50 GB");
        assert_eq!(format_size(2_147_483_648, SizeUnit::Mb), "2048.00 MB");
    }

    #[test]
    fn human_bytes_picks_largest_unit() {
        assert!(human_bytes(512).ends_with(" B"));
        assert!(human_bytes(1536).starts_with("1.5"));
        assert!(human_bytes(1536).ends_with("KiB"));
        assert!(human_bytes(5_242_880).ends_with("MiB"));
    }
}
