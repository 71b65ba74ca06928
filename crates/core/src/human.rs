//! Human-readable renderings for byte counts and bit rates.

const BYTE_UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
const BIT_RATE_UNITS: [&str; 6] = ["bps", "Kbps", "Mbps", "Gbps", "Tbps", "Pbps"];

/// Renders a byte count with binary (1024) prefixes, e.g. `123456789` -> `"117.7 MB"`.
pub fn bytes_to_human(bytes: u64) -> String {
    for (exp, unit) in BYTE_UNITS.iter().enumerate().rev() {
        let factor = 1024u64.pow(exp as u32);
        if bytes >= factor {
            return format!("{:.1} {unit}", bytes as f64 / factor as f64);
        }
    }
    format!("{bytes} B")
}

/// Renders a bit rate with decimal (1000) prefixes, e.g. `12345678.0` -> `"12.3 Mbps"`.
pub fn bits_to_human(bits_per_second: f64) -> String {
    for (exp, unit) in BIT_RATE_UNITS.iter().enumerate().rev() {
        let factor = 1000f64.powi(exp as i32);
        if bits_per_second >= factor {
            return format!("{:.1} {unit}", bits_per_second / factor);
        }
    }
    format!("{:.1} bps", bits_per_second.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_pick_largest_unit_not_exceeding_value() {
        assert!(bytes_to_human(123_456_789).ends_with("MB"));
        assert_eq!(bytes_to_human(123_456_789), "117.7 MB");
        assert_eq!(bytes_to_human(1024), "1.0 KB");
        assert_eq!(bytes_to_human(1023), "1023.0 B");
        assert_eq!(bytes_to_human(5), "5.0 B");
        assert_eq!(bytes_to_human(0), "0 B");
        assert_eq!(bytes_to_human(3 * 1024 * 1024 * 1024), "3.0 GB");
    }

    #[test]
    fn bit_rates_use_decimal_prefixes() {
        assert!(bits_to_human(12_345_678.0).ends_with("Mbps"));
        assert_eq!(bits_to_human(12_345_678.0), "12.3 Mbps");
        assert_eq!(bits_to_human(1000.0), "1.0 Kbps");
        assert_eq!(bits_to_human(999.0), "999.0 bps");
        assert_eq!(bits_to_human(0.0), "0.0 bps");
    }
}
