const SIZE_SUFFIXES: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// Formats a byte count with decimal (base 1000) units, two decimals at most.
pub fn human_readable_size(bytes: u64) -> String {
    let mut value = bytes as f64;
    let mut suffix = 0;
    while suffix < SIZE_SUFFIXES.len() - 1 && value >= 1000.0 {
        value /= 1000.0;
        suffix += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{} {}", rounded, SIZE_SUFFIXES[suffix])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes() {
        assert_eq!(human_readable_size(0), "0 B");
        assert_eq!(human_readable_size(999), "999 B");
        assert_eq!(human_readable_size(1000), "1 KB");
        assert_eq!(human_readable_size(1536), "1.54 KB");
        assert_eq!(human_readable_size(2_500_000), "2.5 MB");
        assert_eq!(human_readable_size(7_000_000_000_000_000), "7000 TB");
    }
}
