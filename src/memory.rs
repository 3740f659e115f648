//! Memory size parsing and formatting utilities.
//!
//! Provides human-readable memory size parsing (e.g., "3M", "256K") used for
//! shared memory segment sizes and sizing pads.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Memory size in bytes with parsing and formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MemorySize(u64);

impl MemorySize {
    /// Create from raw bytes.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from kibibytes (KiB).
    pub const fn from_kib(kib: u64) -> Self {
        Self(kib * 1024)
    }

    /// Create from mebibytes (MiB).
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * 1024 * 1024)
    }

    /// Get the raw byte count.
    pub const fn as_bytes(&self) -> u64 {
        self.0
    }

    /// Byte count as `usize`, for sizing mappings.
    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Get the size in kibibytes (KiB), truncated.
    pub const fn as_kib(&self) -> u64 {
        self.0 / 1024
    }

    /// Get the size in mebibytes (MiB), truncated.
    pub const fn as_mib(&self) -> u64 {
        self.0 / (1024 * 1024)
    }
}

/// Errors that can occur when parsing memory sizes.
#[derive(Debug, Clone, Error)]
pub enum MemoryError {
    #[error("invalid memory size: {0}")]
    InvalidFormat(String),

    #[error("memory size {size} is below the minimum of {minimum}")]
    TooSmall { size: MemorySize, minimum: MemorySize },
}

impl FromStr for MemorySize {
    type Err = MemoryError;

    /// Parse a human-readable memory size string.
    ///
    /// Supported formats:
    /// - Plain number: treated as bytes (e.g., "65536")
    /// - With suffix: "256K", "256KB", "256KiB", "3M", "3MB", "3MiB", "1G"
    /// - Case insensitive
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(MemoryError::InvalidFormat("empty string".into()));
        }

        let num_end = s
            .chars()
            .position(|c| !c.is_ascii_digit() && c != '.')
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(MemoryError::InvalidFormat(format!(
                "no numeric value in '{}'",
                s
            )));
        }

        let num_str = &s[..num_end];
        let suffix = s[num_end..].trim().to_lowercase();

        let value: f64 = num_str
            .parse()
            .map_err(|_| MemoryError::InvalidFormat(format!("invalid number: '{}'", num_str)))?;

        let multiplier: u64 = match suffix.as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => 1024,
            "m" | "mb" | "mib" => 1024 * 1024,
            "g" | "gb" | "gib" => 1024 * 1024 * 1024,
            _ => {
                return Err(MemoryError::InvalidFormat(format!(
                    "unknown suffix: '{}'",
                    suffix
                )));
            }
        };

        Ok(MemorySize((value * multiplier as f64) as u64))
    }
}

impl fmt::Display for MemorySize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const MIB: u64 = 1024 * 1024;

        if self.0 >= MIB {
            let mib = self.0 as f64 / MIB as f64;
            if mib.fract() < 0.01 {
                write!(f, "{} MiB", self.as_mib())
            } else {
                write!(f, "{:.1} MiB", mib)
            }
        } else if self.as_kib() > 0 {
            write!(f, "{} KiB", self.as_kib())
        } else {
            write!(f, "{} bytes", self.0)
        }
    }
}

/// Parse a segment size for the CLI, rejecting sizes too small to hold a header.
pub fn parse_segment_size(s: &str) -> Result<MemorySize, MemoryError> {
    let size: MemorySize = s.parse()?;
    if size < MIN_SEGMENT_SIZE {
        return Err(MemoryError::TooSmall {
            size,
            minimum: MIN_SEGMENT_SIZE,
        });
    }
    Ok(size)
}

/// Smallest segment accepted from configuration.
pub const MIN_SEGMENT_SIZE: MemorySize = MemorySize::from_kib(4);

/// Initial size of the command queue segment.
pub const DEFAULT_COMMAND_MEMORY: MemorySize = MemorySize::from_mib(1);

/// Initial size of the status board segment.
pub const DEFAULT_STATUS_MEMORY: MemorySize = MemorySize::from_mib(1);

/// Initial size of each per-worker result segment.
pub const DEFAULT_STORAGE_MEMORY: MemorySize = MemorySize::from_mib(3);

/// Safety pad added to every intermediate storage size estimate.
pub const DEFAULT_STORAGE_PAD: MemorySize = MemorySize::from_mib(1);

/// Estimated overhead of one status entry.
pub const DEFAULT_STATUS_ENTRY_OVERHEAD: MemorySize = MemorySize::from_kib(256);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_number_as_bytes() {
        assert_eq!(MemorySize::from_str("65536").unwrap().as_bytes(), 65536);
        assert_eq!(MemorySize::from_str("1024").unwrap().as_kib(), 1);
    }

    #[test]
    fn test_parse_with_suffix() {
        assert_eq!(MemorySize::from_str("256K").unwrap().as_kib(), 256);
        assert_eq!(MemorySize::from_str("256kib").unwrap().as_kib(), 256);
        assert_eq!(MemorySize::from_str("3M").unwrap().as_mib(), 3);
        assert_eq!(MemorySize::from_str("3MB").unwrap().as_mib(), 3);
        assert_eq!(MemorySize::from_str("1G").unwrap().as_mib(), 1024);
        assert_eq!(MemorySize::from_str("12b").unwrap().as_bytes(), 12);
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(MemorySize::from_str("1.5M").unwrap().as_kib(), 1536);
        assert_eq!(MemorySize::from_str("0.5K").unwrap().as_bytes(), 512);
    }

    #[test]
    fn test_parse_errors() {
        assert!(MemorySize::from_str("").is_err());
        assert!(MemorySize::from_str("abc").is_err());
        assert!(MemorySize::from_str("32X").is_err());
        assert!(MemorySize::from_str("-5M").is_err());
    }

    #[test]
    fn test_parse_segment_size_minimum() {
        assert_eq!(parse_segment_size("1M").unwrap(), MemorySize::from_mib(1));
        let err = parse_segment_size("100").unwrap_err();
        assert!(matches!(err, MemoryError::TooSmall { .. }));
        assert!(err.to_string().contains("4 KiB"));
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", MemorySize::from_mib(3)), "3 MiB");
        assert_eq!(format!("{}", MemorySize::from_kib(1536)), "1.5 MiB");
        assert_eq!(format!("{}", MemorySize::from_kib(256)), "256 KiB");
        assert_eq!(format!("{}", MemorySize::from_bytes(12)), "12 bytes");
    }

    #[test]
    fn test_defaults() {
        assert_eq!(DEFAULT_COMMAND_MEMORY.as_usize(), 1_048_576);
        assert_eq!(DEFAULT_STORAGE_MEMORY.as_mib(), 3);
        assert_eq!(DEFAULT_STORAGE_PAD.as_mib(), 1);
        assert_eq!(DEFAULT_STATUS_ENTRY_OVERHEAD.as_usize(), 262_144);
    }
}
