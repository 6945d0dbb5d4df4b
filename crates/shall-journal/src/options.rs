//! Mount options.
//!
//! Options are parsed from the comma-separated string the mount command
//! passes down and can only change on remount, where they are swapped
//! atomically; readers therefore never lock to consult them.

use shall_error::{Result, ShallError};
use std::fmt;
use std::str::FromStr;

/// Smallest accepted commit buffer (one page).
pub const MIN_COMMIT_SIZE: usize = 4096;

/// What to do when a record does not fit in the data space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Drop the record after logging a single OVERFLOW marker.
    Drop,
    /// Suspend the producer until a consumer frees space.
    #[default]
    Wait,
}

/// What to do when a record exceeds the commit buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TooBigPolicy {
    /// Replace the record with a TOO_BIG marker carrying the required size.
    #[default]
    Log,
    /// Fail the originating operation.
    Error,
}

/// Which side(s) of an operation the filesystem layer should log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTiming {
    Before,
    #[default]
    After,
    Twice,
}

impl LogTiming {
    #[must_use]
    pub fn log_before(self) -> bool {
        matches!(self, Self::Before | Self::Twice)
    }

    #[must_use]
    pub fn log_after(self) -> bool {
        matches!(self, Self::After | Self::Twice)
    }
}

/// How much of a write's content the WRITE record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataMode {
    /// Region only.
    #[default]
    None,
    /// Region plus a 32-byte content hash.
    Hash,
    /// Region plus the raw bytes, sliced across records.
    Full,
}

/// Parsed mount options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    pub overflow: OverflowPolicy,
    pub too_big: TooBigPolicy,
    pub timing: LogTiming,
    pub data: DataMode,
    /// Background commit cadence in seconds.
    pub commit_seconds: u64,
    /// In-memory commit buffer size in bytes.
    pub commit_size: usize,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            overflow: OverflowPolicy::default(),
            too_big: TooBigPolicy::default(),
            timing: LogTiming::default(),
            data: DataMode::default(),
            commit_seconds: 5,
            commit_size: MIN_COMMIT_SIZE,
        }
    }
}

impl MountOptions {
    /// Validate option constraints; the parser and the engine entry points
    /// both funnel through here.
    pub fn validate(&self) -> Result<()> {
        if self.commit_seconds < 1 {
            return Err(ShallError::Format(
                "commit interval must be at least one second".into(),
            ));
        }
        if self.commit_size < MIN_COMMIT_SIZE {
            return Err(ShallError::Format(format!(
                "commit buffer must be at least {MIN_COMMIT_SIZE} bytes"
            )));
        }
        Ok(())
    }

    /// Parse one `key=value` option into an existing set, as remount does.
    pub fn apply(&mut self, option: &str) -> Result<()> {
        let (key, value) = option.split_once('=').ok_or_else(|| {
            ShallError::Format(format!("invalid mount option \"{option}\""))
        })?;
        match key {
            "overflow" => {
                self.overflow = match value {
                    "drop" => OverflowPolicy::Drop,
                    "wait" => OverflowPolicy::Wait,
                    _ => return Err(bad_value(key, value)),
                };
            }
            "too_big" => {
                self.too_big = match value {
                    "log" => TooBigPolicy::Log,
                    "error" => TooBigPolicy::Error,
                    _ => return Err(bad_value(key, value)),
                };
            }
            "log" => {
                self.timing = match value {
                    "before" => LogTiming::Before,
                    "after" => LogTiming::After,
                    "twice" | "both" => LogTiming::Twice,
                    _ => return Err(bad_value(key, value)),
                };
            }
            "data" => {
                self.data = match value {
                    "none" => DataMode::None,
                    "hash" => DataMode::Hash,
                    "data" => DataMode::Full,
                    _ => return Err(bad_value(key, value)),
                };
            }
            "commit" => {
                let (seconds, size) = value
                    .split_once(':')
                    .ok_or_else(|| bad_value(key, value))?;
                self.commit_seconds = seconds.parse().map_err(|_| bad_value(key, value))?;
                self.commit_size = size.parse().map_err(|_| bad_value(key, value))?;
            }
            _ => {
                return Err(ShallError::Format(format!(
                    "invalid mount option \"{option}\""
                )));
            }
        }
        Ok(())
    }
}

fn bad_value(key: &str, value: &str) -> ShallError {
    ShallError::Format(format!("invalid value for \"{key}\": \"{value}\""))
}

impl FromStr for MountOptions {
    type Err = ShallError;

    fn from_str(s: &str) -> Result<Self> {
        let mut options = Self::default();
        for option in s.split(',') {
            if option.is_empty() {
                continue;
            }
            options.apply(option)?;
        }
        options.validate()?;
        Ok(options)
    }
}

impl fmt::Display for MountOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "overflow={},too_big={},commit={}:{},log={},data={}",
            match self.overflow {
                OverflowPolicy::Drop => "drop",
                OverflowPolicy::Wait => "wait",
            },
            match self.too_big {
                TooBigPolicy::Log => "log",
                TooBigPolicy::Error => "error",
            },
            self.commit_seconds,
            self.commit_size,
            match self.timing {
                LogTiming::Before => "before",
                LogTiming::After => "after",
                LogTiming::Twice => "twice",
            },
            match self.data {
                DataMode::None => "none",
                DataMode::Hash => "hash",
                DataMode::Full => "data",
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_mount_defaults() {
        let options = MountOptions::default();
        assert_eq!(options.overflow, OverflowPolicy::Wait);
        assert_eq!(options.too_big, TooBigPolicy::Log);
        assert_eq!(options.timing, LogTiming::After);
        assert_eq!(options.data, DataMode::None);
        assert_eq!(options.commit_seconds, 5);
        assert_eq!(options.commit_size, MIN_COMMIT_SIZE);
    }

    #[test]
    fn parses_a_full_option_string() {
        let options: MountOptions = "overflow=drop,too_big=error,commit=2:8192,log=both,data=hash"
            .parse()
            .expect("parse");
        assert_eq!(options.overflow, OverflowPolicy::Drop);
        assert_eq!(options.too_big, TooBigPolicy::Error);
        assert_eq!(options.commit_seconds, 2);
        assert_eq!(options.commit_size, 8192);
        assert_eq!(options.timing, LogTiming::Twice);
        assert!(options.timing.log_before());
        assert!(options.timing.log_after());
        assert_eq!(options.data, DataMode::Hash);
    }

    #[test]
    fn empty_string_yields_defaults() {
        let options: MountOptions = "".parse().expect("parse");
        assert_eq!(options, MountOptions::default());
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        assert!("frobnicate=yes".parse::<MountOptions>().is_err());
        assert!("overflow=maybe".parse::<MountOptions>().is_err());
        assert!("commit=0:4096".parse::<MountOptions>().is_err());
        assert!("commit=5:100".parse::<MountOptions>().is_err());
        assert!("commit=nonsense".parse::<MountOptions>().is_err());
    }

    #[test]
    fn display_round_trips_through_the_parser() {
        let options: MountOptions = "overflow=drop,commit=9:16384,data=data"
            .parse()
            .expect("parse");
        let reparsed: MountOptions = options.to_string().parse().expect("reparse");
        assert_eq!(options, reparsed);
    }
}
