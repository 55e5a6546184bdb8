//! CalVer tags (`YEAR.WEEK.SECONDS_INTO_WEEK+HASH`) and the `# Version:`
//! marker line embedded in script payloads.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const MARKER_PREFIX: &str = "# Version:";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VersionTag {
    pub year: u32,
    pub week: u32,
    pub seconds: u32,
    /// Source revision. Informational only, never part of ordering.
    pub hash: String,
}

impl VersionTag {
    /// Tag for the given instant: ISO year, ISO week, seconds since Monday 00:00 UTC.
    pub fn at(instant: DateTime<Utc>, hash: impl Into<String>) -> Self {
        let iso = instant.iso_week();
        let seconds = instant.weekday().num_days_from_monday() * 86_400
            + instant.num_seconds_from_midnight();
        Self {
            year: iso.year() as u32,
            week: iso.week(),
            seconds,
            hash: hash.into(),
        }
    }

    pub fn now(hash: impl Into<String>) -> Self {
        Self::at(Utc::now(), hash)
    }

    /// Field-wise numeric comparison of year, week and seconds.
    pub fn compare(&self, other: &VersionTag) -> Ordering {
        (self.year, self.week, self.seconds).cmp(&(other.year, other.week, other.seconds))
    }

    pub fn is_newer_than(&self, other: &VersionTag) -> bool {
        self.compare(other) == Ordering::Greater
    }
}

impl FromStr for VersionTag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidVersion(s.to_string());
        let trimmed = s.trim();
        let (numbers, hash) = match trimmed.split_once('+') {
            Some((numbers, hash)) => (numbers, hash),
            None => (trimmed, ""),
        };
        if !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }

        let mut fields = numbers.split('.');
        let mut next = || -> Result<u32> {
            fields
                .next()
                .filter(|f| !f.is_empty() && f.chars().all(|c| c.is_ascii_digit()))
                .and_then(|f| f.parse::<u32>().ok())
                .ok_or_else(invalid)
        };
        let year = next()?;
        let week = next()?;
        let seconds = next()?;
        if fields.next().is_some() {
            return Err(invalid());
        }

        Ok(Self {
            year,
            week,
            seconds,
            hash: hash.to_string(),
        })
    }
}

impl fmt::Display for VersionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}.{:06}", self.year, self.week, self.seconds)?;
        if !self.hash.is_empty() {
            write!(f, "+{}", self.hash)?;
        }
        Ok(())
    }
}

/// First well-formed `# Version:` marker in the payload, if any.
pub fn read_marker(payload: &str) -> Option<VersionTag> {
    payload
        .lines()
        .filter_map(|line| line.trim_start().strip_prefix(MARKER_PREFIX))
        .find_map(|rest| rest.trim().parse().ok())
}

pub fn read_marker_from_file(path: &Path) -> Result<Option<VersionTag>> {
    let bytes = std::fs::read(path)?;
    Ok(read_marker(&String::from_utf8_lossy(&bytes)))
}

/// Replace the payload's marker line with `tag`, or insert one after a
/// leading shebang (or at the top) when there is none.
pub fn stamp_marker(payload: &str, tag: &VersionTag) -> String {
    let marker = format!("{} {}", MARKER_PREFIX, tag);
    let mut replaced = false;
    let mut lines: Vec<String> = payload
        .lines()
        .map(|line| {
            if !replaced && line.trim_start().starts_with(MARKER_PREFIX) {
                replaced = true;
                marker.clone()
            } else {
                line.to_string()
            }
        })
        .collect();

    if !replaced {
        let at = usize::from(lines.first().is_some_and(|l| l.starts_with("#!")));
        lines.insert(at, marker);
    }

    let mut out = lines.join("\n");
    if payload.ends_with('\n') || payload.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tag(s: &str) -> VersionTag {
        s.parse().unwrap()
    }

    #[test]
    fn numeric_fields_dominate_hash() {
        let a = tag("2024.49.100000+abc");
        let b = tag("2024.50.000001+def");
        let c = tag("2025.01.000000+xyz");
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&c), Ordering::Less);
        assert!(c.is_newer_than(&a));
    }

    #[test]
    fn comparison_is_numeric_not_lexical() {
        assert!(tag("2024.10.5+a").is_newer_than(&tag("2024.9.999999+a")));
        assert!(tag("2024.01.000010+a").is_newer_than(&tag("2024.01.9+a")));
    }

    #[test]
    fn hash_is_ignored_for_ordering() {
        let a = tag("2024.30.000100+aaa");
        let b = tag("2024.30.000100+zzz");
        assert_eq!(a.compare(&b), Ordering::Equal);
        assert!(!a.is_newer_than(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn rejects_malformed_tags() {
        for bad in ["", "2024", "2024.1", "2024.1.x+abc", "2024.1.2.3", "2024.1.2+a-b"] {
            assert!(bad.parse::<VersionTag>().is_err(), "{bad:?} should fail");
        }
    }

    #[test]
    fn display_pads_fields() {
        assert_eq!(tag("2025.1.42+f00d").to_string(), "2025.01.000042+f00d");
    }

    #[test]
    fn tag_from_instant_uses_iso_week() {
        // Wednesday 2025-01-01 is in ISO week 1 of 2025.
        let instant = Utc.with_ymd_and_hms(2025, 1, 1, 1, 0, 0).unwrap();
        let t = VersionTag::at(instant, "abc");
        assert_eq!(t.year, 2025);
        assert_eq!(t.week, 1);
        assert_eq!(t.seconds, 2 * 86_400 + 3_600);

        // Sunday 2024-12-29 still belongs to ISO week 52 of 2024.
        let instant = Utc.with_ymd_and_hms(2024, 12, 29, 0, 0, 0).unwrap();
        let t = VersionTag::at(instant, "abc");
        assert_eq!((t.year, t.week), (2024, 52));
    }

    #[test]
    fn marker_round_trip_through_stamp() {
        let script = "#!/usr/bin/env bash\n# Version: 2024.01.000001+old\necho hi\n";
        let new = tag("2024.02.000002+new");
        let stamped = stamp_marker(script, &new);
        assert_eq!(read_marker(&stamped), Some(new));
        assert_eq!(stamped.matches(MARKER_PREFIX).count(), 1);
        assert!(stamped.starts_with("#!/usr/bin/env bash\n"));
    }

    #[test]
    fn stamp_inserts_after_shebang() {
        let stamped = stamp_marker("#!/bin/sh\necho hi\n", &tag("2024.02.000002+abc"));
        assert_eq!(
            stamped,
            "#!/bin/sh\n# Version: 2024.02.000002+abc\necho hi\n"
        );
    }

    #[test]
    fn missing_marker_reads_none() {
        assert_eq!(read_marker("#!/bin/sh\necho hi\n"), None);
        assert_eq!(read_marker("# Version: not-a-version\n"), None);
    }
}
