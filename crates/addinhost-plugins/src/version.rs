//! Plugin versions and version ranges

use crate::{PluginError, PluginResult};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// `major.minor.patch[.build]`, compared component-wise
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: u32,
}

impl Version {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build: 0,
        }
    }

    pub const fn with_build(major: u32, minor: u32, patch: u32, build: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            build,
        }
    }
}

impl FromStr for Version {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        if trimmed.is_empty() || parts.len() > 4 {
            return Err(PluginError::InvalidVersion(s.to_string()));
        }

        let mut components = [0u32; 4];
        for (slot, part) in components.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .map_err(|_| PluginError::InvalidVersion(s.to_string()))?;
        }

        let [major, minor, patch, build] = components;
        Ok(Self::with_build(major, minor, patch, build))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if self.build != 0 {
            write!(f, ".{}", self.build)?;
        }
        Ok(())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Range of acceptable versions for a dependency.
///
/// Textual forms:
/// - `""` or `"*"`: any version
/// - `"1.0"`: exactly 1.0.0.0
/// - `"1.0+"`: 1.0 or later
/// - `"[1.0,2.0)"`, `"(1.0,2.0]"`, `"[1.0,)"`, `"(,2.0]"`: interval notation
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VersionRange {
    pub min: Option<Version>,
    pub max: Option<Version>,
    pub min_inclusive: bool,
    pub max_inclusive: bool,
}

impl VersionRange {
    /// Range accepting every version
    pub fn any() -> Self {
        Self::default()
    }

    pub fn exact(version: Version) -> Self {
        Self {
            min: Some(version),
            max: Some(version),
            min_inclusive: true,
            max_inclusive: true,
        }
    }

    pub fn at_least(version: Version) -> Self {
        Self {
            min: Some(version),
            max: None,
            min_inclusive: true,
            max_inclusive: false,
        }
    }

    pub fn parse(text: &str) -> PluginResult<Self> {
        let trimmed = text.trim();
        let invalid = |reason: &str| PluginError::InvalidVersionRange {
            range: text.to_string(),
            reason: reason.to_string(),
        };

        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::any());
        }

        if let Some(min) = trimmed.strip_suffix('+') {
            return Ok(Self::at_least(min.parse()?));
        }

        let opens = trimmed.starts_with('[') || trimmed.starts_with('(');
        if !opens {
            return Ok(Self::exact(trimmed.parse()?));
        }

        let min_inclusive = trimmed.starts_with('[');
        let max_inclusive = match trimmed.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(invalid("missing closing bracket")),
        };

        let inner = &trimmed[1..trimmed.len() - 1];
        let Some((low, high)) = inner.split_once(',') else {
            return Err(invalid("interval needs a comma"));
        };
        if high.contains(',') {
            return Err(invalid("interval has more than two bounds"));
        }

        let bound = |s: &str| -> PluginResult<Option<Version>> {
            let s = s.trim();
            if s.is_empty() { Ok(None) } else { s.parse().map(Some) }
        };

        let range = Self {
            min: bound(low)?,
            max: bound(high)?,
            min_inclusive,
            max_inclusive,
        };

        if let (Some(min), Some(max)) = (range.min, range.max) {
            if min > max {
                return Err(invalid("minimum is greater than maximum"));
            }
            if min == max && !(min_inclusive && max_inclusive) {
                return Err(invalid("equal bounds must both be inclusive"));
            }
        }

        Ok(range)
    }

    pub fn is_any(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn is_in_range(&self, version: &Version) -> bool {
        let above_min = match &self.min {
            Some(min) if self.min_inclusive => version >= min,
            Some(min) => version > min,
            None => true,
        };
        let below_max = match &self.max {
            Some(max) if self.max_inclusive => version <= max,
            Some(max) => version < max,
            None => true,
        };
        above_min && below_max
    }
}

impl FromStr for VersionRange {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.min, &self.max) {
            (None, None) => write!(f, "*"),
            (Some(min), Some(max)) if min == max => write!(f, "{min}"),
            (Some(min), None) if self.min_inclusive => write!(f, "{min}+"),
            (min, max) => {
                let open = if self.min_inclusive { '[' } else { '(' };
                let close = if self.max_inclusive { ']' } else { ')' };
                let min = min.map(|v| v.to_string()).unwrap_or_default();
                let max = max.map(|v| v.to_string()).unwrap_or_default();
                write!(f, "{open}{min},{max}{close}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_version_parse_and_order() {
        assert_eq!(v("1.0"), Version::new(1, 0, 0));
        assert_eq!(v("1.2.3.4"), Version::with_build(1, 2, 3, 4));
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.0.0.1") > v("1.0"));
        assert!("1.x".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
        assert!("1.2.3.4.5".parse::<Version>().is_err());
    }

    #[test]
    fn test_version_display() {
        assert_eq!(v("1.0").to_string(), "1.0.0");
        assert_eq!(v("2.1.0.7").to_string(), "2.1.0.7");
    }

    #[test]
    fn test_half_open_interval() {
        let range = VersionRange::parse("[1.0,2.0)").unwrap();
        assert!(range.is_in_range(&v("1.0")));
        assert!(range.is_in_range(&v("1.5")));
        assert!(!range.is_in_range(&v("2.0")));
        assert!(!range.is_in_range(&v("0.9")));
    }

    #[test]
    fn test_open_minimum() {
        let range = VersionRange::parse("1.0+").unwrap();
        assert!(range.is_in_range(&v("1.0")));
        assert!(range.is_in_range(&v("99.0")));
        assert!(!range.is_in_range(&v("0.9.9")));
    }

    #[test]
    fn test_exact_and_any() {
        let exact = VersionRange::parse("1.0").unwrap();
        assert!(exact.is_in_range(&v("1.0.0.0")));
        assert!(!exact.is_in_range(&v("1.0.0.1")));

        for text in ["", "*", "  "] {
            let any = VersionRange::parse(text).unwrap();
            assert!(any.is_any());
            assert!(any.is_in_range(&v("0.0.1")));
        }
    }

    #[test]
    fn test_one_sided_brackets() {
        let upper = VersionRange::parse("(,2.0]").unwrap();
        assert!(upper.is_in_range(&v("0.1")));
        assert!(upper.is_in_range(&v("2.0")));
        assert!(!upper.is_in_range(&v("2.0.1")));

        let lower = VersionRange::parse("(1.0,)").unwrap();
        assert!(!lower.is_in_range(&v("1.0")));
        assert!(lower.is_in_range(&v("1.0.0.1")));
    }

    #[test]
    fn test_invalid_ranges() {
        for text in ["[2.0,1.0]", "(1.0,1.0]", "[1.0,2.0", "[1.0]", "[1,2,3]", "abc+"] {
            assert!(VersionRange::parse(text).is_err(), "{text} should fail");
        }
        assert!(VersionRange::parse("[1.0,1.0]").is_ok());
    }

    #[test]
    fn test_display_round_trips_text_forms() {
        for text in ["*", "1.0.0", "1.0.0+", "[1.0.0,2.0.0)", "(,2.0.0]"] {
            assert_eq!(VersionRange::parse(text).unwrap().to_string(), text);
        }
    }
}
