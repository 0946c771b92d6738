//! Identity and temporal addressing primitives

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A scheme-qualified identifier, optionally versioned
///
/// Rendered as `scheme~value` or `scheme~value~version`. Identifiers are
/// process-lifetime scoped; nothing in this system persists them.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UniqueId {
    /// The naming scheme, e.g. `ViewProcess` or `ViewCycle`
    pub scheme: String,
    /// The value within the scheme
    pub value: String,
    /// Optional version discriminator
    pub version: Option<String>,
}

impl UniqueId {
    /// Create an unversioned id
    pub fn new(scheme: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
            version: None,
        }
    }

    /// Create a versioned id
    pub fn versioned(
        scheme: impl Into<String>,
        value: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            value: value.into(),
            version: Some(version.into()),
        }
    }

    /// The same id with the version discriminator stripped
    #[must_use]
    pub fn without_version(&self) -> Self {
        Self {
            scheme: self.scheme.clone(),
            value: self.value.clone(),
            version: None,
        }
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}~{}~{}", self.scheme, self.value, version),
            None => write!(f, "{}~{}", self.scheme, self.value),
        }
    }
}

/// Error parsing a [`UniqueId`] from its string form
#[derive(Debug, thiserror::Error)]
#[error("invalid unique id '{0}': expected scheme~value[~version]")]
pub struct ParseUniqueIdError(String);

impl FromStr for UniqueId {
    type Err = ParseUniqueIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '~');
        let scheme = parts.next().filter(|p| !p.is_empty());
        let value = parts.next().filter(|p| !p.is_empty());
        match (scheme, value) {
            (Some(scheme), Some(value)) => Ok(Self {
                scheme: scheme.to_string(),
                value: value.to_string(),
                version: parts.next().map(str::to_string),
            }),
            _ => Err(ParseUniqueIdError(s.to_string())),
        }
    }
}

/// A point on the version/correction timeline
///
/// `version_as_of` selects which version of underlying data to read;
/// `corrected_to` selects which corrections to apply. `None` in either slot
/// means "latest".
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionCorrection {
    /// Read data as of this instant, or latest when `None`
    pub version_as_of: Option<DateTime<Utc>>,
    /// Apply corrections up to this instant, or latest when `None`
    pub corrected_to: Option<DateTime<Utc>>,
}

impl VersionCorrection {
    /// Latest version, latest correction
    pub const LATEST: Self = Self {
        version_as_of: None,
        corrected_to: None,
    };

    /// A fixed version/correction point
    pub fn of(version_as_of: DateTime<Utc>, corrected_to: DateTime<Utc>) -> Self {
        Self {
            version_as_of: Some(version_as_of),
            corrected_to: Some(corrected_to),
        }
    }

    /// Whether both slots are "latest"
    pub fn is_latest(&self) -> bool {
        self.version_as_of.is_none() && self.corrected_to.is_none()
    }
}

impl fmt::Display for VersionCorrection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_slot = |slot: &Option<DateTime<Utc>>| match slot {
            Some(instant) => instant.to_rfc3339(),
            None => "LATEST".to_string(),
        };
        write!(
            f,
            "V{}.C{}",
            fmt_slot(&self.version_as_of),
            fmt_slot(&self.corrected_to)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_id_round_trips_through_display() {
        let id = UniqueId::new("ViewProcess", "42");
        assert_eq!(id.to_string(), "ViewProcess~42");
        assert_eq!("ViewProcess~42".parse::<UniqueId>().unwrap(), id);

        let versioned = UniqueId::versioned("ViewDef", "eq-options", "3");
        assert_eq!(versioned.to_string(), "ViewDef~eq-options~3");
        assert_eq!("ViewDef~eq-options~3".parse::<UniqueId>().unwrap(), versioned);
    }

    #[test]
    fn unique_id_parse_rejects_malformed_input() {
        assert!("".parse::<UniqueId>().is_err());
        assert!("no-tilde".parse::<UniqueId>().is_err());
        assert!("~value".parse::<UniqueId>().is_err());
        assert!("scheme~".parse::<UniqueId>().is_err());
    }

    #[test]
    fn version_correction_latest() {
        assert!(VersionCorrection::LATEST.is_latest());
        let fixed = VersionCorrection::of(Utc::now(), Utc::now());
        assert!(!fixed.is_latest());
    }
}
