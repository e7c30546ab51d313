//! Client version information and the version negotiation headers exchanged with the service

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{OsmoError, Result};

/// Header carrying the client version on every authenticated request.
pub const VERSION_HEADER: &str = "x-osmo-client-version";
/// Header carrying the service version on responses.
pub const SERVICE_VERSION_HEADER: &str = "x-osmo-service-version";
/// Header carrying a base64-encoded human-readable warning when the client is out of date.
pub const VERSION_WARNING_HEADER: &str = "x-osmo-version-warning";

/// A client or service version of the form `major.minor.revision[.hash]`. Ordering ignores the
/// hash, which only exists on release builds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Version {
    pub major: u32,
    #[serde(default)]
    pub minor: u32,
    #[serde(default)]
    pub revision: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl Version {
    pub fn parse(version_str: &str) -> Result<Self> {
        let mut parts = version_str.split('.');
        let major = parse_component(parts.next(), version_str)?;
        let minor = parse_component(parts.next(), version_str)?;
        let revision = parse_component(parts.next(), version_str)?;
        let hash = parts.next().map(|h| h.to_owned());
        if parts.next().is_some() || hash.as_deref().is_some_and(|h| h.is_empty()) {
            return Err(invalid_version(version_str));
        }
        Ok(Version {
            major,
            minor,
            revision,
            hash,
        })
    }

    /// The version compiled into this binary, from the crate metadata.
    pub fn current() -> Self {
        // CARGO_PKG_VERSION is always three dotted integers, so the parse cannot fail
        Version::parse(env!("CARGO_PKG_VERSION")).expect("crate version is well-formed")
    }
}

fn parse_component(part: Option<&str>, original: &str) -> Result<u32> {
    part.ok_or_else(|| invalid_version(original))?
        .parse::<u32>()
        .map_err(|_| invalid_version(original))
}

fn invalid_version(version_str: &str) -> OsmoError {
    OsmoError::user(format!(
        "Version should be of the format major.minor.revision, got {}",
        version_str
    ))
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)?;
        // Development builds carry no hash
        if let Some(hash) = &self.hash {
            write!(f, ".{}", hash)?;
        }
        Ok(())
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.major, self.minor, self.revision).cmp(&(other.major, other.minor, other.revision))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_round_trip() {
        let v = Version::parse("1.2.3").unwrap();
        assert_eq!(v.to_string(), "1.2.3");
        let v = Version::parse("1.2.3.abc123").unwrap();
        assert_eq!(v.hash.as_deref(), Some("abc123"));
        assert_eq!(v.to_string(), "1.2.3.abc123");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "1", "1.2", "a.b.c", "1.2.3.", "1.2.3.h.x", "-1.2.3"] {
            assert!(Version::parse(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn test_ordering_ignores_hash() {
        let a = Version::parse("1.2.3.aaa").unwrap();
        let b = Version::parse("1.2.3.bbb").unwrap();
        assert_eq!(a.cmp(&b), std::cmp::Ordering::Equal);
        assert!(Version::parse("1.10.0").unwrap() > Version::parse("1.9.9").unwrap());
        assert!(Version::parse("2.0.0").unwrap() > Version::parse("1.99.99").unwrap());
    }
}
