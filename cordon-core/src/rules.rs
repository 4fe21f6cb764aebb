//! Rule value objects with validation at construction
//!
//! Every domain, CIDR and port that enters the engine (from a profile document,
//! a create-time flag or `network allow`/`block`) passes through these types, so
//! downstream code never sees an unnormalized value.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::{Error, Result};

/// Kind of a custom rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleKind {
    /// Extend the allowed domains
    AllowDomain,
    /// Extend the blocked domains
    BlockDomain,
    /// Extend the allowed CIDRs
    AllowIp,
    /// Extend the blocked CIDRs
    BlockIp,
    /// Extend the allowed ports
    AllowPort,
}

impl RuleKind {
    /// All kinds, in listing order
    pub const ALL: [Self; 5] = [
        Self::AllowDomain,
        Self::BlockDomain,
        Self::AllowIp,
        Self::BlockIp,
        Self::AllowPort,
    ];

    /// Flag-style name (`allow-domain`)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AllowDomain => "allow-domain",
            Self::BlockDomain => "block-domain",
            Self::AllowIp => "allow-ip",
            Self::BlockIp => "block-ip",
            Self::AllowPort => "allow-port",
        }
    }

    /// Record file holding this kind inside a container's rule directory
    #[must_use]
    pub const fn file_name(self) -> &'static str {
        match self {
            Self::AllowDomain => "allow-domains.txt",
            Self::BlockDomain => "block-domains.txt",
            Self::AllowIp => "allow-ips.txt",
            Self::BlockIp => "block-ips.txt",
            Self::AllowPort => "allow-ports.txt",
        }
    }

    /// Upper-case tag used when listing rules (`ALLOW_DOMAIN`)
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::AllowDomain => "ALLOW_DOMAIN",
            Self::BlockDomain => "BLOCK_DOMAIN",
            Self::AllowIp => "ALLOW_IP",
            Self::BlockIp => "BLOCK_IP",
            Self::AllowPort => "ALLOW_PORT",
        }
    }
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RuleKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| Error::InvalidConfig {
                message: format!("Unknown rule kind '{s}'"),
            })
    }
}

/// Domain pattern: either an exact name or a `*.`-prefixed wildcard
///
/// Matching is suffix-based: `*.example.com` and `example.com` both cover
/// `example.com` and every name below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DomainPattern(String);

impl DomainPattern {
    /// Maximum length of a DNS name
    pub const MAX_LENGTH: usize = 253;

    /// Parse and normalize a pattern (lower-case, no trailing dot)
    ///
    /// # Errors
    /// Returns error if the pattern is not a valid DNS name or wildcard
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid = |message: &str| Error::InvalidRule {
            kind: "domain".to_string(),
            value: raw.to_string(),
            message: message.to_string(),
        };

        let pattern = raw.trim().trim_end_matches('.').to_ascii_lowercase();
        let name = pattern.strip_prefix("*.").unwrap_or(&pattern);

        if name.is_empty() {
            return Err(invalid("empty domain"));
        }
        if name.len() > Self::MAX_LENGTH {
            return Err(invalid("domain too long"));
        }

        for label in name.split('.') {
            if label.is_empty() || label.len() > 63 {
                return Err(invalid("every label must be 1-63 characters"));
            }
            if label.starts_with('-') || label.ends_with('-') {
                return Err(invalid("labels cannot start or end with '-'"));
            }
            if !label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(invalid("only letters, digits, '-' and '_' are allowed"));
            }
        }

        Ok(Self(pattern))
    }

    /// Pattern as written (normalized)
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the pattern was written with a `*.` prefix
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0.starts_with("*.")
    }

    /// Bare suffix form (`*.example.com` -> `example.com`)
    #[must_use]
    pub fn suffix(&self) -> &str {
        self.0.strip_prefix("*.").unwrap_or(&self.0)
    }
}

impl fmt::Display for DomainPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DomainPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DomainPattern {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<DomainPattern> for String {
    fn from(pattern: DomainPattern) -> Self {
        pattern.0
    }
}

/// Whether `name` equals `suffix` or lies below it
#[must_use]
pub fn domain_matches(name: &str, suffix: &str) -> bool {
    let name = name.trim_end_matches('.').as_bytes();
    let suffix = suffix.as_bytes();
    name.eq_ignore_ascii_case(suffix)
        || (name.len() > suffix.len()
            && name[name.len() - suffix.len() - 1] == b'.'
            && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix))
}

/// Parse a CIDR, accepting a bare address as a host route
///
/// # Errors
/// Returns error if the value is neither a CIDR nor an IP address
pub fn parse_cidr(raw: &str) -> Result<IpNet> {
    let raw = raw.trim();
    if let Ok(net) = raw.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    raw.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| Error::InvalidRule {
            kind: "ip".to_string(),
            value: raw.to_string(),
            message: "expected CIDR notation (e.g. 10.0.0.0/8) or an IP address".to_string(),
        })
}

/// Parse a TCP/UDP port number
///
/// # Errors
/// Returns error if the value is not an integer in `1..=65535`
pub fn parse_port(raw: &str) -> Result<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(Error::InvalidRule {
            kind: "port".to_string(),
            value: raw.to_string(),
            message: "expected a port number between 1 and 65535".to_string(),
        }),
    }
}

/// A single user-added rule, normalized for its kind
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CustomRule {
    /// Rule kind
    pub kind: RuleKind,
    /// Normalized value as persisted
    pub value: String,
}

impl CustomRule {
    /// Validate and normalize a raw value for `kind`
    ///
    /// # Errors
    /// Returns error if the value is invalid for the kind
    pub fn new(kind: RuleKind, raw: &str) -> Result<Self> {
        let value = match kind {
            RuleKind::AllowDomain | RuleKind::BlockDomain => {
                DomainPattern::parse(raw).map(String::from)
            }
            RuleKind::AllowIp | RuleKind::BlockIp => parse_cidr(raw).map(|net| net.to_string()),
            RuleKind::AllowPort => parse_port(raw).map(|port| port.to_string()),
        }
        .map_err(|e| match e {
            Error::InvalidRule { value, message, .. } => Error::InvalidRule {
                kind: kind.to_string(),
                value,
                message,
            },
            other => other,
        })?;

        Ok(Self { kind, value })
    }
}

impl fmt::Display for CustomRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind.tag(), self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_pattern_normalization() {
        let pattern = DomainPattern::parse(" *.Example.COM. ").unwrap();
        assert_eq!(pattern.as_str(), "*.example.com");
        assert!(pattern.is_wildcard());
        assert_eq!(pattern.suffix(), "example.com");

        let exact = DomainPattern::parse("github.com").unwrap();
        assert!(!exact.is_wildcard());
        assert_eq!(exact.suffix(), "github.com");
    }

    #[test]
    fn test_domain_pattern_rejects_garbage() {
        assert!(DomainPattern::parse("").is_err());
        assert!(DomainPattern::parse("*.").is_err());
        assert!(DomainPattern::parse("bad domain.com").is_err());
        assert!(DomainPattern::parse("a..b").is_err());
        assert!(DomainPattern::parse("-lead.com").is_err());
        assert!(DomainPattern::parse("http://example.com").is_err());
        assert!(DomainPattern::parse(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_domain_matches_is_suffix_based() {
        assert!(domain_matches("github.com", "github.com"));
        assert!(domain_matches("api.github.com", "github.com"));
        assert!(domain_matches("API.GitHub.com.", "github.com"));
        assert!(!domain_matches("notgithub.com", "github.com"));
        assert!(!domain_matches("github.com.evil.org", "github.com"));
        assert!(!domain_matches("com", "github.com"));
    }

    #[test]
    fn test_parse_cidr() {
        assert_eq!(parse_cidr("10.1.2.3/8").unwrap().to_string(), "10.0.0.0/8");
        assert_eq!(parse_cidr("192.168.1.7").unwrap().to_string(), "192.168.1.7/32");
        assert_eq!(parse_cidr("fd00::1").unwrap().to_string(), "fd00::1/128");
        assert!(parse_cidr("10.0.0.0/33").is_err());
        assert!(parse_cidr("example.com").is_err());
    }

    #[test]
    fn test_parse_port() {
        assert_eq!(parse_port("443").unwrap(), 443);
        assert!(parse_port("0").is_err());
        assert!(parse_port("65536").is_err());
        assert!(parse_port("https").is_err());
    }

    #[test]
    fn test_custom_rule_display_and_kind_in_errors() {
        let rule = CustomRule::new(RuleKind::AllowDomain, "Foo.com").unwrap();
        assert_eq!(rule.to_string(), "ALLOW_DOMAIN foo.com");

        let err = CustomRule::new(RuleKind::AllowPort, "99999").unwrap_err();
        assert!(err.to_string().contains("allow-port"));
    }

    #[test]
    fn test_rule_kind_round_trip_names() {
        for kind in RuleKind::ALL {
            assert_eq!(kind.as_str().parse::<RuleKind>().unwrap(), kind);
        }
        assert!("allow-everything".parse::<RuleKind>().is_err());
    }
}
