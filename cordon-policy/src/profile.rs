//! Egress profile documents and their loader.
//!
//! Profiles are embedded at compile time and parsed on every load, so a
//! profile value never carries state from a previous invocation. A document is
//! a sequence of `KEY=value` records; a double-quoted value may span several
//! lines, which is how the domain and CIDR lists are written:
//!
//! ```text
//! PROFILE_NAME="strict"
//! DEFAULT_ACTION="drop"
//! ALLOWED_DOMAINS="
//! github.com
//! *.githubusercontent.com
//! "
//! ```

use cordon_core::{DomainPattern, Error, Result, parse_cidr, parse_port};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Embedded `permissive` profile.
pub const PROFILE_PERMISSIVE: &str = include_str!("../profiles/permissive.profile");

/// Embedded `standard` profile.
pub const PROFILE_STANDARD: &str = include_str!("../profiles/standard.profile");

/// Embedded `strict` profile.
pub const PROFILE_STRICT: &str = include_str!("../profiles/strict.profile");

/// Embedded `airgapped` profile.
pub const PROFILE_AIRGAPPED: &str = include_str!("../profiles/airgapped.profile");

/// Profile used when `--egress` is not given.
pub const DEFAULT_PROFILE: &str = "standard";

/// How the container is attached to the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// Dedicated bridge network with a DNS sidecar.
    #[default]
    Bridge,
    /// No network at all.
    None,
}

impl NetworkMode {
    /// Value as written in profile documents and passed to the runtime.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bridge => "bridge",
            Self::None => "none",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bridge" => Ok(Self::Bridge),
            "none" => Ok(Self::None),
            other => Err(format!("unknown network mode '{other}' (expected bridge or none)")),
        }
    }
}

/// What happens to names no rule mentions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    /// Blocklist mode: resolve unless blocked.
    #[default]
    Accept,
    /// Allowlist mode: NXDOMAIN unless allowed.
    Drop,
}

impl DefaultAction {
    /// Value as written in profile documents.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Drop => "drop",
        }
    }
}

impl fmt::Display for DefaultAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DefaultAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "drop" => Ok(Self::Drop),
            other => Err(format!("unknown default action '{other}' (expected accept or drop)")),
        }
    }
}

/// A parsed, immutable egress profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EgressProfile {
    name: String,
    description: String,
    network_mode: NetworkMode,
    default_action: DefaultAction,
    log_blocked: bool,
    log_all: bool,
    allowed_ports: BTreeSet<u16>,
    allowed_domains: BTreeSet<DomainPattern>,
    blocked_domains: BTreeSet<DomainPattern>,
    allowed_ips: BTreeSet<IpNet>,
    blocked_ips: BTreeSet<IpNet>,
}

impl EgressProfile {
    /// Profile name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable description.
    #[must_use]
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Network attachment.
    #[must_use]
    pub const fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    /// Default action for unmatched names.
    #[must_use]
    pub const fn default_action(&self) -> DefaultAction {
        self.default_action
    }

    /// Whether blocked queries are logged.
    #[must_use]
    pub const fn log_blocked(&self) -> bool {
        self.log_blocked
    }

    /// Whether every query is logged.
    #[must_use]
    pub const fn log_all(&self) -> bool {
        self.log_all
    }

    /// Allowed destination ports.
    #[must_use]
    pub const fn allowed_ports(&self) -> &BTreeSet<u16> {
        &self.allowed_ports
    }

    /// Allowed domain patterns.
    #[must_use]
    pub const fn allowed_domains(&self) -> &BTreeSet<DomainPattern> {
        &self.allowed_domains
    }

    /// Blocked domain patterns.
    #[must_use]
    pub const fn blocked_domains(&self) -> &BTreeSet<DomainPattern> {
        &self.blocked_domains
    }

    /// Allowed CIDRs.
    #[must_use]
    pub const fn allowed_ips(&self) -> &BTreeSet<IpNet> {
        &self.allowed_ips
    }

    /// Blocked CIDRs.
    #[must_use]
    pub const fn blocked_ips(&self) -> &BTreeSet<IpNet> {
        &self.blocked_ips
    }

    /// Whether this profile provisions no network at all.
    #[must_use]
    pub fn is_airgapped(&self) -> bool {
        self.network_mode == NetworkMode::None
    }

    /// Parse a profile document.
    ///
    /// `expected_name` is the name the document was looked up under; a
    /// `PROFILE_NAME` record that disagrees with it is rejected.
    ///
    /// # Errors
    /// Returns [`Error::ProfileParse`] on malformed records or values.
    pub fn parse(expected_name: &str, text: &str) -> Result<Self> {
        let records = split_records(expected_name, text)?;

        let mut profile = Self {
            name: expected_name.to_string(),
            description: String::new(),
            network_mode: NetworkMode::default(),
            default_action: DefaultAction::default(),
            log_blocked: false,
            log_all: false,
            allowed_ports: BTreeSet::new(),
            allowed_domains: BTreeSet::new(),
            blocked_domains: BTreeSet::new(),
            allowed_ips: BTreeSet::new(),
            blocked_ips: BTreeSet::new(),
        };

        let mut seen = HashSet::new();
        for record in records {
            let fail = |message: String| Error::ProfileParse {
                profile: expected_name.to_string(),
                line: record.line,
                message,
            };

            if !seen.insert(record.key.clone()) {
                return Err(fail(format!("duplicate key {}", record.key)));
            }

            let value = record.value.trim();
            match record.key.as_str() {
                "PROFILE_NAME" => {
                    if !value.is_empty() && value != expected_name {
                        return Err(fail(format!(
                            "document declares profile '{value}', expected '{expected_name}'"
                        )));
                    }
                }
                "PROFILE_DESCRIPTION" => profile.description = value.to_string(),
                "NETWORK_MODE" => {
                    if !value.is_empty() {
                        profile.network_mode = value.parse().map_err(fail)?;
                    }
                }
                "DEFAULT_ACTION" => {
                    if !value.is_empty() {
                        profile.default_action = value.parse().map_err(fail)?;
                    }
                }
                "LOG_BLOCKED" => profile.log_blocked = parse_bool(value).map_err(fail)?,
                "LOG_ALL" => profile.log_all = parse_bool(value).map_err(fail)?,
                "ALLOWED_PORTS" => {
                    profile.allowed_ports =
                        parse_list(value, parse_port).map_err(|e| fail(e.to_string()))?;
                }
                "ALLOWED_DOMAINS" => {
                    profile.allowed_domains =
                        parse_list(value, DomainPattern::parse).map_err(|e| fail(e.to_string()))?;
                }
                "BLOCKED_DOMAINS" => {
                    profile.blocked_domains =
                        parse_list(value, DomainPattern::parse).map_err(|e| fail(e.to_string()))?;
                }
                "ALLOWED_IPS" => {
                    profile.allowed_ips =
                        parse_list(value, parse_cidr).map_err(|e| fail(e.to_string()))?;
                }
                "BLOCKED_IPS" => {
                    profile.blocked_ips =
                        parse_list(value, parse_cidr).map_err(|e| fail(e.to_string()))?;
                }
                other => {
                    warn!(profile = expected_name, key = other, "Ignoring unknown profile key");
                }
            }
        }

        debug!(
            profile = %profile.name,
            mode = %profile.network_mode,
            action = %profile.default_action,
            allowed = profile.allowed_domains.len(),
            blocked = profile.blocked_domains.len(),
            "Parsed egress profile"
        );

        Ok(profile)
    }
}

/// Names of the built-in profiles.
#[must_use]
pub const fn builtin_names() -> &'static [&'static str] {
    &["permissive", "standard", "strict", "airgapped"]
}

/// Embedded document for a built-in profile.
#[must_use]
pub fn embedded(name: &str) -> Option<&'static str> {
    match name {
        "permissive" => Some(PROFILE_PERMISSIVE),
        "standard" => Some(PROFILE_STANDARD),
        "strict" => Some(PROFILE_STRICT),
        "airgapped" => Some(PROFILE_AIRGAPPED),
        _ => None,
    }
}

/// Load a built-in profile by name.
///
/// # Errors
/// Returns [`Error::ProfileNotFound`] for names outside the built-in set.
pub fn load(name: &str) -> Result<EgressProfile> {
    let text = embedded(name).ok_or_else(|| Error::ProfileNotFound {
        name: name.to_string(),
        valid: builtin_names().join(", "),
    })?;
    EgressProfile::parse(name, text)
}

struct Record {
    key: String,
    value: String,
    line: usize,
}

fn split_records(profile: &str, text: &str) -> Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut lines = text.lines().enumerate();

    while let Some((idx, line)) = lines.next() {
        let line_no = idx + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let Some((key, rest)) = trimmed.split_once('=') else {
            return Err(Error::ProfileParse {
                profile: profile.to_string(),
                line: line_no,
                message: "expected KEY=value".to_string(),
            });
        };

        let key = key.trim();
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_uppercase() || c == '_') {
            return Err(Error::ProfileParse {
                profile: profile.to_string(),
                line: line_no,
                message: format!("invalid key '{key}'"),
            });
        }

        let rest = rest.trim();
        let value = match rest.strip_prefix('"') {
            Some(body) => match body.strip_suffix('"') {
                Some(inner) => inner.to_string(),
                None => {
                    let mut buf = body.to_string();
                    loop {
                        let Some((_, next)) = lines.next() else {
                            return Err(Error::ProfileParse {
                                profile: profile.to_string(),
                                line: line_no,
                                message: format!("unterminated quoted value for {key}"),
                            });
                        };
                        buf.push('\n');
                        if let Some(last) = next.trim_end().strip_suffix('"') {
                            buf.push_str(last);
                            break;
                        }
                        buf.push_str(next);
                    }
                    buf
                }
            },
            None => rest.trim_matches('\'').to_string(),
        };

        records.push(Record {
            key: key.to_string(),
            value,
            line: line_no,
        });
    }

    Ok(records)
}

fn parse_bool(value: &str) -> std::result::Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "" | "false" | "no" | "off" | "0" => Ok(false),
        "true" | "yes" | "on" | "1" => Ok(true),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

fn parse_list<T: Ord>(value: &str, parse: impl Fn(&str) -> Result<T>) -> Result<BTreeSet<T>> {
    value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .flat_map(str::split_whitespace)
        .map(parse)
        .collect()
}
