//! Combination of a profile with a container's custom rules

use cordon_core::{DomainPattern, RuleKind, parse_cidr, parse_port};
use ipnet::IpNet;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::warn;

use crate::profile::{DefaultAction, EgressProfile, NetworkMode};
use crate::store::CustomRuleSet;

/// Policy a sidecar is configured from
///
/// Domain entries are bare suffixes: `*.example.com` and `example.com` both
/// become `example.com` and cover the name itself plus everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectivePolicy {
    /// Profile the policy was derived from
    pub profile: String,
    /// Network attachment
    pub network_mode: NetworkMode,
    /// Answer for unmatched names
    pub default_action: DefaultAction,
    /// Log blocked queries
    pub log_blocked: bool,
    /// Log every query
    pub log_all: bool,
    /// Allowed destination ports
    pub allowed_ports: BTreeSet<u16>,
    /// Allowed domain suffixes
    pub allowed_domains: BTreeSet<String>,
    /// Blocked domain suffixes
    pub blocked_domains: BTreeSet<String>,
    /// Allowed CIDRs
    pub allowed_ips: BTreeSet<IpNet>,
    /// Blocked CIDRs
    pub blocked_ips: BTreeSet<IpNet>,
    /// Whether any custom rule contributed
    pub has_custom_rules: bool,
}

impl EffectivePolicy {
    /// `profile` or `profile+custom`
    #[must_use]
    pub fn label(&self) -> String {
        if self.has_custom_rules {
            format!("{}+custom", self.profile)
        } else {
            self.profile.clone()
        }
    }

    /// Whether unmatched names are refused
    #[must_use]
    pub fn is_allowlist(&self) -> bool {
        self.default_action == DefaultAction::Drop
    }

    /// Whether the container gets no network at all
    #[must_use]
    pub fn is_airgapped(&self) -> bool {
        self.network_mode == NetworkMode::None
    }
}

fn suffixes<'a>(patterns: impl IntoIterator<Item = &'a DomainPattern>) -> BTreeSet<String> {
    patterns
        .into_iter()
        .map(|pattern| pattern.suffix().to_string())
        .collect()
}

/// Union a profile with custom rules. Overrides only ever add entries.
#[must_use]
pub fn merge(base: &EgressProfile, overrides: &CustomRuleSet) -> EffectivePolicy {
    let mut policy = EffectivePolicy {
        profile: base.name().to_string(),
        network_mode: base.network_mode(),
        default_action: base.default_action(),
        log_blocked: base.log_blocked(),
        log_all: base.log_all(),
        allowed_ports: base.allowed_ports().clone(),
        allowed_domains: suffixes(base.allowed_domains()),
        blocked_domains: suffixes(base.blocked_domains()),
        allowed_ips: base.allowed_ips().clone(),
        blocked_ips: base.blocked_ips().clone(),
        has_custom_rules: !overrides.is_empty(),
    };

    for rule in overrides.entries() {
        let applied = match rule.kind {
            RuleKind::AllowDomain => DomainPattern::parse(&rule.value)
                .map(|p| policy.allowed_domains.insert(p.suffix().to_string())),
            RuleKind::BlockDomain => DomainPattern::parse(&rule.value)
                .map(|p| policy.blocked_domains.insert(p.suffix().to_string())),
            RuleKind::AllowIp => parse_cidr(&rule.value).map(|net| policy.allowed_ips.insert(net)),
            RuleKind::BlockIp => parse_cidr(&rule.value).map(|net| policy.blocked_ips.insert(net)),
            RuleKind::AllowPort => {
                parse_port(&rule.value).map(|port| policy.allowed_ports.insert(port))
            }
        };

        if let Err(e) = applied {
            warn!(rule = %rule, error = %e, "Ignoring unparseable custom rule");
        }
    }

    policy
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::load;
    use cordon_core::CustomRule;

    fn rules(entries: &[(RuleKind, &str)]) -> CustomRuleSet {
        entries
            .iter()
            .map(|(kind, value)| CustomRule::new(*kind, value).unwrap())
            .collect()
    }

    #[test]
    fn test_merge_without_overrides_is_deterministic() {
        let profile = load("strict").unwrap();
        let first = merge(&profile, &CustomRuleSet::new());
        let second = merge(&load("strict").unwrap(), &CustomRuleSet::new());
        assert_eq!(first, second);
        assert_eq!(first.label(), "strict");
        assert!(first.is_allowlist());
    }

    #[test]
    fn test_wildcards_become_suffixes() {
        let profile = load("strict").unwrap();
        let policy = merge(&profile, &CustomRuleSet::new());
        assert!(policy.allowed_domains.contains("githubusercontent.com"));
        assert!(!policy.allowed_domains.iter().any(|d| d.starts_with("*.")));
    }

    #[test]
    fn test_overrides_are_additive() {
        let profile = load("standard").unwrap();
        let base = merge(&profile, &CustomRuleSet::new());
        let policy = merge(
            &profile,
            &rules(&[
                (RuleKind::AllowDomain, "*.internal.example"),
                (RuleKind::BlockDomain, "evil.com"),
                (RuleKind::AllowPort, "8443"),
                (RuleKind::BlockIp, "203.0.113.0/24"),
            ]),
        );

        assert!(policy.allowed_domains.contains("internal.example"));
        assert!(policy.blocked_domains.contains("evil.com"));
        assert!(policy.blocked_domains.is_superset(&base.blocked_domains));
        assert!(policy.allowed_ports.contains(&8443));
        assert_eq!(policy.blocked_ips.len(), base.blocked_ips.len() + 1);
        assert_eq!(policy.label(), "standard+custom");
    }

    #[test]
    fn test_airgapped_policy() {
        let policy = merge(&load("airgapped").unwrap(), &CustomRuleSet::new());
        assert!(policy.is_airgapped());
        assert!(policy.allowed_domains.is_empty());
    }
}
