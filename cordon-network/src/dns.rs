//! Resolver rule construction and dnsmasq rendering
//!
//! [`DnsRuleSet::build`] turns an [`EffectivePolicy`] into an ordered list of
//! `(pattern, action, upstreams)` rules. The rule set is resolver-agnostic;
//! [`DnsRuleSet::render_dnsmasq`] writes it out for the sidecar.
//!
//! Matching follows dnsmasq: the longest pattern that equals the queried name
//! or is a parent of it decides, and the catch-all applies only when nothing
//! else matches. An explicit block always wins: allow entries equal to or
//! below a blocked suffix are dropped here, and blocks below an allowed suffix
//! are more specific than it.

use cordon_core::{BlockResponse, domain_matches};
use cordon_policy::{DefaultAction, EffectivePolicy};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::net::IpAddr;

/// What a rule does with a matching name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsAction {
    /// Forward to the rule's upstream resolvers
    Forward,
    /// Answer locally with NXDOMAIN
    NxDomain,
    /// Answer locally with the unspecified address
    NullRoute,
}

impl DnsAction {
    /// Whether the name resolves to a real answer
    #[must_use]
    pub const fn is_forward(self) -> bool {
        matches!(self, Self::Forward)
    }
}

/// One resolver rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRule {
    /// Domain suffix, or `None` for the catch-all
    pub pattern: Option<String>,
    /// Action for matching names
    pub action: DnsAction,
    /// Upstreams for [`DnsAction::Forward`]
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upstreams: Vec<IpAddr>,
}

impl DnsRule {
    fn forward(pattern: Option<String>, upstreams: &[IpAddr]) -> Self {
        Self {
            pattern,
            action: DnsAction::Forward,
            upstreams: upstreams.to_vec(),
        }
    }

    fn block(pattern: Option<String>, action: DnsAction) -> Self {
        Self {
            pattern,
            action,
            upstreams: Vec::new(),
        }
    }
}

/// Outcome of evaluating a name against a rule set
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resolution {
    /// Action taken
    pub action: DnsAction,
    /// Pattern that decided, `None` when the catch-all did
    pub matched: Option<String>,
}

impl Resolution {
    /// Whether the name would resolve through an upstream
    #[must_use]
    pub const fn resolves(&self) -> bool {
        self.action.is_forward()
    }
}

/// Ordered rules plus resolver-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRuleSet {
    /// Rules, catch-all first, then forwards, then blocks
    pub rules: Vec<DnsRule>,
    /// Answers inside these ranges are rewritten to NXDOMAIN
    pub blocked_ips: Vec<IpNet>,
    /// Log every query
    pub log_queries: bool,
}

impl DnsRuleSet {
    /// Build the rule set for a policy
    #[must_use]
    pub fn build(
        policy: &EffectivePolicy,
        upstreams: &[IpAddr],
        block_response: BlockResponse,
    ) -> Self {
        let block_action = match block_response {
            BlockResponse::NxDomain => DnsAction::NxDomain,
            BlockResponse::NullRoute => DnsAction::NullRoute,
        };

        let is_blocked =
            |suffix: &str| policy.blocked_domains.iter().any(|b| domain_matches(suffix, b));

        let mut rules = Vec::with_capacity(
            1 + policy.allowed_domains.len() + policy.blocked_domains.len(),
        );

        rules.push(match policy.default_action {
            DefaultAction::Drop => DnsRule::block(None, DnsAction::NxDomain),
            DefaultAction::Accept => DnsRule::forward(None, upstreams),
        });

        rules.extend(
            policy
                .allowed_domains
                .iter()
                .filter(|suffix| !is_blocked(suffix.as_str()))
                .map(|suffix| DnsRule::forward(Some(suffix.clone()), upstreams)),
        );

        rules.extend(
            policy
                .blocked_domains
                .iter()
                .map(|suffix| DnsRule::block(Some(suffix.clone()), block_action)),
        );

        Self {
            rules,
            blocked_ips: policy.blocked_ips.iter().copied().collect(),
            log_queries: policy.log_blocked || policy.log_all,
        }
    }

    /// What the resolver would do for `name`
    #[must_use]
    pub fn evaluate(&self, name: &str) -> Resolution {
        let name = name.trim().trim_end_matches('.');

        let specific = self
            .rules
            .iter()
            .filter_map(|rule| rule.pattern.as_deref().map(|p| (p, rule)))
            .filter(|(pattern, _)| domain_matches(name, pattern))
            // On identical patterns the block wins.
            .max_by_key(|(pattern, rule)| (pattern.len(), !rule.action.is_forward()));

        if let Some((pattern, rule)) = specific {
            return Resolution {
                action: rule.action,
                matched: Some(pattern.to_string()),
            };
        }

        let action = self
            .rules
            .iter()
            .find(|rule| rule.pattern.is_none())
            .map_or(DnsAction::NxDomain, |rule| rule.action);

        Resolution {
            action,
            matched: None,
        }
    }

    /// Number of rules, including the catch-all
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether there are no rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Suffixes that forward
    pub fn forwarded(&self) -> impl Iterator<Item = &str> {
        self.patterns(DnsAction::is_forward)
    }

    /// Suffixes answered locally
    pub fn blocked(&self) -> impl Iterator<Item = &str> {
        self.patterns(|action| !action.is_forward())
    }

    fn patterns(&self, keep: impl Fn(DnsAction) -> bool) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .filter(move |rule| keep(rule.action))
            .filter_map(|rule| rule.pattern.as_deref())
    }

    /// Render a dnsmasq configuration file
    #[must_use]
    pub fn render_dnsmasq(&self, header: &str) -> String {
        let mut out = String::new();
        for line in header.lines() {
            let _ = writeln!(out, "# {line}");
        }

        out.push_str("no-resolv\nno-hosts\ndomain-needed\ncache-size=1000\n");
        if self.log_queries {
            out.push_str("log-queries\nlog-facility=-\n");
        }

        for rule in &self.rules {
            let domain = rule.pattern.as_deref().unwrap_or("#");
            match rule.action {
                DnsAction::Forward => {
                    for upstream in &rule.upstreams {
                        if rule.pattern.is_some() {
                            let _ = writeln!(out, "server=/{domain}/{upstream}");
                        } else {
                            let _ = writeln!(out, "server={upstream}");
                        }
                    }
                }
                DnsAction::NxDomain => {
                    let _ = writeln!(out, "address=/{domain}/");
                }
                DnsAction::NullRoute => {
                    let _ = writeln!(out, "address=/{domain}/0.0.0.0");
                    let _ = writeln!(out, "address=/{domain}/::");
                }
            }
        }

        for net in &self.blocked_ips {
            let _ = writeln!(out, "bogus-nxdomain={net}");
        }

        out
    }
}

/// Whether a dnsmasq query-log line records a locally refused answer
#[must_use]
pub fn is_blocked_log_line(line: &str) -> bool {
    let line = line.trim_end();
    line.contains(" config ")
        && (line.ends_with(" is NXDOMAIN") || line.ends_with(" is 0.0.0.0") || line.ends_with(" is ::"))
}

/// Keep only the lines of a query log that record refused answers
#[must_use]
pub fn filter_blocked(logs: &str) -> String {
    logs.lines()
        .filter(|line| is_blocked_log_line(line))
        .fold(String::new(), |mut out, line| {
            out.push_str(line);
            out.push('\n');
            out
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cordon_policy::{CustomRuleSet, load, merge};

    fn upstreams() -> Vec<IpAddr> {
        vec!["1.1.1.1".parse().unwrap()]
    }

    fn rules_for(profile: &str) -> DnsRuleSet {
        let policy = merge(&load(profile).unwrap(), &CustomRuleSet::new());
        DnsRuleSet::build(&policy, &upstreams(), BlockResponse::NxDomain)
    }

    #[test]
    fn test_allowlist_mode() {
        let rules = rules_for("strict");
        assert!(rules.evaluate("github.com").resolves());
        assert!(rules.evaluate("api.github.com").resolves());
        assert!(rules.evaluate("objects.githubusercontent.com").resolves());

        let denied = rules.evaluate("random.example.com");
        assert_eq!(denied.action, DnsAction::NxDomain);
        assert_eq!(denied.matched, None);
    }

    #[test]
    fn test_block_below_allow_wins() {
        let rules = rules_for("strict");
        let gist = rules.evaluate("gist.github.com");
        assert_eq!(gist.action, DnsAction::NxDomain);
        assert_eq!(gist.matched.as_deref(), Some("gist.github.com"));
    }

    #[test]
    fn test_block_above_allow_wins() {
        let mut policy = merge(&load("strict").unwrap(), &CustomRuleSet::new());
        policy.blocked_domains.insert("github.com".to_string());
        policy.allowed_domains.insert("api.github.com".to_string());

        let rules = DnsRuleSet::build(&policy, &upstreams(), BlockResponse::NxDomain);
        assert!(!rules.evaluate("github.com").resolves());
        assert!(!rules.evaluate("api.github.com").resolves());
        assert!(!rules.forwarded().any(|p| p == "github.com" || p == "api.github.com"));
    }

    #[test]
    fn test_blocklist_mode() {
        let rules = rules_for("standard");
        assert!(!rules.evaluate("pastebin.com").resolves());
        assert!(!rules.evaluate("abc.ngrok.io").resolves());
        assert!(rules.evaluate("registry.npmjs.org").resolves());
        assert!(rules.evaluate("notpastebin.com").resolves());
    }

    #[test]
    fn test_permissive_resolves_everything() {
        let rules = rules_for("permissive");
        assert_eq!(rules.len(), 1);
        assert!(rules.evaluate("anything.example").resolves());
        assert!(!rules.log_queries);
    }

    #[test]
    fn test_null_route() {
        let policy = merge(&load("standard").unwrap(), &CustomRuleSet::new());
        let rules = DnsRuleSet::build(&policy, &upstreams(), BlockResponse::NullRoute);
        assert_eq!(rules.evaluate("pastebin.com").action, DnsAction::NullRoute);

        let conf = rules.render_dnsmasq("test");
        assert!(conf.contains("address=/pastebin.com/0.0.0.0\n"));
        assert!(conf.contains("address=/pastebin.com/::\n"));
    }

    #[test]
    fn test_render_allowlist() {
        let conf = rules_for("strict").render_dnsmasq("cordon sidecar for web\nprofile strict");

        assert!(conf.starts_with("# cordon sidecar for web\n# profile strict\n"));
        assert!(conf.contains("no-resolv\n"));
        assert!(conf.contains("log-queries\nlog-facility=-\n"));
        assert!(conf.contains("address=/#/\n"));
        assert!(conf.contains("server=/github.com/1.1.1.1\n"));
        assert!(conf.contains("address=/gist.github.com/\n"));
        assert!(conf.contains("bogus-nxdomain=169.254.169.254/32\n"));
        assert!(!conf.lines().any(|l| l == "server=1.1.1.1"));
    }

    #[test]
    fn test_render_blocklist() {
        let conf = rules_for("standard").render_dnsmasq("");
        assert!(conf.contains("server=1.1.1.1\n"));
        assert!(conf.contains("address=/pastebin.com/\n"));
        assert!(!conf.contains("address=/#/"));
    }

    #[test]
    fn test_rule_order_is_deterministic() {
        assert_eq!(rules_for("standard"), rules_for("standard"));
        let rules = rules_for("strict");
        assert!(rules.rules[0].pattern.is_none());
        let first_block = rules.rules.iter().position(|r| !r.action.is_forward() && r.pattern.is_some());
        let last_forward = rules.rules.iter().rposition(|r| r.action.is_forward());
        assert!(last_forward < first_block);
    }

    #[test]
    fn test_blocked_log_filter() {
        let logs = "\
dnsmasq[1]: query[A] pastebin.com from 10.213.4.3
dnsmasq[1]: config pastebin.com is NXDOMAIN
dnsmasq[1]: query[A] github.com from 10.213.4.3
dnsmasq[1]: forwarded github.com to 1.1.1.1
dnsmasq[1]: reply github.com is 140.82.112.3
dnsmasq[1]: config transfer.sh is 0.0.0.0
dnsmasq[1]: reply nosuch.example is NXDOMAIN
";
        assert_eq!(
            filter_blocked(logs),
            "dnsmasq[1]: config pastebin.com is NXDOMAIN\ndnsmasq[1]: config transfer.sh is 0.0.0.0\n"
        );
    }
}
