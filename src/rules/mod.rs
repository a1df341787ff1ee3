//! Routing-rule table: line-based DSL parsing, first-match evaluation, and
//! the passive IP-to-hostname tracker that gives DOMAIN-* rules something to
//! match on for IP-level flows.

use crate::error::CoreError;
use crate::flow::FlowKind;
use ipnet::IpNet;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant as StdInstant};

pub const MAX_RULE_LINES: usize = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteAction {
    Direct,
    Proxy,
    Reject,
}

impl RouteAction {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteAction::Direct => "DIRECT",
            RouteAction::Proxy => "PROXY",
            RouteAction::Reject => "REJECT",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "DIRECT" => Some(RouteAction::Direct),
            "PROXY" => Some(RouteAction::Proxy),
            "REJECT" => Some(RouteAction::Reject),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RuleMatcher {
    /// Case-insensitive exact hostname equality.
    Domain(String),
    /// Hostname ends with the value, label-aligned (or full equality).
    DomainSuffix(String),
    /// Hostname contains the value as a substring.
    DomainKeyword(String),
    IpCidr(IpNet),
    /// Matches only when a GeoIP resolver has been injected.
    GeoIp(String),
    DstPort(u16),
    /// Always matches; exactly one, last in the table.
    Final,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rule {
    pub matcher: RuleMatcher,
    pub action: RouteAction,
}

impl Rule {
    /// Serialize back to the rule-file line form. `parse_line` of the output
    /// yields a semantically equal rule.
    pub fn to_line(&self) -> String {
        let action = self.action.as_str();
        match &self.matcher {
            RuleMatcher::Domain(host) => format!("DOMAIN,{host},{action}"),
            RuleMatcher::DomainSuffix(host) => format!("DOMAIN-SUFFIX,{host},{action}"),
            RuleMatcher::DomainKeyword(word) => format!("DOMAIN-KEYWORD,{word},{action}"),
            RuleMatcher::IpCidr(net) => format!("IP-CIDR,{net},{action}"),
            RuleMatcher::GeoIp(cc) => format!("GEOIP,{cc},{action}"),
            RuleMatcher::DstPort(port) => format!("DST-PORT,{port},{action}"),
            RuleMatcher::Final => format!("FINAL,{action}"),
        }
    }
}

/// Per-line parse outcome. The grammar is permissive on TYPE (unknown types
/// are counted and skipped) but strict on ACTION.
enum LineOutcome {
    Rule(Rule),
    Skip,
    Unknown,
    Warn(&'static str),
}

fn parse_line(line: &str) -> LineOutcome {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return LineOutcome::Skip;
    }
    let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
    match parts.as_slice() {
        &["FINAL", action] => match RouteAction::parse(action) {
            Some(action) => LineOutcome::Rule(Rule {
                matcher: RuleMatcher::Final,
                action,
            }),
            None => LineOutcome::Warn("unrecognized action"),
        },
        &[rule_type, value, action] => {
            let Some(action) = RouteAction::parse(action) else {
                return LineOutcome::Warn("unrecognized action");
            };
            if value.is_empty() {
                return LineOutcome::Warn("empty rule value");
            }
            let matcher = match rule_type {
                "DOMAIN" => RuleMatcher::Domain(value.to_ascii_lowercase()),
                "DOMAIN-SUFFIX" => RuleMatcher::DomainSuffix(value.to_ascii_lowercase()),
                "DOMAIN-KEYWORD" => RuleMatcher::DomainKeyword(value.to_ascii_lowercase()),
                "IP-CIDR" => match value.parse::<IpNet>() {
                    Ok(net) => RuleMatcher::IpCidr(net),
                    Err(_) => return LineOutcome::Warn("malformed CIDR"),
                },
                "GEOIP" => RuleMatcher::GeoIp(value.to_ascii_uppercase()),
                "DST-PORT" => match value.parse::<u16>() {
                    Ok(port) => RuleMatcher::DstPort(port),
                    Err(_) => return LineOutcome::Warn("malformed port"),
                },
                _ => return LineOutcome::Unknown,
            };
            LineOutcome::Rule(Rule { matcher, action })
        }
        _ => LineOutcome::Warn("malformed rule line"),
    }
}

#[derive(Debug)]
pub struct LoadOutcome {
    pub accepted: usize,
    pub warnings: Vec<CoreError>,
    /// Lines with an unrecognized rule TYPE, skipped permissively.
    pub unknown_skipped: usize,
}

/// First-match decision together with the serialized rule that produced it.
#[derive(Clone, Debug)]
pub struct RoutingDecision {
    pub action: RouteAction,
    pub matched_rule: Option<String>,
}

pub trait GeoIpResolver: Send + Sync {
    fn country_code(&self, ip: IpAddr) -> Option<String>;
}

struct RuleTable {
    rules: Vec<Rule>,
}

impl RuleTable {
    fn terminated(mut rules: Vec<Rule>) -> Self {
        if !matches!(rules.last().map(|rule| &rule.matcher), Some(RuleMatcher::Final)) {
            rules.push(Rule {
                matcher: RuleMatcher::Final,
                action: RouteAction::Direct,
            });
        }
        Self { rules }
    }
}

pub struct RuleEngine {
    table: RwLock<Arc<RuleTable>>,
    geoip: RwLock<Option<Arc<dyn GeoIpResolver>>>,
}

impl Default for RuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleEngine {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(Arc::new(RuleTable::terminated(Vec::new()))),
            geoip: RwLock::new(None),
        }
    }

    /// Parse `text` and atomically replace the table. The FINAL rule is
    /// synthesized as `FINAL,DIRECT` when missing, lines past the limit and
    /// rules after FINAL are warned and ignored.
    pub fn load(&self, text: &str) -> LoadOutcome {
        let mut rules = Vec::new();
        let mut warnings = Vec::new();
        let mut unknown_skipped = 0;
        let mut terminated = false;
        for (index, line) in text.lines().enumerate() {
            let line_no = index + 1;
            if line_no > MAX_RULE_LINES {
                warnings.push(CoreError::RuleParse {
                    line: line_no,
                    detail: format!("line limit {MAX_RULE_LINES} exceeded, rest ignored"),
                });
                break;
            }
            match parse_line(line) {
                LineOutcome::Rule(rule) => {
                    if terminated {
                        warnings.push(CoreError::RuleParse {
                            line: line_no,
                            detail: "rule after FINAL ignored".to_string(),
                        });
                        continue;
                    }
                    if matches!(rule.matcher, RuleMatcher::Final) {
                        terminated = true;
                    }
                    rules.push(rule);
                }
                LineOutcome::Skip => {}
                LineOutcome::Unknown => unknown_skipped += 1,
                LineOutcome::Warn(detail) => warnings.push(CoreError::RuleParse {
                    line: line_no,
                    detail: detail.to_string(),
                }),
            }
        }
        let accepted = rules.len();
        *self.table.write() = Arc::new(RuleTable::terminated(rules));
        LoadOutcome {
            accepted,
            warnings,
            unknown_skipped,
        }
    }

    pub fn install_geoip(&self, resolver: Arc<dyn GeoIpResolver>) {
        *self.geoip.write() = Some(resolver);
    }

    pub fn rule_count(&self) -> usize {
        self.table.read().rules.len()
    }

    /// True when any DOMAIN/DOMAIN-SUFFIX/DOMAIN-KEYWORD rule is loaded, in
    /// which case TCP classification is worth deferring for a hostname.
    pub fn has_domain_rules(&self) -> bool {
        self.table.read().rules.iter().any(|rule| {
            matches!(
                rule.matcher,
                RuleMatcher::Domain(_)
                    | RuleMatcher::DomainSuffix(_)
                    | RuleMatcher::DomainKeyword(_)
            )
        })
    }

    pub fn evaluate(
        &self,
        host: Option<&str>,
        ip: Option<IpAddr>,
        port: u16,
        _proto: FlowKind,
    ) -> RoutingDecision {
        let table = self.table.read().clone();
        let geoip = self.geoip.read().clone();
        let host_lower = host.map(str::to_ascii_lowercase);
        let host = host_lower.as_deref();
        for rule in &table.rules {
            let hit = match &rule.matcher {
                RuleMatcher::Domain(value) => {
                    host.map(|h| h == value.as_str()).unwrap_or(false)
                }
                RuleMatcher::DomainSuffix(value) => host
                    .map(|h| h == value.as_str() || h.ends_with(&format!(".{value}")))
                    .unwrap_or(false),
                RuleMatcher::DomainKeyword(value) => {
                    host.map(|h| h.contains(value.as_str())).unwrap_or(false)
                }
                RuleMatcher::IpCidr(net) => ip.map(|addr| net.contains(&addr)).unwrap_or(false),
                RuleMatcher::GeoIp(cc) => match (&geoip, ip) {
                    (Some(resolver), Some(addr)) => resolver
                        .country_code(addr)
                        .map(|code| code.eq_ignore_ascii_case(cc))
                        .unwrap_or(false),
                    _ => false,
                },
                RuleMatcher::DstPort(value) => port == *value,
                RuleMatcher::Final => true,
            };
            if hit {
                return RoutingDecision {
                    action: rule.action,
                    matched_rule: Some(rule.to_line()),
                };
            }
        }
        // Unreachable given the guaranteed FINAL terminator.
        RoutingDecision {
            action: RouteAction::Direct,
            matched_rule: None,
        }
    }
}

const DEFAULT_TTL_SECONDS: u32 = 60;
const MIN_TTL_SECONDS: u32 = 1;
const MAX_TTL_SECONDS: u32 = 3600;
const MAX_HOSTS_PER_IP: usize = 16;
const STALE_GRACE_SECONDS: u64 = 5;

#[derive(Clone, Debug)]
struct ObservedHost {
    host: String,
    expires_at: StdInstant,
}

/// IP → hostname observations harvested from DNS responses that traverse
/// the tunnel. Entries honor the answer TTL with a short stale grace so a
/// connection racing its own DNS answer still classifies by name.
pub struct HostTracker {
    map: RwLock<HashMap<IpAddr, Vec<ObservedHost>>>,
}

impl Default for HostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTracker {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }

    pub fn observe(&self, host: &str, addresses: &[IpAddr], ttl_seconds: Option<u32>) {
        if addresses.is_empty() {
            return;
        }
        let Some(normalized) = normalize_host(host) else {
            return;
        };
        let now = StdInstant::now();
        let expires_at = now + ttl_duration(ttl_seconds);
        let mut guard = self.map.write();
        for addr in addresses {
            let entry = guard.entry(*addr).or_default();
            retain_with_grace(entry, now);
            if let Some(existing) = entry.iter_mut().find(|record| record.host == normalized) {
                existing.expires_at = expires_at;
            } else {
                if entry.len() >= MAX_HOSTS_PER_IP {
                    entry.remove(0);
                }
                entry.push(ObservedHost {
                    host: normalized.clone(),
                    expires_at,
                });
            }
        }
    }

    /// Most recent hostname observed for `addr`, falling back to a stale
    /// record within the grace window.
    pub fn host_for_ip(&self, addr: &IpAddr) -> Option<String> {
        let now = StdInstant::now();
        let mut guard = self.map.write();
        let entry = guard.get_mut(addr)?;
        retain_with_grace(entry, now);
        if entry.is_empty() {
            guard.remove(addr);
            return None;
        }
        let mut stale_candidate = None;
        for record in entry.iter().rev() {
            if record.expires_at > now {
                return Some(record.host.clone());
            }
            if stale_candidate.is_none() {
                stale_candidate = Some(record.host.clone());
            }
        }
        stale_candidate
    }

    #[allow(dead_code)]
    pub fn clear(&self) {
        self.map.write().clear();
    }
}

fn normalize_host(host: &str) -> Option<String> {
    let trimmed = host.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_ascii_lowercase())
    }
}

fn ttl_duration(ttl_seconds: Option<u32>) -> Duration {
    let secs = ttl_seconds.unwrap_or(DEFAULT_TTL_SECONDS);
    let clamped = secs.clamp(MIN_TTL_SECONDS, MAX_TTL_SECONDS);
    Duration::from_secs(clamped as u64)
}

fn retain_with_grace(entries: &mut Vec<ObservedHost>, now: StdInstant) {
    let grace = Duration::from_secs(STALE_GRACE_SECONDS);
    entries.retain(|record| record.expires_at + grace > now);
}
