//! Proxy manager: owns the enabled flag, the upstream proxy settings, the
//! rule engine, and the hostname tracker feeding it.

use crate::config::ProxyConfig;
use crate::flow::FlowKind;
use crate::logger::{self, BreadcrumbFlags};
use crate::rules::{
    GeoIpResolver, HostTracker, LoadOutcome, RouteAction, RoutingDecision, RuleEngine,
};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub struct ProxyManager {
    enabled: AtomicBool,
    config: ProxyConfig,
    rules: RuleEngine,
    hosts: HostTracker,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        Arc::new(Self {
            enabled: AtomicBool::new(true),
            config,
            rules: RuleEngine::new(),
            hosts: HostTracker::new(),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
        logger::breadcrumb(
            BreadcrumbFlags::RULE,
            format!("proxy {}", if enabled { "enabled" } else { "disabled" }),
        );
    }

    pub fn load_rules(&self, text: &str) -> LoadOutcome {
        let outcome = self.rules.load(text);
        for warning in &outcome.warnings {
            logger::warn(format!("rule loader: {warning}"));
        }
        logger::breadcrumb(
            BreadcrumbFlags::RULE,
            format!(
                "rule table replaced ({} accepted, {} warnings, {} unknown types)",
                outcome.accepted,
                outcome.warnings.len(),
                outcome.unknown_skipped
            ),
        );
        outcome
    }

    pub fn hosts(&self) -> &HostTracker {
        &self.hosts
    }

    /// GEOIP rules stay unmatched until a resolver is injected here.
    pub fn install_geoip(&self, resolver: Arc<dyn GeoIpResolver>) {
        self.rules.install_geoip(resolver);
    }

    /// True when classification should wait for a sniffed hostname.
    pub fn wants_hostname(&self) -> bool {
        self.rules.has_domain_rules()
    }

    /// Classify a prospective flow. A disabled proxy forces Direct
    /// regardless of any rule match.
    pub fn evaluate_route(
        &self,
        host: Option<&str>,
        ip: Option<IpAddr>,
        port: u16,
        proto: FlowKind,
    ) -> RoutingDecision {
        if !self.is_enabled() {
            return RoutingDecision {
                action: RouteAction::Direct,
                matched_rule: None,
            };
        }
        // Fall back to an observed hostname when the caller has none.
        let tracked = match (host, ip) {
            (None, Some(addr)) => self.hosts.host_for_ip(&addr),
            _ => None,
        };
        let host = host.or(tracked.as_deref());
        let decision = self.rules.evaluate(host, ip, port, proto);
        logger::breadcrumb(
            BreadcrumbFlags::RULE,
            format!(
                "route {}:{} host={} -> {:?} ({})",
                ip.map(|addr| addr.to_string()).unwrap_or_default(),
                port,
                host.unwrap_or("-"),
                decision.action,
                decision.matched_rule.as_deref().unwrap_or("default"),
            ),
        );
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyAuth;
    use std::net::Ipv4Addr;

    fn manager() -> Arc<ProxyManager> {
        ProxyManager::new(ProxyConfig {
            server_host: "198.51.100.1".to_string(),
            server_port: 1080,
            auth: Some(ProxyAuth {
                username: "user".to_string(),
                password: "pass".to_string(),
            }),
        })
    }

    #[test]
    fn disabled_proxy_forces_direct() {
        let manager = manager();
        manager.load_rules("DOMAIN-KEYWORD,ads,REJECT\nFINAL,PROXY\n");
        manager.set_enabled(false);
        let decision = manager.evaluate_route(Some("tracker-ads.net"), None, 80, FlowKind::Tcp);
        assert_eq!(decision.action, RouteAction::Direct);
        manager.set_enabled(true);
        let decision = manager.evaluate_route(Some("tracker-ads.net"), None, 80, FlowKind::Tcp);
        assert_eq!(decision.action, RouteAction::Reject);
    }

    #[test]
    fn observed_hostname_backfills_ip_flows() {
        let manager = manager();
        manager.load_rules("DOMAIN-SUFFIX,example.com,PROXY\nFINAL,DIRECT\n");
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7));
        manager.hosts().observe("api.example.com", &[addr], Some(60));
        let decision = manager.evaluate_route(None, Some(addr), 443, FlowKind::Tcp);
        assert_eq!(decision.action, RouteAction::Proxy);
    }

    #[test]
    fn explicit_hostname_beats_tracker() {
        let manager = manager();
        manager.load_rules("DOMAIN,sniffed.test,REJECT\nFINAL,DIRECT\n");
        let addr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8));
        manager.hosts().observe("other.test", &[addr], Some(60));
        let decision =
            manager.evaluate_route(Some("sniffed.test"), Some(addr), 443, FlowKind::Tcp);
        assert_eq!(decision.action, RouteAction::Reject);
    }
}
