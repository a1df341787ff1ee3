use serde::Serialize;

/// Traffic and routing counters. All fields are monotonic except
/// `active_connections`, which is a gauge. Mutated only under the boundary
/// lock, so plain integers suffice.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct ProxyStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub direct: u64,
    pub proxied: u64,
    pub rejected: u64,
}

/// Warning counters for recovered-locally conditions. Never surfaced as
/// errors; exposed for diagnostics alongside `ProxyStats`.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct WarnCounters {
    pub invalid_packets: u64,
    pub icmp_dropped: u64,
    pub ipv6_dropped: u64,
    pub rx_overflow: u64,
    pub tx_overflow: u64,
    pub nat_table_full: u64,
    pub rule_warnings: u64,
    pub udp_proxy_fallback: u64,
    pub sniff_timeouts: u64,
    pub upstream_errors: u64,
}
