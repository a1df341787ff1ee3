use super::*;
use crate::config::{CoreConfig, ProxyConfig};
use crate::device::{parse_packet, Transport};
use crate::proxy::ProxyManager;
use crate::rules::RouteAction;
use std::net::Ipv4Addr;
use std::time::Duration;
use tokio::runtime::Runtime;

const FLAG_FIN: u8 = 0x01;
const FLAG_SYN: u8 = 0x02;
const FLAG_ACK: u8 = 0x10;

fn test_config() -> CoreConfig {
    let mut config = CoreConfig::new(ProxyConfig {
        server_host: "127.0.0.1".to_string(),
        server_port: 1080,
        auth: None,
    });
    config.max_connections = 8;
    config
}

struct Harness {
    _runtime: Runtime,
    manager: FlowManager,
    proxy: Arc<ProxyManager>,
}

fn harness_with(config: CoreConfig, rules: &str) -> Harness {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .expect("runtime");
    let proxy = ProxyManager::new(config.proxy.clone());
    proxy.load_rules(rules);
    let manager = FlowManager::new(config, Arc::clone(&proxy), runtime.handle().clone());
    Harness {
        _runtime: runtime,
        manager,
        proxy,
    }
}

fn harness(rules: &str) -> Harness {
    harness_with(test_config(), rules)
}

fn build_tcp_packet(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = 40 + payload.len();
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 6;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());

    let tcp = 20;
    packet[tcp..tcp + 2].copy_from_slice(&src_port.to_be_bytes());
    packet[tcp + 2..tcp + 4].copy_from_slice(&dst_port.to_be_bytes());
    packet[tcp + 4..tcp + 8].copy_from_slice(&seq.to_be_bytes());
    packet[tcp + 8..tcp + 12].copy_from_slice(&ack.to_be_bytes());
    packet[tcp + 12] = 5 << 4;
    packet[tcp + 13] = flags;
    packet[tcp + 14..tcp + 16].copy_from_slice(&64240u16.to_be_bytes());
    packet[tcp + 20..].copy_from_slice(payload);

    let tcp_checksum =
        checksum::transport(IpAddr::V4(src), IpAddr::V4(dst), 6, &packet[tcp..]);
    packet[tcp + 16..tcp + 18].copy_from_slice(&tcp_checksum.to_be_bytes());
    let ip_checksum = checksum::ip_header(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    packet
}

fn build_udp_packet(
    src: Ipv4Addr,
    src_port: u16,
    dst: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;
    let mut packet = vec![0u8; total_len];
    packet[0] = 0x45;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[8] = 64;
    packet[9] = 17;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());

    let udp = 20;
    packet[udp..udp + 2].copy_from_slice(&src_port.to_be_bytes());
    packet[udp + 2..udp + 4].copy_from_slice(&dst_port.to_be_bytes());
    packet[udp + 4..udp + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    packet[udp + 8..].copy_from_slice(payload);

    let udp_checksum =
        checksum::transport(IpAddr::V4(src), IpAddr::V4(dst), 17, &packet[udp..]);
    packet[udp + 6..udp + 8].copy_from_slice(&udp_checksum.to_be_bytes());
    let ip_checksum = checksum::ip_header(&packet[..20]);
    packet[10..12].copy_from_slice(&ip_checksum.to_be_bytes());
    packet
}

fn deliver(manager: &mut FlowManager, packet: &[u8], now: StdInstant) -> AdmitVerdict {
    let parsed = parse_packet(packet).expect("test packet must parse");
    let verdict = manager.admit(&parsed, now);
    if verdict == AdmitVerdict::Forward {
        manager.device_handle().push_rx(packet);
    }
    verdict
}

fn tcp_flags_of(packet: &[u8]) -> Option<crate::device::TcpFlags> {
    match parse_packet(packet).ok()?.transport {
        Transport::Tcp(header) => Some(header.flags),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// NAT table
// ---------------------------------------------------------------------------

fn key_for(port_offset: u16) -> FlowKey {
    FlowKey {
        src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        src_port: 40000 + port_offset,
        dst_ip: IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)),
        dst_port: 80,
        kind: FlowKind::Tcp,
    }
}

#[test]
fn nat_ports_unique_and_in_range() {
    let mut table = NatTable::new(64);
    let now = StdInstant::now();
    let mut seen = std::collections::HashSet::new();
    for offset in 0..64 {
        let id = table.allocate(key_for(offset), now).expect("allocate");
        let port = table.get(id).unwrap().local_port;
        assert!((nat::PORT_RANGE_START..=nat::PORT_RANGE_END).contains(&port));
        assert!(seen.insert(port), "port {port} allocated twice");
    }
}

#[test]
fn nat_exhaustion_leaves_existing_flows_alone() {
    let mut table = NatTable::new(2);
    let now = StdInstant::now();
    let first = table.allocate(key_for(0), now).expect("first");
    let second = table.allocate(key_for(1), now).expect("second");
    assert!(matches!(
        table.allocate(key_for(2), now),
        Err(crate::error::CoreError::NatTableFull)
    ));
    assert!(table.get(first).is_some());
    assert!(table.get(second).is_some());
    assert_eq!(table.len(), 2);
}

#[test]
fn nat_reclaims_closed_entries_after_linger() {
    let mut table = NatTable::new(4);
    let now = StdInstant::now();
    let id = table.allocate(key_for(0), now).expect("allocate");
    table.mark_closed(id, now);
    assert!(table
        .evict_expired(now + Duration::from_millis(100), Duration::from_secs(2))
        .is_empty());
    let evicted = table.evict_expired(now + Duration::from_secs(3), Duration::from_secs(2));
    assert_eq!(evicted, vec![id]);
    assert!(table.lookup(&key_for(0)).is_none());
}

#[test]
fn nat_reuses_freed_ports_after_wrap() {
    let mut table = NatTable::new(4);
    let now = StdInstant::now();
    let id = table.allocate(key_for(0), now).expect("allocate");
    let port = table.get(id).unwrap().local_port;
    table.remove(id);
    // The cursor rolls forward, but the freed port comes back eventually.
    let mut reused = false;
    for offset in 1..60 {
        let id = table.allocate(key_for(offset), now).expect("allocate");
        if table.get(id).unwrap().local_port == port {
            reused = true;
        }
        table.remove(id);
    }
    // 59 allocations never collide while the port space is this empty.
    assert!(!reused);
}

#[test]
fn nat_byte_counters_are_monotonic() {
    let mut table = NatTable::new(4);
    let now = StdInstant::now();
    let id = table.allocate(key_for(0), now).expect("allocate");
    let entry = table.get_mut(id).unwrap();
    entry.bytes_in += 100;
    entry.bytes_out += 50;
    let (bytes_in, bytes_out) = (entry.bytes_in, entry.bytes_out);
    let entry = table.get_mut(id).unwrap();
    entry.bytes_in += 1;
    assert!(entry.bytes_in > bytes_in);
    assert_eq!(entry.bytes_out, bytes_out);
}

#[test]
fn nat_route_decision_is_write_once() {
    let mut table = NatTable::new(4);
    let id = table
        .allocate(key_for(0), StdInstant::now())
        .expect("allocate");
    let entry = table.get_mut(id).unwrap();
    entry.set_decision(crate::rules::RoutingDecision {
        action: RouteAction::Proxy,
        matched_rule: None,
    });
    entry.set_decision(crate::rules::RoutingDecision {
        action: RouteAction::Direct,
        matched_rule: None,
    });
    assert_eq!(entry.decision().unwrap().action, RouteAction::Proxy);
}

// ---------------------------------------------------------------------------
// Packet builder
// ---------------------------------------------------------------------------

#[test]
fn rst_builder_answers_a_syn() {
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40000,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        1000,
        0,
        FLAG_SYN,
        &[],
    );
    let parsed = parse_packet(&syn).expect("syn parses");
    let Transport::Tcp(header) = &parsed.transport else {
        panic!("expected tcp");
    };
    let rst = packet_builder::build_tcp_reset(&parsed.ip, header, parsed.payload.len())
        .expect("rst built");
    let parsed_rst = parse_packet(&rst).expect("rst parses");
    assert_eq!(parsed_rst.ip.src, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
    assert_eq!(parsed_rst.ip.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
    let Transport::Tcp(rst_header) = &parsed_rst.transport else {
        panic!("expected tcp");
    };
    assert!(rst_header.flags.rst);
    assert!(rst_header.flags.ack);
    assert_eq!(rst_header.src_port, 80);
    assert_eq!(rst_header.dst_port, 40000);
    // RST of a SYN acknowledges ISN + 1.
    assert_eq!(rst_header.ack_number, 1001);
    // A valid IPv4 header checksums to zero.
    assert_eq!(checksum::ip_header(&rst[..20]), 0);
}

#[test]
fn udp_response_builder_swaps_endpoints() {
    let key = FlowKey {
        src_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
        src_port: 5353,
        dst_ip: IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
        dst_port: 53,
        kind: FlowKind::Udp,
    };
    let response = packet_builder::build_udp_response(&key, b"answer").expect("response built");
    let parsed = parse_packet(&response).expect("response parses");
    assert_eq!(parsed.ip.src, key.dst_ip);
    assert_eq!(parsed.ip.dst, key.src_ip);
    let Transport::Udp(udp) = &parsed.transport else {
        panic!("expected udp");
    };
    assert_eq!(udp.src_port, 53);
    assert_eq!(udp.dst_port, 5353);
    assert_eq!(parsed.payload, b"answer");
}

// ---------------------------------------------------------------------------
// Sniffer
// ---------------------------------------------------------------------------

#[test]
fn sniffs_sni_from_client_hello() {
    let hello = sniff::build_client_hello("api.example.com");
    assert_eq!(
        sniff::sniff_host(&hello),
        sniff::SniffOutcome::Found("api.example.com".to_string())
    );
}

#[test]
fn sniffs_host_header_from_http() {
    let request = b"GET /index.html HTTP/1.1\r\nUser-Agent: curl\r\nHost: Example.COM:8080\r\n\r\n";
    assert_eq!(
        sniff::sniff_host(request),
        sniff::SniffOutcome::Found("example.com".to_string())
    );
}

#[test]
fn partial_client_hello_wants_more() {
    let hello = sniff::build_client_hello("api.example.com");
    assert_eq!(
        sniff::sniff_host(&hello[..10]),
        sniff::SniffOutcome::NeedMore
    );
}

#[test]
fn partial_http_headers_want_more() {
    let request = b"GET / HTTP/1.1\r\nUser-Agent: curl\r\n";
    assert_eq!(sniff::sniff_host(request), sniff::SniffOutcome::NeedMore);
}

#[test]
fn binary_payload_is_not_sniffable() {
    assert_eq!(
        sniff::sniff_host(&[0x8B, 0x00, 0x01, 0x02]),
        sniff::SniffOutcome::NotApplicable
    );
}

#[test]
fn http_without_host_is_not_sniffable() {
    let request = b"GET / HTTP/1.0\r\nUser-Agent: curl\r\n\r\n";
    assert_eq!(
        sniff::sniff_host(request),
        sniff::SniffOutcome::NotApplicable
    );
}

// ---------------------------------------------------------------------------
// Flow manager
// ---------------------------------------------------------------------------

#[test]
fn direct_tcp_flow_synthesizes_syn_ack() {
    let mut harness = harness("IP-CIDR,1.2.3.0/24,DIRECT\nFINAL,REJECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40000,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        1000,
        0,
        FLAG_SYN,
        &[],
    );
    assert_eq!(
        deliver(&mut harness.manager, &syn, now),
        AdmitVerdict::Forward
    );
    harness.manager.poll(Instant::from_millis(0), now);

    assert_eq!(harness.manager.live_flows(), 1);
    assert_eq!(harness.manager.stats().direct, 1);
    assert_eq!(harness.manager.stats().total_connections, 1);
    let frames = harness.manager.device_handle().pop_tx_batch(16);
    let syn_ack = frames
        .iter()
        .find(|frame| {
            tcp_flags_of(frame)
                .map(|flags| flags.syn && flags.ack)
                .unwrap_or(false)
        })
        .expect("SYN-ACK synthesized into tx");
    let parsed = parse_packet(syn_ack).expect("syn-ack parses");
    assert_eq!(parsed.ip.src, IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)));
    assert_eq!(parsed.ip.dst, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
}

#[test]
fn keyword_reject_emits_rst_and_counts() {
    let mut harness = harness("DOMAIN-KEYWORD,ads,REJECT\nFINAL,DIRECT\n");
    let dst = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
    harness
        .proxy
        .hosts()
        .observe("tracker-ads.net", &[dst], Some(60));
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40001,
        Ipv4Addr::new(203, 0, 113, 9),
        80,
        5000,
        0,
        FLAG_SYN,
        &[],
    );
    assert_eq!(deliver(&mut harness.manager, &syn, now), AdmitVerdict::Drop);
    assert_eq!(harness.manager.stats().rejected, 1);

    let frames = harness.manager.device_handle().pop_tx_batch(16);
    let rst = frames
        .iter()
        .find(|frame| tcp_flags_of(frame).map(|flags| flags.rst).unwrap_or(false))
        .expect("RST synthesized into tx");
    let parsed = parse_packet(rst).expect("rst parses");
    assert_eq!(parsed.ip.src, dst);
}

#[test]
fn nat_exhaustion_drops_third_syn() {
    let mut config = test_config();
    config.max_connections = 2;
    let mut harness = harness_with(config, "FINAL,DIRECT\n");
    let now = StdInstant::now();
    for index in 0..2u16 {
        let syn = build_tcp_packet(
            Ipv4Addr::new(10, 0, 0, 2),
            41000 + index,
            Ipv4Addr::new(1, 2, 3, 4),
            80,
            1,
            0,
            FLAG_SYN,
            &[],
        );
        assert_eq!(
            deliver(&mut harness.manager, &syn, now),
            AdmitVerdict::Forward
        );
    }
    let third = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        41002,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    assert_eq!(
        deliver(&mut harness.manager, &third, now),
        AdmitVerdict::Drop
    );
    assert_eq!(harness.manager.counters().nat_table_full, 1);
    assert_eq!(harness.manager.live_flows(), 2);
}

#[test]
fn udp_proxy_action_falls_back_to_direct() {
    let mut harness = harness("FINAL,PROXY\n");
    let now = StdInstant::now();
    let datagram = build_udp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        50000,
        Ipv4Addr::new(198, 51, 100, 1),
        9000,
        b"ping",
    );
    assert_eq!(
        deliver(&mut harness.manager, &datagram, now),
        AdmitVerdict::Forward
    );
    assert_eq!(harness.manager.counters().udp_proxy_fallback, 1);
    assert_eq!(harness.manager.stats().direct, 1);
    assert_eq!(harness.manager.stats().proxied, 0);
}

#[test]
fn upstream_payload_becomes_udp_response() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let datagram = build_udp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        50001,
        Ipv4Addr::new(198, 51, 100, 2),
        7000,
        b"hello",
    );
    deliver(&mut harness.manager, &datagram, now);
    let id = harness.manager.nat.ids()[0];

    harness
        .manager
        .events_tx
        .send(UpstreamEvent::Data(id, b"world".to_vec()))
        .expect("event queued");
    harness.manager.poll(Instant::from_millis(0), now);

    let frames = harness.manager.device_handle().pop_tx_batch(16);
    let response = frames
        .iter()
        .find_map(|frame| {
            let parsed = parse_packet(frame).ok()?;
            match parsed.transport {
                Transport::Udp(udp) if udp.dst_port == 50001 => {
                    Some(parsed.payload.to_vec())
                }
                _ => None,
            }
        })
        .expect("UDP response in tx");
    assert_eq!(response, b"world");
    assert_eq!(harness.manager.nat.get(id).unwrap().bytes_in, 5);
    assert_eq!(harness.manager.stats().bytes_received, 5);
}

#[test]
fn dns_responses_feed_the_host_tracker() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let query = build_udp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        50002,
        Ipv4Addr::new(8, 8, 8, 8),
        53,
        b"\x00\x01\x01\x00\x00\x01\x00\x00\x00\x00\x00\x00",
    );
    deliver(&mut harness.manager, &query, now);
    let id = harness.manager.nat.ids()[0];

    let answer = crate::dns::tests::build_response("cdn.example.net", [203, 0, 113, 80], 300);
    harness
        .manager
        .events_tx
        .send(UpstreamEvent::Data(id, answer))
        .expect("event queued");
    harness.manager.poll(Instant::from_millis(0), now);

    let tracked = harness
        .proxy
        .hosts()
        .host_for_ip(&IpAddr::V4(Ipv4Addr::new(203, 0, 113, 80)));
    assert_eq!(tracked.as_deref(), Some("cdn.example.net"));
}

#[test]
fn connect_failure_resets_flow() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40002,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        9000,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    harness.manager.poll(Instant::from_millis(0), now);
    harness.manager.device_handle().pop_tx_batch(64);
    let id = harness.manager.nat.ids()[0];

    harness
        .manager
        .events_tx
        .send(UpstreamEvent::ConnectFailed(id, "refused".to_string()))
        .expect("event queued");
    harness.manager.poll(Instant::from_millis(5), now);

    assert_eq!(
        harness.manager.nat.get(id).unwrap().state,
        FlowState::Closed
    );
    assert_eq!(harness.manager.counters().upstream_errors, 1);
    let frames = harness.manager.device_handle().pop_tx_batch(64);
    assert!(
        frames
            .iter()
            .any(|frame| tcp_flags_of(frame).map(|flags| flags.rst).unwrap_or(false)),
        "RST emitted after dial failure"
    );
}

#[test]
fn deferred_classification_sniffs_sni() {
    let mut harness = harness("DOMAIN-SUFFIX,example.com,PROXY\nFINAL,DIRECT\n");
    let now = StdInstant::now();
    let client = Ipv4Addr::new(10, 0, 0, 2);
    let server = Ipv4Addr::new(93, 184, 216, 34);
    let syn = build_tcp_packet(client, 40003, server, 443, 1000, 0, FLAG_SYN, &[]);
    deliver(&mut harness.manager, &syn, now);
    harness.manager.poll(Instant::from_millis(0), now);

    // No hostname yet: classification is deferred, nothing dialed.
    let id = harness.manager.nat.ids()[0];
    assert_eq!(harness.manager.nat.get(id).unwrap().state, FlowState::New);
    assert_eq!(harness.manager.stats().proxied, 0);

    // Finish the handshake against the virtual socket.
    let frames = harness.manager.device_handle().pop_tx_batch(16);
    let syn_ack = frames
        .iter()
        .find(|frame| {
            tcp_flags_of(frame)
                .map(|flags| flags.syn && flags.ack)
                .unwrap_or(false)
        })
        .expect("SYN-ACK for deferred flow");
    let parsed = parse_packet(syn_ack).expect("syn-ack parses");
    let Transport::Tcp(header) = parsed.transport else {
        panic!("expected tcp");
    };
    let server_isn = header.seq_number;

    let ack = build_tcp_packet(
        client,
        40003,
        server,
        443,
        1001,
        server_isn.wrapping_add(1),
        FLAG_ACK,
        &[],
    );
    deliver(&mut harness.manager, &ack, now);
    let hello = sniff::build_client_hello("api.example.com");
    let data = build_tcp_packet(
        client,
        40003,
        server,
        443,
        1001,
        server_isn.wrapping_add(1),
        FLAG_ACK | 0x08,
        &hello,
    );
    deliver(&mut harness.manager, &data, now);
    harness.manager.poll(Instant::from_millis(10), now);

    let entry = harness.manager.nat.get(id).expect("entry survives");
    assert_eq!(entry.state, FlowState::Connecting);
    let decision = entry.decision().expect("decision cached");
    assert_eq!(decision.action, RouteAction::Proxy);
    assert!(decision
        .matched_rule
        .as_deref()
        .unwrap_or_default()
        .contains("DOMAIN-SUFFIX"));
    assert_eq!(harness.manager.stats().proxied, 1);
}

#[test]
fn sniff_deadline_falls_back_to_ip_classification() {
    let mut config = test_config();
    config.sniff_deadline = Duration::from_millis(0);
    let mut harness = harness_with(config, "DOMAIN,only.example.com,PROXY\nFINAL,DIRECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40004,
        Ipv4Addr::new(198, 51, 100, 7),
        443,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    harness
        .manager
        .poll(Instant::from_millis(0), now + Duration::from_millis(1));

    let id = harness.manager.nat.ids()[0];
    let entry = harness.manager.nat.get(id).unwrap();
    assert_eq!(entry.state, FlowState::Connecting);
    assert_eq!(entry.decision().unwrap().action, RouteAction::Direct);
    assert_eq!(harness.manager.counters().sniff_timeouts, 1);
}

#[test]
fn rule_reload_keeps_cached_decision() {
    let mut harness = harness("FINAL,PROXY\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40005,
        Ipv4Addr::new(1, 2, 3, 4),
        443,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    let first = harness.manager.nat.ids()[0];
    assert_eq!(
        harness.manager.nat.get(first).unwrap().decision().unwrap().action,
        RouteAction::Proxy
    );

    harness.proxy.load_rules("FINAL,DIRECT\n");

    // The in-flight flow keeps Proxy; a new flow sees Direct.
    let syn2 = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40006,
        Ipv4Addr::new(1, 2, 3, 4),
        443,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn2, now);
    let second = harness
        .manager
        .nat
        .ids()
        .into_iter()
        .find(|id| *id != first)
        .expect("second flow");
    assert_eq!(
        harness.manager.nat.get(first).unwrap().decision().unwrap().action,
        RouteAction::Proxy
    );
    assert_eq!(
        harness.manager.nat.get(second).unwrap().decision().unwrap().action,
        RouteAction::Direct
    );
}

#[test]
fn udp_idle_timeout_closes_flow() {
    let mut config = test_config();
    config.udp_idle_timeout = Duration::from_millis(50);
    let mut harness = harness_with(config, "FINAL,DIRECT\n");
    let start = StdInstant::now();
    let datagram = build_udp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        50003,
        Ipv4Addr::new(198, 51, 100, 3),
        7000,
        b"x",
    );
    deliver(&mut harness.manager, &datagram, start);
    let id = harness.manager.nat.ids()[0];
    assert!(harness.manager.nat.get(id).unwrap().is_live());

    // Absorb the dial completion at `start` so the idle clock is stable.
    let deadline = StdInstant::now() + Duration::from_secs(2);
    while harness.manager.nat.get(id).unwrap().state != FlowState::Established {
        assert!(StdInstant::now() < deadline, "udp dial never completed");
        std::thread::sleep(Duration::from_millis(10));
        harness.manager.poll(Instant::from_millis(0), start);
    }

    harness
        .manager
        .poll(Instant::from_millis(100), start + Duration::from_secs(1));
    assert_eq!(
        harness.manager.nat.get(id).unwrap().state,
        FlowState::Closed
    );
}

#[test]
fn repeated_syn_reuses_the_existing_flow() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40010,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    let id = harness.manager.nat.ids()[0];
    // Retransmitted SYN: processed as a segment, no second entry.
    assert_eq!(
        deliver(&mut harness.manager, &syn, now),
        AdmitVerdict::Forward
    );
    assert_eq!(harness.manager.live_flows(), 1);
    assert_eq!(harness.manager.nat.ids()[0], id);
    assert_eq!(harness.manager.stats().total_connections, 1);
}

#[test]
fn syn_for_lingering_flow_reclaims_entry() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40007,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    let old_id = harness.manager.nat.ids()[0];
    harness.manager.close_flow(old_id, now, "test");

    // Same 5-tuple, new SYN: the lingering entry is replaced.
    assert_eq!(
        deliver(&mut harness.manager, &syn, now),
        AdmitVerdict::Forward
    );
    let ids = harness.manager.nat.ids();
    assert_eq!(ids.len(), 1);
    assert_ne!(ids[0], old_id);
    assert!(harness.manager.nat.get(ids[0]).unwrap().is_live());
}

#[test]
fn shutdown_resets_everything_and_emits_rst() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40008,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        777,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    harness.manager.poll(Instant::from_millis(0), now);
    harness.manager.device_handle().pop_tx_batch(64);

    harness.manager.shutdown(Instant::from_millis(5), now);

    assert_eq!(harness.manager.live_flows(), 0);
    assert_eq!(harness.manager.stats().active_connections, 0);
    assert_eq!(harness.manager.stats().total_connections, 0);
    let frames = harness.manager.device_handle().pop_tx_batch(64);
    assert!(
        frames
            .iter()
            .any(|frame| tcp_flags_of(frame).map(|flags| flags.rst).unwrap_or(false)),
        "shutdown emits RST for the live flow"
    );
}

#[test]
fn fin_from_client_marks_entry() {
    let mut harness = harness("FINAL,DIRECT\n");
    let now = StdInstant::now();
    let syn = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40009,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        1,
        0,
        FLAG_SYN,
        &[],
    );
    deliver(&mut harness.manager, &syn, now);
    let id = harness.manager.nat.ids()[0];
    let fin = build_tcp_packet(
        Ipv4Addr::new(10, 0, 0, 2),
        40009,
        Ipv4Addr::new(1, 2, 3, 4),
        80,
        2,
        1,
        FLAG_FIN | FLAG_ACK,
        &[],
    );
    deliver(&mut harness.manager, &fin, now);
    assert!(harness.manager.nat.get(id).unwrap().client_closed);
}
