//! Flow manager: ties NAT entries to stack sockets and upstream sockets and
//! drives every flow's lifecycle under the externally supplied poll clock.

pub(crate) mod checksum;
mod interface;
mod nat;
mod packet_builder;
mod sniff;
mod state;
mod upstream;

pub use nat::{FlowId, FlowState, NatTable};
pub use state::{FlowKey, FlowKind};

use crate::config::CoreConfig;
use crate::device::{DeviceHandle, ParsedPacket, TcpHeader, Transport, VirtDevice};
use crate::dns;
use crate::logger::{self, BreadcrumbFlags};
use crate::proxy::ProxyManager;
use crate::rules::RouteAction;
use crate::socks5::{Socks5Target, TargetAddr};
use crate::stats::{ProxyStats, WarnCounters};
use rustc_hash::FxHashMap;
use smoltcp::iface::{Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{
    SendError as TcpSendError, Socket as TcpSocket, State as TcpState,
};
use smoltcp::socket::udp::Socket as UdpSocket;
use smoltcp::time::Instant;
use smoltcp::wire::{IpAddress, IpListenEndpoint, Ipv4Address, Ipv6Address};
use state::{stage_payload, RuntimeFlow, SNIFF_PEEK_BYTES};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::runtime::Handle;
use upstream::{TcpDial, UpstreamEvent};

use interface::build_interface_and_sockets;

/// Whether an admitted packet should continue into the stack or be dropped
/// at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitVerdict {
    Forward,
    Drop,
}

pub struct FlowManager {
    device: VirtDevice,
    handle: DeviceHandle,
    interface: Interface,
    sockets: SocketSet<'static>,
    tcp_pool: Vec<SocketHandle>,
    udp_pool: Vec<SocketHandle>,
    nat: NatTable,
    runtime_flows: FxHashMap<FlowId, RuntimeFlow>,
    proxy: Arc<ProxyManager>,
    config: CoreConfig,
    runtime: Handle,
    events_tx: crossbeam_channel::Sender<UpstreamEvent>,
    events_rx: crossbeam_channel::Receiver<UpstreamEvent>,
    stats: ProxyStats,
    counters: WarnCounters,
}

impl FlowManager {
    pub fn new(config: CoreConfig, proxy: Arc<ProxyManager>, runtime: Handle) -> Self {
        let device = VirtDevice::new(config.mtu, config.queue_capacity);
        let handle = device.handle();
        let (device, interface, sockets, tcp_pool, udp_pool) =
            build_interface_and_sockets(device, config.max_connections);
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        Self {
            device,
            handle,
            interface,
            sockets,
            tcp_pool,
            udp_pool,
            nat: NatTable::new(config.max_connections),
            runtime_flows: FxHashMap::default(),
            proxy,
            config,
            runtime,
            events_tx,
            events_rx,
            stats: ProxyStats::default(),
            counters: WarnCounters::default(),
        }
    }

    pub fn device_handle(&self) -> DeviceHandle {
        self.handle.clone()
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats
    }

    pub fn counters(&self) -> WarnCounters {
        let mut counters = self.counters;
        let (rx_dropped, tx_dropped) = self.handle.drop_counts();
        counters.rx_overflow = rx_dropped;
        counters.tx_overflow = tx_dropped;
        counters
    }

    pub fn note_invalid_packet(&mut self) {
        self.counters.invalid_packets += 1;
    }

    pub fn note_rule_warnings(&mut self, count: u64) {
        self.counters.rule_warnings = self.counters.rule_warnings.saturating_add(count);
    }

    pub fn live_flows(&self) -> usize {
        self.nat.len()
    }

    /// Flow-track one inbound datagram before it reaches the stack. Returns
    /// whether the packet should be forwarded into the rx queue.
    pub fn admit(&mut self, packet: &ParsedPacket<'_>, now: StdInstant) -> AdmitVerdict {
        if matches!(packet.transport, Transport::Icmp) {
            self.counters.icmp_dropped += 1;
            return AdmitVerdict::Drop;
        }
        if packet.is_ipv6() && !self.config.ipv6_enabled {
            self.counters.ipv6_dropped += 1;
            return AdmitVerdict::Drop;
        }
        let Some(key) = FlowKey::from_packet(packet) else {
            return AdmitVerdict::Drop;
        };
        match &packet.transport {
            Transport::Tcp(tcp) => self.admit_tcp(packet, tcp, key, now),
            Transport::Udp(_) => self.admit_udp(key, now),
            Transport::Icmp => AdmitVerdict::Drop,
        }
    }

    fn admit_tcp(
        &mut self,
        packet: &ParsedPacket<'_>,
        tcp: &TcpHeader,
        key: FlowKey,
        now: StdInstant,
    ) -> AdmitVerdict {
        if let Some(id) = self.nat.lookup(&key) {
            let reclaim = match self.nat.get_mut(id) {
                Some(entry) if entry.state == FlowState::Closed && tcp.flags.syn => true,
                Some(entry) => {
                    entry.touch(now);
                    if tcp.flags.fin || tcp.flags.rst {
                        entry.client_closed = true;
                    }
                    false
                }
                None => false,
            };
            if !reclaim {
                return AdmitVerdict::Forward;
            }
            // Fresh SYN on a lingering entry: reclaim and start over.
            self.release_runtime(id);
            self.nat.remove(id);
            logger::breadcrumb(
                BreadcrumbFlags::FLOW,
                format!("reclaimed lingering flow for {}:{}", key.dst_ip, key.dst_port),
            );
        }
        if !tcp.flags.syn {
            // Stray segment for an untracked flow; the stack answers with RST.
            return AdmitVerdict::Forward;
        }

        let tracked = self.proxy.hosts().host_for_ip(&key.dst_ip);
        let defer = tracked.is_none() && self.proxy.is_enabled() && self.proxy.wants_hostname();
        let decision = if defer {
            None
        } else {
            Some(self.proxy.evaluate_route(
                tracked.as_deref(),
                Some(key.dst_ip),
                key.dst_port,
                FlowKind::Tcp,
            ))
        };

        if let Some(decision) = &decision {
            if decision.action == RouteAction::Reject {
                let id = match self.nat.allocate(key, now) {
                    Ok(id) => id,
                    Err(_) => {
                        self.counters.nat_table_full += 1;
                        logger::warn("flow table full, dropping SYN");
                        return AdmitVerdict::Drop;
                    }
                };
                if let Some(entry) = self.nat.get_mut(id) {
                    entry.set_decision(decision.clone());
                }
                self.nat.mark_closed(id, now);
                self.stats.total_connections += 1;
                self.stats.rejected += 1;
                if let Some(rst) =
                    packet_builder::build_tcp_reset(&packet.ip, tcp, packet.payload.len())
                {
                    self.handle.push_tx(rst);
                }
                logger::breadcrumb(
                    BreadcrumbFlags::FLOW,
                    format!("rejected TCP flow to {}:{}", key.dst_ip, key.dst_port),
                );
                return AdmitVerdict::Drop;
            }
        }

        let Some(socket) = self.tcp_pool.pop() else {
            self.counters.nat_table_full += 1;
            logger::warn("TCP socket pool exhausted, dropping SYN");
            return AdmitVerdict::Drop;
        };
        let id = match self.nat.allocate(key, now) {
            Ok(id) => id,
            Err(_) => {
                self.tcp_pool.push(socket);
                self.counters.nat_table_full += 1;
                logger::warn("flow table full, dropping SYN");
                return AdmitVerdict::Drop;
            }
        };
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;

        let tcp_socket = self.sockets.get_mut::<TcpSocket>(socket);
        let endpoint = IpListenEndpoint {
            addr: Some(ip_to_smolt(key.dst_ip)),
            port: key.dst_port,
        };
        let _ = tcp_socket.listen(endpoint);
        let mut flow = RuntimeFlow::new(Some(socket));
        if defer {
            flow.sniff_deadline = Some(now + self.config.sniff_deadline);
        }
        self.runtime_flows.insert(id, flow);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "TCP flow {}:{} -> {}:{} admitted (flow {})",
                key.src_ip, key.src_port, key.dst_ip, key.dst_port, id
            ),
        );
        if let Some(decision) = decision {
            if let Some(entry) = self.nat.get_mut(id) {
                entry.set_decision(decision.clone());
            }
            self.dispatch_upstream(id, decision.action, tracked);
        }
        AdmitVerdict::Forward
    }

    fn admit_udp(&mut self, key: FlowKey, now: StdInstant) -> AdmitVerdict {
        if let Some(id) = self.nat.lookup(&key) {
            if let Some(entry) = self.nat.get_mut(id) {
                if entry.is_live() {
                    entry.touch(now);
                    return AdmitVerdict::Forward;
                }
            }
            // Datagram for a lingering entry: reclaim and start over.
            self.release_runtime(id);
            self.nat.remove(id);
        }

        let tracked = self.proxy.hosts().host_for_ip(&key.dst_ip);
        let decision = self.proxy.evaluate_route(
            tracked.as_deref(),
            Some(key.dst_ip),
            key.dst_port,
            FlowKind::Udp,
        );
        if decision.action == RouteAction::Reject {
            let id = match self.nat.allocate(key, now) {
                Ok(id) => id,
                Err(_) => {
                    self.counters.nat_table_full += 1;
                    return AdmitVerdict::Drop;
                }
            };
            if let Some(entry) = self.nat.get_mut(id) {
                entry.set_decision(decision);
            }
            self.nat.mark_closed(id, now);
            self.stats.total_connections += 1;
            self.stats.rejected += 1;
            // Rejected UDP is dropped silently.
            return AdmitVerdict::Drop;
        }

        let Some(socket) = self.udp_pool.pop() else {
            self.counters.nat_table_full += 1;
            logger::warn("UDP socket pool exhausted, dropping datagram");
            return AdmitVerdict::Drop;
        };
        let id = match self.nat.allocate(key, now) {
            Ok(id) => id,
            Err(_) => {
                self.udp_pool.push(socket);
                self.counters.nat_table_full += 1;
                logger::warn("flow table full, dropping datagram");
                return AdmitVerdict::Drop;
            }
        };
        self.stats.total_connections += 1;
        self.stats.active_connections += 1;

        let udp_socket = self.sockets.get_mut::<UdpSocket>(socket);
        let endpoint = IpListenEndpoint {
            addr: Some(ip_to_smolt(key.dst_ip)),
            port: key.dst_port,
        };
        let _ = udp_socket.bind(endpoint);
        self.runtime_flows.insert(id, RuntimeFlow::new(Some(socket)));
        if let Some(entry) = self.nat.get_mut(id) {
            entry.set_decision(decision.clone());
        }
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!(
                "UDP flow {}:{} -> {}:{} admitted (flow {})",
                key.src_ip, key.src_port, key.dst_ip, key.dst_port, id
            ),
        );
        self.dispatch_upstream(id, decision.action, tracked);
        AdmitVerdict::Forward
    }

    fn dispatch_upstream(&mut self, id: FlowId, action: RouteAction, host: Option<String>) {
        let Some(entry) = self.nat.get_mut(id) else {
            return;
        };
        let key = entry.key;
        entry.state = FlowState::Connecting;
        let handle = match key.kind {
            FlowKind::Tcp => {
                let dial = match action {
                    RouteAction::Direct => {
                        self.stats.direct += 1;
                        TcpDial::Direct(SocketAddr::new(key.dst_ip, key.dst_port))
                    }
                    RouteAction::Proxy => {
                        self.stats.proxied += 1;
                        TcpDial::Proxy {
                            config: self.proxy.config().clone(),
                            target: Socks5Target {
                                addr: host
                                    .map(TargetAddr::Domain)
                                    .unwrap_or(TargetAddr::Ip(key.dst_ip)),
                                port: key.dst_port,
                            },
                        }
                    }
                    RouteAction::Reject => return,
                };
                upstream::spawn_tcp(
                    &self.runtime,
                    id,
                    dial,
                    self.events_tx.clone(),
                    self.config.handshake_timeout,
                )
            }
            FlowKind::Udp => {
                if action == RouteAction::Proxy {
                    // UDP over SOCKS5 is not spoken in v1.
                    self.counters.udp_proxy_fallback += 1;
                    logger::warn(format!(
                        "UDP flow to {}:{} matched PROXY, falling back to direct",
                        key.dst_ip, key.dst_port
                    ));
                }
                self.stats.direct += 1;
                upstream::spawn_udp(
                    &self.runtime,
                    id,
                    SocketAddr::new(key.dst_ip, key.dst_port),
                    self.events_tx.clone(),
                )
            }
        };
        if let Some(flow) = self.runtime_flows.get_mut(&id) {
            flow.upstream = Some(handle);
        }
    }

    /// Advance the engine by one tick: apply upstream completions, run the
    /// stack, resolve deferred classifications, move payloads both ways, and
    /// reclaim finished flows.
    pub fn poll(&mut self, timestamp: Instant, now: StdInstant) -> bool {
        let mut did_work = self.drain_upstream_events(now);
        if self
            .interface
            .poll(timestamp, &mut self.device, &mut self.sockets)
        {
            did_work = true;
        }
        self.resolve_pending_classifications(now);
        self.flush_staged(now);
        self.drain_stack_sockets(now);
        self.finalize_flows(now);
        if self
            .interface
            .poll(timestamp, &mut self.device, &mut self.sockets)
        {
            did_work = true;
        }
        for id in self.nat.evict_expired(now, self.config.closed_linger) {
            self.runtime_flows.remove(&id);
        }
        did_work
    }

    fn drain_upstream_events(&mut self, now: StdInstant) -> bool {
        let mut did_work = false;
        while let Ok(event) = self.events_rx.try_recv() {
            did_work = true;
            match event {
                UpstreamEvent::Connected(id) => {
                    if let Some(entry) = self.nat.get_mut(id) {
                        if entry.state == FlowState::Connecting {
                            entry.state = FlowState::Established;
                            entry.touch(now);
                            logger::breadcrumb(
                                BreadcrumbFlags::FLOW,
                                format!("flow {id} established"),
                            );
                        }
                    }
                }
                UpstreamEvent::ConnectFailed(id, reason) => {
                    self.counters.upstream_errors += 1;
                    logger::warn(format!("flow {id} dial failed: {reason}"));
                    self.abort_flow(id, now, &reason);
                }
                UpstreamEvent::Data(id, payload) => {
                    self.deliver_upstream_payload(id, payload, now);
                }
                UpstreamEvent::PeerClosed(id) => {
                    self.on_upstream_closed(id, now);
                }
                UpstreamEvent::Error(id, reason) => {
                    self.counters.upstream_errors += 1;
                    logger::warn(format!("flow {id} upstream error: {reason}"));
                    self.abort_flow(id, now, &reason);
                }
            }
        }
        did_work
    }

    fn deliver_upstream_payload(&mut self, id: FlowId, payload: Vec<u8>, now: StdInstant) {
        let Some(entry) = self.nat.get_mut(id) else {
            return;
        };
        if !entry.is_live() {
            return;
        }
        entry.bytes_in = entry.bytes_in.saturating_add(payload.len() as u64);
        entry.touch(now);
        self.stats.bytes_received = self.stats.bytes_received.saturating_add(payload.len() as u64);
        let key = entry.key;
        match key.kind {
            FlowKind::Udp => {
                if key.dst_port == 53 || key.src_port == 53 {
                    self.observe_dns_response(&payload);
                }
                if let Some(packet) = packet_builder::build_udp_response(&key, &payload) {
                    self.handle.push_tx(packet);
                }
            }
            FlowKind::Tcp => {
                let mut failed = false;
                if let Some(flow) = self.runtime_flows.get_mut(&id) {
                    if let Some(socket_handle) = flow.socket {
                        if !flow.staged.is_empty() {
                            // Preserve ordering behind already-staged bytes.
                            failed = !stage_payload(flow, &payload);
                        } else {
                            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                            match socket.send_slice(&payload) {
                                Ok(written) if written == payload.len() => {}
                                Ok(written) => {
                                    failed = !stage_payload(flow, &payload[written..]);
                                }
                                Err(TcpSendError::InvalidState) => failed = true,
                            }
                        }
                    }
                }
                if failed {
                    self.abort_flow(id, now, "client-side buffer overrun");
                }
            }
        }
    }

    fn observe_dns_response(&mut self, payload: &[u8]) {
        for observation in dns::parse_response(payload) {
            self.proxy.hosts().observe(
                &observation.host,
                &observation.addresses,
                observation.ttl,
            );
        }
    }

    fn on_upstream_closed(&mut self, id: FlowId, now: StdInstant) {
        let Some(entry) = self.nat.get_mut(id) else {
            return;
        };
        match entry.key.kind {
            FlowKind::Udp => self.close_flow(id, now, "upstream closed"),
            FlowKind::Tcp => {
                if entry.state == FlowState::Established {
                    entry.state = FlowState::Closing;
                }
                if let Some(flow) = self.runtime_flows.get_mut(&id) {
                    if let Some(socket_handle) = flow.socket {
                        // FIN toward the client; teardown completes once the
                        // stack socket reaches a terminal state.
                        let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                        socket.close();
                    }
                }
            }
        }
    }

    fn resolve_pending_classifications(&mut self, now: StdInstant) {
        let pending: smallvec::SmallVec<[FlowId; 16]> = self
            .nat
            .ids()
            .into_iter()
            .filter(|id| {
                self.nat
                    .get(*id)
                    .map(|entry| entry.state == FlowState::New && entry.key.kind == FlowKind::Tcp)
                    .unwrap_or(false)
            })
            .collect();

        for id in pending {
            let Some((deadline, socket_handle)) = self
                .runtime_flows
                .get(&id)
                .and_then(|flow| Some((flow.sniff_deadline?, flow.socket?)))
            else {
                continue;
            };
            let outcome = {
                let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                if socket.can_recv() {
                    match socket.peek(SNIFF_PEEK_BYTES) {
                        Ok(buffer) if !buffer.is_empty() => Some(sniff::sniff_host(buffer)),
                        _ => None,
                    }
                } else {
                    None
                }
            };
            let sniffed = match outcome {
                Some(sniff::SniffOutcome::Found(host)) => Some(Some(host)),
                Some(sniff::SniffOutcome::NotApplicable) => Some(None),
                Some(sniff::SniffOutcome::NeedMore) | None => {
                    if now >= deadline {
                        self.counters.sniff_timeouts += 1;
                        Some(None)
                    } else {
                        None
                    }
                }
            };
            let Some(sniffed) = sniffed else {
                continue;
            };
            let Some(key) = self.nat.get(id).map(|entry| entry.key) else {
                continue;
            };
            // The tracker may have learned the name while we waited.
            let host = sniffed.or_else(|| self.proxy.hosts().host_for_ip(&key.dst_ip));
            let decision = self.proxy.evaluate_route(
                host.as_deref(),
                Some(key.dst_ip),
                key.dst_port,
                FlowKind::Tcp,
            );
            if let Some(entry) = self.nat.get_mut(id) {
                entry.set_decision(decision.clone());
            }
            if let Some(flow) = self.runtime_flows.get_mut(&id) {
                flow.sniff_deadline = None;
            }
            match decision.action {
                RouteAction::Reject => {
                    self.stats.rejected += 1;
                    let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                    socket.abort();
                    self.close_flow(id, now, "rejected by rule");
                }
                action => self.dispatch_upstream(id, action, host),
            }
        }
    }

    fn flush_staged(&mut self, now: StdInstant) {
        let ids: smallvec::SmallVec<[FlowId; 16]> = self
            .runtime_flows
            .iter()
            .filter(|(_, flow)| !flow.staged.is_empty() && flow.socket.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            let Some(flow) = self.runtime_flows.get_mut(&id) else {
                continue;
            };
            let Some(socket_handle) = flow.socket else {
                continue;
            };
            let mut failed = false;
            while let Some(front) = flow.staged.front_mut() {
                let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                if !socket.can_send() {
                    break;
                }
                match socket.send_slice(front) {
                    Ok(written) if written == front.len() => {
                        flow.staged_bytes -= written;
                        flow.staged.pop_front();
                    }
                    Ok(written) => {
                        front.drain(..written);
                        flow.staged_bytes -= written;
                        break;
                    }
                    Err(TcpSendError::InvalidState) => {
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                self.abort_flow(id, now, "client socket went away");
            }
        }
    }

    fn drain_stack_sockets(&mut self, now: StdInstant) {
        for id in self.nat.ids() {
            let Some(entry) = self.nat.get_mut(id) else {
                continue;
            };
            if entry.state != FlowState::Established && entry.state != FlowState::Closing {
                continue;
            }
            let kind = entry.key.kind;
            let Some(flow) = self.runtime_flows.get_mut(&id) else {
                continue;
            };
            let Some(socket_handle) = flow.socket else {
                continue;
            };
            let mut moved: u64 = 0;
            match kind {
                FlowKind::Tcp => {
                    if let Some(sender) =
                        flow.upstream.as_ref().and_then(|up| up.sender.as_ref())
                    {
                        loop {
                            let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                            if !socket.can_recv() {
                                break;
                            }
                            // Reserve channel capacity first: a full channel
                            // leaves the bytes in the socket and the window
                            // closes on its own.
                            let Ok(permit) = sender.try_reserve() else {
                                break;
                            };
                            let mut chunk = Vec::new();
                            let recv_result = socket.recv(|buffer| {
                                chunk.extend_from_slice(buffer);
                                (buffer.len(), ())
                            });
                            if recv_result.is_err() || chunk.is_empty() {
                                break;
                            }
                            moved += chunk.len() as u64;
                            permit.send(chunk);
                        }
                    }
                    // Client half-closed and everything is drained: signal
                    // EOF upstream exactly once.
                    let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                    if socket.state() == TcpState::CloseWait
                        && !socket.can_recv()
                        && !flow.upstream_eof
                    {
                        flow.upstream_eof = true;
                        if let Some(up) = flow.upstream.as_mut() {
                            up.close_input();
                        }
                        entry.state = FlowState::Closing;
                    }
                }
                FlowKind::Udp => {
                    if let Some(sender) =
                        flow.upstream.as_ref().and_then(|up| up.sender.as_ref())
                    {
                        loop {
                            let socket = self.sockets.get_mut::<UdpSocket>(socket_handle);
                            let Ok((payload, _meta)) = socket.recv() else {
                                break;
                            };
                            let bytes = payload.to_vec();
                            moved += bytes.len() as u64;
                            // UDP may shed load when the channel is full.
                            if sender.try_send(bytes).is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            if moved > 0 {
                entry.bytes_out = entry.bytes_out.saturating_add(moved);
                entry.touch(now);
                self.stats.bytes_sent = self.stats.bytes_sent.saturating_add(moved);
            }
        }
    }

    fn finalize_flows(&mut self, now: StdInstant) {
        for id in self.nat.ids() {
            let Some(entry) = self.nat.get(id) else {
                continue;
            };
            if !entry.is_live() {
                continue;
            }
            match entry.key.kind {
                FlowKind::Tcp => {
                    if entry.state == FlowState::New {
                        continue;
                    }
                    let Some(socket_handle) =
                        self.runtime_flows.get(&id).and_then(|flow| flow.socket)
                    else {
                        continue;
                    };
                    let socket_state = self.sockets.get::<TcpSocket>(socket_handle).state();
                    if matches!(socket_state, TcpState::Closed | TcpState::TimeWait) {
                        self.close_flow(id, now, "tcp closed");
                    }
                }
                FlowKind::Udp => {
                    let idle = now.duration_since(entry.last_activity_at);
                    if idle >= self.config.udp_idle_timeout {
                        self.close_flow(id, now, "udp idle timeout");
                    }
                }
            }
        }
    }

    /// Upstream failure path: RST toward the client, then tear down.
    fn abort_flow(&mut self, id: FlowId, now: StdInstant, reason: &str) {
        if let Some(flow) = self.runtime_flows.get_mut(&id) {
            if let Some(socket_handle) = flow.socket {
                if self
                    .nat
                    .get(id)
                    .map(|entry| entry.key.kind == FlowKind::Tcp)
                    .unwrap_or(false)
                {
                    let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                    socket.abort();
                }
            }
        }
        self.close_flow(id, now, reason);
    }

    fn close_flow(&mut self, id: FlowId, now: StdInstant, reason: &str) {
        let was_live = self
            .nat
            .get(id)
            .map(|entry| entry.is_live())
            .unwrap_or(false);
        if was_live {
            self.stats.active_connections = self.stats.active_connections.saturating_sub(1);
        }
        self.release_runtime(id);
        self.nat.mark_closed(id, now);
        logger::breadcrumb(
            BreadcrumbFlags::FLOW,
            format!("flow {id} closed ({reason})"),
        );
    }

    fn release_runtime(&mut self, id: FlowId) {
        let Some(mut flow) = self.runtime_flows.remove(&id) else {
            return;
        };
        if let Some(upstream) = flow.upstream.take() {
            upstream.abort();
        }
        let Some(socket_handle) = flow.socket.take() else {
            return;
        };
        match self.nat.get(id).map(|entry| entry.key.kind) {
            Some(FlowKind::Udp) => {
                let socket = self.sockets.get_mut::<UdpSocket>(socket_handle);
                socket.close();
                self.udp_pool.push(socket_handle);
            }
            _ => {
                let socket = self.sockets.get_mut::<TcpSocket>(socket_handle);
                socket.abort();
                self.tcp_pool.push(socket_handle);
            }
        }
    }

    /// Drop every flow: RSTs for live TCP flows are emitted into tx, all
    /// upstream I/O is cancelled, queues and stats reset.
    pub fn shutdown(&mut self, timestamp: Instant, now: StdInstant) {
        for id in self.nat.ids() {
            let live = self
                .nat
                .get(id)
                .map(|entry| entry.is_live())
                .unwrap_or(false);
            if live {
                self.abort_flow(id, now, "engine shutdown");
            } else {
                self.release_runtime(id);
            }
        }
        // Emit the pending RST segments before the table goes away.
        self.interface
            .poll(timestamp, &mut self.device, &mut self.sockets);
        self.nat.clear();
        self.runtime_flows.clear();
        self.stats = ProxyStats::default();
        self.handle.clear_rx();
    }
}

fn ip_to_smolt(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from_bytes(&v4.octets())),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from_bytes(&v6.octets())),
    }
}

#[cfg(test)]
mod tests;
