//! Boundary shim: the process-wide engine singleton behind one mutex. The
//! host's tunnel-read thread, poll thread, and control plane all enter here;
//! the lock is held for the duration of each call and never across an await.

use crate::config::CoreConfig;
use crate::device::{parse_packet, DeviceHandle, MAX_BATCH};
use crate::error::CoreError;
use crate::flow::{AdmitVerdict, FlowKind, FlowManager};
use crate::logger::{self, BreadcrumbFlags};
use crate::proxy::ProxyManager;
use crate::rules::RouteAction;
use crate::stats::{ProxyStats, WarnCounters};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use serde::Serialize;
use smoltcp::time::Instant as SmoltInstant;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::runtime::Runtime;

pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

static ENGINE: Lazy<Mutex<Option<Engine>>> = Lazy::new(|| Mutex::new(None));

struct Engine {
    /// Keeps the single-worker upstream I/O executor alive.
    _runtime: Runtime,
    flows: FlowManager,
    proxy: Arc<ProxyManager>,
    device: DeviceHandle,
    epoch: StdInstant,
    rule_source: String,
}

impl Engine {
    fn new(config: CoreConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .map_err(|error| CoreError::Io(error.to_string()))?;
        let proxy = ProxyManager::new(config.proxy.clone());
        let flows = FlowManager::new(config, Arc::clone(&proxy), runtime.handle().clone());
        let device = flows.device_handle();
        logger::breadcrumb(BreadcrumbFlags::FFI, "engine constructed".to_string());
        Ok(Self {
            _runtime: runtime,
            flows,
            proxy,
            device,
            epoch: StdInstant::now(),
            rule_source: String::new(),
        })
    }

    fn timestamp(&self) -> SmoltInstant {
        let millis = self.epoch.elapsed().as_millis().min(i64::MAX as u128) as i64;
        SmoltInstant::from_millis(millis)
    }

    fn tick(&mut self) {
        let timestamp = self.timestamp();
        self.flows.poll(timestamp, StdInstant::now());
    }
}

fn with_engine<T>(f: impl FnOnce(&mut Engine) -> Result<T, CoreError>) -> Result<T, CoreError> {
    let mut guard = ENGINE.lock();
    let engine = guard.as_mut().ok_or(CoreError::NotInitialized)?;
    f(engine)
}

/// Bring the engine up. Exactly one live instance per process; a second
/// init fails with `AlreadyInitialized` until `shutdown_core` runs.
pub fn init_core(config: CoreConfig) -> Result<(), CoreError> {
    let mut guard = ENGINE.lock();
    if guard.is_some() {
        return Err(CoreError::AlreadyInitialized);
    }
    *guard = Some(Engine::new(config)?);
    logger::info("engine initialized");
    Ok(())
}

/// Tear the engine down: every flow is dropped (RST for TCP), upstream I/O
/// cancelled, queues emptied, stats reset.
pub fn shutdown_core() -> Result<(), CoreError> {
    let mut engine = {
        let mut guard = ENGINE.lock();
        guard.take().ok_or(CoreError::NotInitialized)?
    };
    let timestamp = engine.timestamp();
    engine.flows.shutdown(timestamp, StdInstant::now());
    logger::info("engine shut down");
    // Engine (and its runtime) dropped outside the singleton lock.
    drop(engine);
    Ok(())
}

pub fn is_initialized() -> bool {
    ENGINE.lock().is_some()
}

pub fn core_version() -> &'static str {
    CORE_VERSION
}

/// Funnel for datagrams read from the tunnel device. Returns whatever the
/// stack can emit immediately.
pub fn process_inbound_packet(bytes: &[u8]) -> Result<Vec<Vec<u8>>, CoreError> {
    with_engine(|engine| {
        let now = StdInstant::now();
        let parsed = match parse_packet(bytes) {
            Ok(parsed) => parsed,
            Err(error) => {
                engine.flows.note_invalid_packet();
                return Err(error);
            }
        };
        if engine.flows.admit(&parsed, now) == AdmitVerdict::Forward {
            engine.device.push_rx(bytes);
        }
        let timestamp = engine.timestamp();
        engine.flows.poll(timestamp, now);
        Ok(engine.device.pop_tx_batch(MAX_BATCH))
    })
}

/// Funnel for datagrams headed back to the platform, used when the host has
/// return-path packets of its own to inject.
pub fn process_outbound_packet(bytes: &[u8]) -> Result<Vec<Vec<u8>>, CoreError> {
    with_engine(|engine| {
        if let Err(error) = parse_packet(bytes) {
            engine.flows.note_invalid_packet();
            return Err(error);
        }
        engine.device.push_tx(bytes.to_vec());
        Ok(engine.device.pop_tx_batch(MAX_BATCH))
    })
}

/// One poll tick. The host calls this at ≥ 20 Hz; all engine timers are
/// derived from it.
pub fn poll_core() -> Result<(), CoreError> {
    with_engine(|engine| {
        engine.tick();
        Ok(())
    })
}

pub fn get_outbound_packets() -> Result<Vec<Vec<u8>>, CoreError> {
    with_engine(|engine| Ok(engine.device.pop_tx_batch(MAX_BATCH)))
}

/// Replace the rule table. Returns the count of accepted rules; per-line
/// problems are logged and counted, never fatal.
pub fn load_rules(text: &str) -> Result<usize, CoreError> {
    with_engine(|engine| {
        let outcome = engine.proxy.load_rules(text);
        engine
            .flows
            .note_rule_warnings((outcome.warnings.len() + outcome.unknown_skipped) as u64);
        engine.rule_source = text.to_string();
        Ok(outcome.accepted)
    })
}

pub fn evaluate_route(
    domain: Option<&str>,
    ip: Option<IpAddr>,
    port: Option<u16>,
    proto: Option<FlowKind>,
) -> Result<RouteAction, CoreError> {
    with_engine(|engine| {
        Ok(engine
            .proxy
            .evaluate_route(
                domain,
                ip,
                port.unwrap_or(0),
                proto.unwrap_or(FlowKind::Tcp),
            )
            .action)
    })
}

pub fn get_stats() -> Result<ProxyStats, CoreError> {
    with_engine(|engine| Ok(engine.flows.stats()))
}

pub fn get_counters() -> Result<WarnCounters, CoreError> {
    with_engine(|engine| Ok(engine.flows.counters()))
}

/// Inject a GeoIP database adapter; without one, GEOIP rules never match.
pub fn install_geoip(resolver: Arc<dyn crate::rules::GeoIpResolver>) -> Result<(), CoreError> {
    with_engine(|engine| {
        engine.proxy.install_geoip(resolver);
        Ok(())
    })
}

pub fn enable_proxy() -> Result<(), CoreError> {
    with_engine(|engine| {
        engine.proxy.set_enabled(true);
        Ok(())
    })
}

pub fn disable_proxy() -> Result<(), CoreError> {
    with_engine(|engine| {
        engine.proxy.set_enabled(false);
        Ok(())
    })
}

#[derive(Serialize)]
struct StatsSnapshot {
    stats: ProxyStats,
    counters: WarnCounters,
}

/// Text control channel for hosts that embed the engine behind a pipe:
/// `getStats`, `getVersion`, `reloadRules`, `route:<target>`.
pub fn handle_control_message(message: &str) -> Result<String, CoreError> {
    with_engine(|engine| {
        let trimmed = message.trim();
        match trimmed {
            "getStats" => {
                let snapshot = StatsSnapshot {
                    stats: engine.flows.stats(),
                    counters: engine.flows.counters(),
                };
                serde_json::to_string(&snapshot).map_err(|error| CoreError::Io(error.to_string()))
            }
            "getVersion" => Ok(CORE_VERSION.to_string()),
            "reloadRules" => {
                let source = engine.rule_source.clone();
                let outcome = engine.proxy.load_rules(&source);
                engine
                    .flows
                    .note_rule_warnings(outcome.warnings.len() as u64);
                Ok(format!("reloaded {} rules", outcome.accepted))
            }
            other => match other.strip_prefix("route:") {
                Some(target) => {
                    let (domain, ip, port) = parse_route_target(target);
                    let action = engine
                        .proxy
                        .evaluate_route(domain.as_deref(), ip, port, FlowKind::Tcp)
                        .action;
                    Ok(action.as_str().to_string())
                }
                None => Ok(format!("error: unknown command '{other}'")),
            },
        }
    })
}

/// `<host>`, `<host>:<port>`, `<ip>`, or `<ip>:<port>`.
fn parse_route_target(target: &str) -> (Option<String>, Option<IpAddr>, u16) {
    let target = target.trim();
    if let Ok(ip) = target.parse::<IpAddr>() {
        return (None, Some(ip), 0);
    }
    let (host, port) = match target.rsplit_once(':') {
        Some((host, port_text)) => match port_text.parse::<u16>() {
            Ok(port) => (host, port),
            Err(_) => (target, 0),
        },
        None => (target, 0),
    };
    if let Ok(ip) = host.parse::<IpAddr>() {
        return (None, Some(ip), port);
    }
    if host.is_empty() {
        (None, None, port)
    } else {
        (Some(host.to_string()), None, port)
    }
}
