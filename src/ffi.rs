//! repr(C) types shared with the host through `include/core.h`.

use crate::config::{CoreConfig, ProxyAuth, ProxyConfig};
use crate::error::CoreError;
use crate::stats::{ProxyStats, WarnCounters};
use std::ffi::{c_char, c_void, CStr};
use std::ptr;
use std::time::Duration;

/// Mirror of the `CoreConfig` struct in `include/core.h`. Strings are
/// borrowed for the duration of the `CoreInit` call. Zero/null fields fall
/// back to the built-in defaults.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
pub struct CoreFfiConfig {
    pub server_host: *const c_char,
    pub server_port: u16,
    pub username: *const c_char,
    pub password: *const c_char,
    pub mtu: u32,
    pub queue_capacity: u32,
    pub max_connections: u32,
    pub udp_idle_timeout_ms: u32,
    pub closed_linger_ms: u32,
    pub handshake_timeout_ms: u32,
    pub sniff_deadline_ms: u32,
    pub ipv6_enabled: bool,
}

impl CoreFfiConfig {
    /// # Safety
    /// String fields must be null or valid NUL-terminated pointers.
    pub unsafe fn to_config(&self) -> Result<CoreConfig, CoreError> {
        let server_host = unsafe { read_string(self.server_host) }
            .ok_or_else(|| CoreError::InvalidConfig("missing proxy host".to_string()))?;
        let username = unsafe { read_string(self.username) };
        let password = unsafe { read_string(self.password) };
        let auth = match (username, password) {
            (Some(username), Some(password)) => Some(ProxyAuth { username, password }),
            (None, None) => None,
            _ => {
                return Err(CoreError::InvalidConfig(
                    "username and password must be set together".to_string(),
                ))
            }
        };
        let mut config = CoreConfig::new(ProxyConfig {
            server_host,
            server_port: self.server_port,
            auth,
        });
        if self.mtu != 0 {
            config.mtu = self.mtu as usize;
        }
        if self.queue_capacity != 0 {
            config.queue_capacity = self.queue_capacity as usize;
        }
        if self.max_connections != 0 {
            config.max_connections = self.max_connections as usize;
        }
        if self.udp_idle_timeout_ms != 0 {
            config.udp_idle_timeout = Duration::from_millis(self.udp_idle_timeout_ms as u64);
        }
        if self.closed_linger_ms != 0 {
            config.closed_linger = Duration::from_millis(self.closed_linger_ms as u64);
        }
        if self.handshake_timeout_ms != 0 {
            config.handshake_timeout = Duration::from_millis(self.handshake_timeout_ms as u64);
        }
        if self.sniff_deadline_ms != 0 {
            config.sniff_deadline = Duration::from_millis(self.sniff_deadline_ms as u64);
        }
        config.ipv6_enabled = self.ipv6_enabled;
        Ok(config)
    }
}

unsafe fn read_string(pointer: *const c_char) -> Option<String> {
    if pointer.is_null() {
        return None;
    }
    unsafe { CStr::from_ptr(pointer) }
        .to_str()
        .ok()
        .map(str::to_string)
}

/// Out-parameter carrying a batch of packets across the boundary. The host
/// reads `count` entries of `packets`/`sizes` and must hand the buffer back
/// to `CorePacketBufferFree`.
#[repr(C)]
#[derive(Debug)]
pub struct CorePacketBuffer {
    pub packets: *mut *mut u8,
    pub sizes: *mut usize,
    pub count: usize,
    pub storage: *mut c_void,
}

impl Default for CorePacketBuffer {
    fn default() -> Self {
        Self {
            packets: ptr::null_mut(),
            sizes: ptr::null_mut(),
            count: 0,
            storage: ptr::null_mut(),
        }
    }
}

struct PacketStorage {
    // Field order keeps the pointer tables alive as long as the buffers.
    pointers: Vec<*mut u8>,
    sizes: Vec<usize>,
    _buffers: Vec<Vec<u8>>,
}

impl CorePacketBuffer {
    pub fn reset(&mut self) {
        if !self.storage.is_null() {
            unsafe {
                drop(Box::from_raw(self.storage as *mut PacketStorage));
            }
        }
        self.packets = ptr::null_mut();
        self.sizes = ptr::null_mut();
        self.count = 0;
        self.storage = ptr::null_mut();
    }

    pub fn populate(&mut self, packets: Vec<Vec<u8>>) {
        self.reset();
        if packets.is_empty() {
            return;
        }
        let mut buffers = packets;
        let pointers: Vec<*mut u8> = buffers
            .iter_mut()
            .map(|buffer| buffer.as_mut_ptr())
            .collect();
        let sizes: Vec<usize> = buffers.iter().map(Vec::len).collect();
        let mut storage = Box::new(PacketStorage {
            pointers,
            sizes,
            _buffers: buffers,
        });
        self.packets = storage.pointers.as_mut_ptr();
        self.sizes = storage.sizes.as_mut_ptr();
        self.count = storage.sizes.len();
        self.storage = Box::into_raw(storage) as *mut c_void;
    }
}

/// Flat stats snapshot mirroring `ProxyStats` + `WarnCounters`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CoreStatsFfi {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    pub total_connections: u64,
    pub direct: u64,
    pub proxied: u64,
    pub rejected: u64,
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

impl CoreStatsFfi {
    pub fn from_parts(stats: ProxyStats, counters: WarnCounters) -> Self {
        Self {
            bytes_sent: stats.bytes_sent,
            bytes_received: stats.bytes_received,
            active_connections: stats.active_connections,
            total_connections: stats.total_connections,
            direct: stats.direct,
            proxied: stats.proxied,
            rejected: stats.rejected,
            invalid_packets: counters.invalid_packets,
            icmp_dropped: counters.icmp_dropped,
            ipv6_dropped: counters.ipv6_dropped,
            rx_overflow: counters.rx_overflow,
            tx_overflow: counters.tx_overflow,
            nat_table_full: counters.nat_table_full,
            rule_warnings: counters.rule_warnings,
            udp_proxy_fallback: counters.udp_proxy_fallback,
            sniff_timeouts: counters.sniff_timeouts,
            upstream_errors: counters.upstream_errors,
        }
    }
}

/// Host log sink installed through `CoreSetLogSink`.
#[repr(C)]
pub struct CoreLogSink {
    pub log: Option<
        unsafe extern "C" fn(
            level: *const c_char,
            message: *const c_char,
            breadcrumbs: u32,
            context: *mut c_void,
        ),
    >,
    pub context: *mut c_void,
    pub enabled_breadcrumbs: u32,
}
