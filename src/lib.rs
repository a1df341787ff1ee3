#![deny(unsafe_op_in_unsafe_fn)]

//! Userspace network engine for a per-device packet-interception proxy.
//! The host pushes raw IP datagrams in, the engine terminates transport
//! flows against a userspace TCP/IP stack, classifies them against a rule
//! table, and relays them either directly or through a SOCKS5 upstream.

pub mod bridge;
mod config;
mod device;
mod dns;
mod error;
pub mod ffi;
mod flow;
mod logger;
mod proxy;
mod rules;
mod socks5;
mod stats;

pub use crate::config::{CoreConfig, ProxyAuth, ProxyConfig};
pub use crate::error::CoreError;
pub use crate::flow::FlowKind;
pub use crate::rules::{GeoIpResolver, RouteAction};
pub use crate::stats::{ProxyStats, WarnCounters};

use crate::ffi::{CoreFfiConfig, CoreLogSink, CorePacketBuffer, CoreStatsFfi};
use std::ffi::{CStr, CString};
use std::net::IpAddr;
use std::os::raw::c_char;
use std::ptr::NonNull;
use std::slice;

fn error_code(error: &CoreError) -> i32 {
    match error {
        CoreError::NotInitialized => -1,
        CoreError::AlreadyInitialized => -2,
        CoreError::InvalidConfig(_) => -3,
        CoreError::InvalidPacket(_) => -4,
        CoreError::NatTableFull => -5,
        CoreError::ConnectionFailed(_) => -6,
        CoreError::RuleParse { .. } => -7,
        CoreError::Io(_) => -8,
    }
}

fn report<T>(result: Result<T, CoreError>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(error) => {
            logger::warn(format!("boundary call failed: {error}"));
            error_code(&error)
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn CoreInit(config: *const CoreFfiConfig) -> i32 {
    let Some(config) = NonNull::new(config as *mut CoreFfiConfig) else {
        return error_code(&CoreError::InvalidConfig("null config".to_string()));
    };
    let config = match unsafe { config.as_ref().to_config() } {
        Ok(config) => config,
        Err(error) => return error_code(&error),
    };
    report(bridge::init_core(config))
}

#[no_mangle]
pub extern "C" fn CoreShutdown() -> i32 {
    report(bridge::shutdown_core())
}

#[no_mangle]
pub extern "C" fn CoreIsInitialized() -> bool {
    bridge::is_initialized()
}

#[no_mangle]
pub extern "C" fn CoreVersion() -> *const c_char {
    const VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "\0");
    VERSION.as_ptr() as *const c_char
}

unsafe fn packet_funnel(
    packet: *const u8,
    length: usize,
    out: *mut CorePacketBuffer,
    funnel: fn(&[u8]) -> Result<Vec<Vec<u8>>, CoreError>,
) -> i32 {
    if packet.is_null() || length == 0 {
        return error_code(&CoreError::InvalidPacket("null packet"));
    }
    // Safety: caller guarantees `packet` points to `length` readable bytes.
    let bytes = unsafe { slice::from_raw_parts(packet, length) };
    match funnel(bytes) {
        Ok(responses) => {
            if let Some(out) = unsafe { out.as_mut() } {
                out.populate(responses);
            }
            0
        }
        Err(error) => error_code(&error),
    }
}

#[no_mangle]
pub unsafe extern "C" fn CoreProcessInbound(
    packet: *const u8,
    length: usize,
    out: *mut CorePacketBuffer,
) -> i32 {
    unsafe { packet_funnel(packet, length, out, bridge::process_inbound_packet) }
}

#[no_mangle]
pub unsafe extern "C" fn CoreProcessOutbound(
    packet: *const u8,
    length: usize,
    out: *mut CorePacketBuffer,
) -> i32 {
    unsafe { packet_funnel(packet, length, out, bridge::process_outbound_packet) }
}

#[no_mangle]
pub extern "C" fn CorePoll() -> i32 {
    report(bridge::poll_core())
}

#[no_mangle]
pub unsafe extern "C" fn CoreDrainOutbound(out: *mut CorePacketBuffer) -> i32 {
    match bridge::get_outbound_packets() {
        Ok(packets) => {
            if let Some(out) = unsafe { out.as_mut() } {
                out.populate(packets);
            }
            0
        }
        Err(error) => error_code(&error),
    }
}

#[no_mangle]
pub unsafe extern "C" fn CorePacketBufferFree(buffer: *mut CorePacketBuffer) {
    if let Some(buffer) = unsafe { buffer.as_mut() } {
        buffer.reset();
    }
}

#[no_mangle]
pub unsafe extern "C" fn CoreLoadRules(text: *const c_char, accepted: *mut usize) -> i32 {
    if text.is_null() {
        return error_code(&CoreError::InvalidConfig("null rule text".to_string()));
    }
    let text = match unsafe { CStr::from_ptr(text) }.to_str() {
        Ok(text) => text,
        Err(_) => return error_code(&CoreError::InvalidConfig("rule text not UTF-8".to_string())),
    };
    match bridge::load_rules(text) {
        Ok(count) => {
            if let Some(accepted) = unsafe { accepted.as_mut() } {
                *accepted = count;
            }
            0
        }
        Err(error) => error_code(&error),
    }
}

/// `proto`: 6 = TCP, 17 = UDP, 0 = unspecified. `action_out` receives
/// 0 = DIRECT, 1 = PROXY, 2 = REJECT.
#[no_mangle]
pub unsafe extern "C" fn CoreEvaluateRoute(
    domain: *const c_char,
    ip: *const c_char,
    port: u16,
    proto: u8,
    action_out: *mut u8,
) -> i32 {
    let domain = if domain.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(domain) }.to_str().ok()
    };
    let ip = if ip.is_null() {
        None
    } else {
        unsafe { CStr::from_ptr(ip) }
            .to_str()
            .ok()
            .and_then(|text| text.parse::<IpAddr>().ok())
    };
    let proto = match proto {
        17 => Some(FlowKind::Udp),
        6 => Some(FlowKind::Tcp),
        _ => None,
    };
    match bridge::evaluate_route(domain, ip, Some(port), proto) {
        Ok(action) => {
            if let Some(action_out) = unsafe { action_out.as_mut() } {
                *action_out = match action {
                    RouteAction::Direct => 0,
                    RouteAction::Proxy => 1,
                    RouteAction::Reject => 2,
                };
            }
            0
        }
        Err(error) => error_code(&error),
    }
}

#[no_mangle]
pub unsafe extern "C" fn CoreGetStats(out: *mut CoreStatsFfi) -> i32 {
    let Some(out) = (unsafe { out.as_mut() }) else {
        return error_code(&CoreError::InvalidConfig("null stats out".to_string()));
    };
    let stats = match bridge::get_stats() {
        Ok(stats) => stats,
        Err(error) => return error_code(&error),
    };
    let counters = match bridge::get_counters() {
        Ok(counters) => counters,
        Err(error) => return error_code(&error),
    };
    *out = CoreStatsFfi::from_parts(stats, counters);
    0
}

#[no_mangle]
pub extern "C" fn CoreSetProxyEnabled(enabled: bool) -> i32 {
    report(if enabled {
        bridge::enable_proxy()
    } else {
        bridge::disable_proxy()
    })
}

#[no_mangle]
pub unsafe extern "C" fn CoreHandleControl(
    message: *const c_char,
    response: *mut *mut c_char,
) -> i32 {
    if message.is_null() {
        return error_code(&CoreError::InvalidConfig("null control message".to_string()));
    }
    let message = match unsafe { CStr::from_ptr(message) }.to_str() {
        Ok(message) => message,
        Err(_) => {
            return error_code(&CoreError::InvalidConfig(
                "control message not UTF-8".to_string(),
            ))
        }
    };
    match bridge::handle_control_message(message) {
        Ok(reply) => {
            if let Some(response) = unsafe { response.as_mut() } {
                *response = CString::new(reply)
                    .map(CString::into_raw)
                    .unwrap_or(std::ptr::null_mut());
            }
            0
        }
        Err(error) => error_code(&error),
    }
}

#[no_mangle]
pub unsafe extern "C" fn CoreStringFree(string: *mut c_char) {
    if !string.is_null() {
        unsafe {
            drop(CString::from_raw(string));
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn CoreSetLogSink(sink: *const CoreLogSink, level: *const c_char) -> bool {
    let sink_ref = unsafe { sink.as_ref() };
    let level_str = if level.is_null() {
        None
    } else {
        match unsafe { CStr::from_ptr(level) }.to_str() {
            Ok(value) => Some(value),
            Err(_) => None,
        }
    };
    logger::install_sink(sink_ref, level_str).is_ok()
}

#[no_mangle]
pub extern "C" fn CoreSetBreadcrumbMask(mask: u32) {
    logger::set_breadcrumb_mask(mask);
}

#[no_mangle]
pub extern "C" fn CoreEnsureLinked() -> bool {
    true
}
