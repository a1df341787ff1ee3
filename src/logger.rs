//! Leveled logging and breadcrumb tracing routed to a host-installed sink.
//! Without a sink every call is a cheap no-op; the engine never writes to
//! stdout or files on its own.

use crate::ffi::CoreLogSink;
use bitflags::bitflags;
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::ffi::{c_void, CString};
use std::os::raw::c_char;

bitflags! {
    /// Trace channels the host can enable individually. Ordinary log calls
    /// carry no channel and are filtered by level instead.
    #[derive(Clone, Copy, Debug)]
    pub struct BreadcrumbFlags: u32 {
        const DEVICE = 1 << 0;
        const FLOW   = 1 << 1;
        const RULE   = 1 << 2;
        const SOCKS  = 1 << 3;
        const FFI    = 1 << 4;
        const POLL   = 1 << 5;
        const ALL    = u32::MAX;
    }
}

impl BreadcrumbFlags {
    fn tag(self) -> &'static str {
        const TAGS: &[(BreadcrumbFlags, &str)] = &[
            (BreadcrumbFlags::DEVICE, "device"),
            (BreadcrumbFlags::FLOW, "flow"),
            (BreadcrumbFlags::RULE, "rule"),
            (BreadcrumbFlags::SOCKS, "socks"),
            (BreadcrumbFlags::FFI, "ffi"),
            (BreadcrumbFlags::POLL, "poll"),
        ];
        TAGS.iter()
            .find(|(flag, _)| self.intersects(*flag))
            .map(|(_, tag)| *tag)
            .unwrap_or("trace")
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn parse(text: &str) -> Self {
        match text.to_ascii_lowercase().as_str() {
            "error" | "err" => LogLevel::Error,
            "warn" | "warning" => LogLevel::Warn,
            "debug" | "dbg" => LogLevel::Debug,
            _ => LogLevel::Info,
        }
    }

    fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }
}

type SinkFn = unsafe extern "C" fn(
    level: *const c_char,
    message: *const c_char,
    breadcrumbs: u32,
    context: *mut c_void,
);

struct HostSink {
    callback: SinkFn,
    context: *mut c_void,
    min_level: LogLevel,
    channels: BreadcrumbFlags,
}

unsafe impl Send for HostSink {}
unsafe impl Sync for HostSink {}

static SINK: Lazy<RwLock<Option<HostSink>>> = Lazy::new(|| RwLock::new(None));

pub fn error(message: impl Into<String>) {
    emit(LogLevel::Error, None, message.into());
}

pub fn warn(message: impl Into<String>) {
    emit(LogLevel::Warn, None, message.into());
}

pub fn info(message: impl Into<String>) {
    emit(LogLevel::Info, None, message.into());
}

pub fn breadcrumb(channel: BreadcrumbFlags, message: impl Into<String>) {
    if channel.is_empty() {
        return;
    }
    emit(LogLevel::Debug, Some(channel), message.into());
}

/// Install (or with `None`, remove) the host sink. `level` gates ordinary
/// log calls; breadcrumbs are gated purely by the channel mask.
pub fn install_sink(sink: Option<&CoreLogSink>, level: Option<&str>) -> Result<(), &'static str> {
    let mut slot = SINK.write();
    let Some(sink) = sink else {
        *slot = None;
        return Ok(());
    };
    let Some(callback) = sink.log else {
        return Err("log callback missing");
    };
    *slot = Some(HostSink {
        callback,
        context: sink.context,
        min_level: level.map(LogLevel::parse).unwrap_or(LogLevel::Info),
        channels: BreadcrumbFlags::from_bits_truncate(sink.enabled_breadcrumbs),
    });
    Ok(())
}

pub fn set_breadcrumb_mask(mask: u32) {
    if let Some(sink) = SINK.write().as_mut() {
        sink.channels = BreadcrumbFlags::from_bits_truncate(mask);
    }
}

fn emit(level: LogLevel, channel: Option<BreadcrumbFlags>, message: String) {
    if message.is_empty() {
        return;
    }
    // Copy the callback out so the sink lock is not held while the host runs.
    let (callback, context, line) = {
        let guard = SINK.read();
        let Some(sink) = guard.as_ref() else {
            return;
        };
        match channel {
            Some(flags) if !sink.channels.intersects(flags) => return,
            None if level > sink.min_level => return,
            _ => {}
        }
        let line = match channel {
            Some(flags) => format!("tunnel-core/{}: {}", flags.tag(), message),
            None => format!("tunnel-core: {message}"),
        };
        (sink.callback, sink.context, line)
    };
    let Ok(level_tag) = CString::new(level.label()) else {
        return;
    };
    let Ok(line) = CString::new(line) else {
        return;
    };
    unsafe {
        (callback)(
            level_tag.as_ptr(),
            line.as_ptr(),
            channel.map(|flags| flags.bits()).unwrap_or(0),
            context,
        );
    }
}
