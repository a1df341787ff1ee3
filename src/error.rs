use thiserror::Error;

/// Tagged error kinds surfaced at the engine boundary.
///
/// Packet-level failures are recovered locally (drop + counter); per-flow
/// failures tear the flow down with a RST and never reach the caller of the
/// packet funnels. Only lifecycle and configuration errors propagate.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("engine not initialized")]
    NotInitialized,
    #[error("engine already initialized")]
    AlreadyInitialized,
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("invalid packet: {0}")]
    InvalidPacket(&'static str),
    #[error("nat table full")]
    NatTableFull,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("rule parse error at line {line}: {detail}")]
    RuleParse { line: usize, detail: String },
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        CoreError::Io(error.to_string())
    }
}
