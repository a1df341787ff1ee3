use crate::error::CoreError;
use std::time::Duration;

pub const DEFAULT_MTU: usize = 1500;
pub const MIN_MTU: usize = 576;
pub const MAX_MTU: usize = 9000;
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_MAX_CONNECTIONS: usize = 100;

/// Username/password pair for the RFC 1929 sub-negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyAuth {
    pub username: String,
    pub password: String,
}

/// Upstream SOCKS5 server settings. Immutable once the engine is running;
/// replacing it requires a shutdown/init cycle.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub server_host: String,
    pub server_port: u16,
    pub auth: Option<ProxyAuth>,
}

/// Engine configuration record, fixed at `init_core` time.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub proxy: ProxyConfig,
    pub mtu: usize,
    /// Capacity of each of the rx/tx packet FIFOs.
    pub queue_capacity: usize,
    /// Upper bound on concurrently tracked flows.
    pub max_connections: usize,
    pub udp_idle_timeout: Duration,
    /// Grace period before a Closed NAT entry is reclaimed.
    pub closed_linger: Duration,
    /// Budget for the complete SOCKS5 handshake.
    pub handshake_timeout: Duration,
    /// How long a TCP flow may wait for a sniffable client payload before
    /// it is classified on IP alone.
    pub sniff_deadline: Duration,
    pub ipv6_enabled: bool,
}

impl CoreConfig {
    pub fn new(proxy: ProxyConfig) -> Self {
        Self {
            proxy,
            mtu: DEFAULT_MTU,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            udp_idle_timeout: Duration::from_secs(60),
            closed_linger: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(10),
            sniff_deadline: Duration::from_secs(2),
            ipv6_enabled: false,
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.proxy.server_host.trim().is_empty() {
            return Err(CoreError::InvalidConfig("empty proxy host".to_string()));
        }
        if self.proxy.server_port == 0 {
            return Err(CoreError::InvalidConfig("proxy port is zero".to_string()));
        }
        if self.mtu < MIN_MTU || self.mtu > MAX_MTU {
            return Err(CoreError::InvalidConfig(format!(
                "mtu {} outside [{MIN_MTU}, {MAX_MTU}]",
                self.mtu
            )));
        }
        if self.queue_capacity == 0 {
            return Err(CoreError::InvalidConfig(
                "queue capacity is zero".to_string(),
            ));
        }
        if self.max_connections == 0 {
            return Err(CoreError::InvalidConfig(
                "max connections is zero".to_string(),
            ));
        }
        if let Some(auth) = &self.proxy.auth {
            if auth.username.len() > 255 || auth.password.len() > 255 {
                return Err(CoreError::InvalidConfig(
                    "auth credential exceeds 255 bytes".to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CoreConfig {
        CoreConfig::new(ProxyConfig {
            server_host: "198.51.100.1".to_string(),
            server_port: 1080,
            auth: None,
        })
    }

    #[test]
    fn default_config_validates() {
        assert!(config().validate().is_ok());
    }

    #[test]
    fn empty_host_rejected() {
        let mut cfg = config();
        cfg.proxy.server_host = "  ".to_string();
        assert!(matches!(
            cfg.validate(),
            Err(CoreError::InvalidConfig(_))
        ));
    }

    #[test]
    fn mtu_bounds_enforced() {
        let mut cfg = config();
        cfg.mtu = 100;
        assert!(cfg.validate().is_err());
        cfg.mtu = MAX_MTU + 1;
        assert!(cfg.validate().is_err());
        cfg.mtu = MIN_MTU;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn oversized_credentials_rejected() {
        let mut cfg = config();
        cfg.proxy.auth = Some(ProxyAuth {
            username: "u".repeat(256),
            password: "p".to_string(),
        });
        assert!(cfg.validate().is_err());
    }
}
