//! SOCKS5 client: RFC 1928 method negotiation, optional RFC 1929
//! username/password sub-negotiation, and the CONNECT request. Only the
//! pieces a client needs; BIND and UDP ASSOCIATE are not spoken here.

use crate::config::ProxyConfig;
use crate::error::CoreError;
use crate::logger::{self, BreadcrumbFlags};
use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const SOCKS_VERSION: u8 = 0x05;
const AUTH_VERSION: u8 = 0x01;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
pub const MAX_DOMAIN_LEN: usize = 255;

/// CONNECT target. Domains are preferred when known so the proxy can do its
/// own resolution; otherwise the original destination IP literal is used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone)]
pub struct Socks5Target {
    pub addr: TargetAddr,
    pub port: u16,
}

/// Establish a CONNECT tunnel through `config`'s server. The entire
/// exchange, TCP connect included, runs under `handshake_timeout`.
pub async fn connect(
    config: &ProxyConfig,
    target: &Socks5Target,
    handshake_timeout: Duration,
) -> Result<TcpStream, CoreError> {
    match timeout(handshake_timeout, handshake(config, target)).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::ConnectionFailed(
            "socks5 handshake timed out".to_string(),
        )),
    }
}

async fn handshake(config: &ProxyConfig, target: &Socks5Target) -> Result<TcpStream, CoreError> {
    let mut stream =
        TcpStream::connect((config.server_host.as_str(), config.server_port))
            .await
            .map_err(|error| {
                CoreError::ConnectionFailed(format!("socks5 server unreachable: {error}"))
            })?;

    stream
        .write_all(&method_request(config.auth.is_some()))
        .await?;

    let mut selection = [0u8; 2];
    stream.read_exact(&mut selection).await?;
    if selection[0] != SOCKS_VERSION {
        return Err(CoreError::ConnectionFailed(format!(
            "unexpected socks version 0x{:02x}",
            selection[0]
        )));
    }
    match selection[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => {
            let Some(auth) = &config.auth else {
                return Err(CoreError::ConnectionFailed(
                    "server demanded credentials we do not have".to_string(),
                ));
            };
            let mut request = Vec::with_capacity(3 + auth.username.len() + auth.password.len());
            request.push(AUTH_VERSION);
            request.push(auth.username.len() as u8);
            request.extend_from_slice(auth.username.as_bytes());
            request.push(auth.password.len() as u8);
            request.extend_from_slice(auth.password.as_bytes());
            stream.write_all(&request).await?;

            let mut status = [0u8; 2];
            stream.read_exact(&mut status).await?;
            if status[1] != 0 {
                return Err(CoreError::ConnectionFailed(
                    "username/password rejected".to_string(),
                ));
            }
        }
        METHOD_UNACCEPTABLE => {
            return Err(CoreError::ConnectionFailed(
                "no acceptable auth method".to_string(),
            ));
        }
        other => {
            return Err(CoreError::ConnectionFailed(format!(
                "server selected unsupported method 0x{other:02x}"
            )));
        }
    }

    stream.write_all(&encode_connect_request(target)?).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != SOCKS_VERSION {
        return Err(CoreError::ConnectionFailed(
            "malformed connect reply".to_string(),
        ));
    }
    if head[1] != 0 {
        return Err(CoreError::ConnectionFailed(format!(
            "connect refused: {}",
            reply_error(head[1])
        )));
    }
    // Bound address: consumed and discarded.
    match head[3] {
        ATYP_IPV4 => {
            let mut rest = [0u8; 6];
            stream.read_exact(&mut rest).await?;
        }
        ATYP_IPV6 => {
            let mut rest = [0u8; 18];
            stream.read_exact(&mut rest).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        other => {
            return Err(CoreError::ConnectionFailed(format!(
                "unknown bound address type 0x{other:02x}"
            )));
        }
    }

    logger::breadcrumb(
        BreadcrumbFlags::SOCKS,
        format!("CONNECT established via {}:{}", config.server_host, config.server_port),
    );
    Ok(stream)
}

fn method_request(with_auth: bool) -> Vec<u8> {
    if with_auth {
        vec![SOCKS_VERSION, 2, METHOD_NONE, METHOD_USERPASS]
    } else {
        vec![SOCKS_VERSION, 1, METHOD_NONE]
    }
}

/// Encode the CONNECT request for `target` (ATYP 1/3/4).
fn encode_connect_request(target: &Socks5Target) -> Result<Vec<u8>, CoreError> {
    let mut request = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];
    match &target.addr {
        TargetAddr::Ip(IpAddr::V4(addr)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&addr.octets());
        }
        TargetAddr::Ip(IpAddr::V6(addr)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&addr.octets());
        }
        TargetAddr::Domain(domain) => {
            if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
                return Err(CoreError::ConnectionFailed(format!(
                    "domain length {} out of range",
                    domain.len()
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(domain.len() as u8);
            request.extend_from_slice(domain.as_bytes());
        }
    }
    request.extend_from_slice(&target.port.to_be_bytes());
    Ok(request)
}

fn reply_error(code: u8) -> &'static str {
    match code {
        0x01 => "general server failure",
        0x02 => "connection not allowed by ruleset",
        0x03 => "network unreachable",
        0x04 => "host unreachable",
        0x05 => "connection refused",
        0x06 => "ttl expired",
        0x07 => "command not supported",
        0x08 => "address type not supported",
        _ => "unknown reply code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn offers_no_auth_only_without_credentials() {
        assert_eq!(method_request(false), vec![0x05, 0x01, 0x00]);
    }

    #[test]
    fn offers_userpass_when_configured() {
        assert_eq!(method_request(true), vec![0x05, 0x02, 0x00, 0x02]);
    }

    #[test]
    fn encodes_ipv4_connect() {
        let target = Socks5Target {
            addr: TargetAddr::Ip(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))),
            port: 80,
        };
        assert_eq!(
            encode_connect_request(&target).unwrap(),
            vec![0x05, 0x01, 0x00, 0x01, 1, 2, 3, 4, 0x00, 0x50]
        );
    }

    #[test]
    fn encodes_domain_connect() {
        let target = Socks5Target {
            addr: TargetAddr::Domain("api.example.com".to_string()),
            port: 443,
        };
        let request = encode_connect_request(&target).unwrap();
        assert_eq!(&request[..4], &[0x05, 0x01, 0x00, 0x03]);
        assert_eq!(request[4] as usize, "api.example.com".len());
        assert_eq!(&request[5..5 + 15], b"api.example.com");
        assert_eq!(&request[20..], &[0x01, 0xBB]);
    }

    #[test]
    fn encodes_ipv6_connect() {
        let target = Socks5Target {
            addr: TargetAddr::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)),
            port: 8080,
        };
        let request = encode_connect_request(&target).unwrap();
        assert_eq!(request[3], ATYP_IPV6);
        assert_eq!(request.len(), 4 + 16 + 2);
    }

    #[test]
    fn oversized_domain_is_rejected() {
        let target = Socks5Target {
            addr: TargetAddr::Domain("x".repeat(MAX_DOMAIN_LEN + 1)),
            port: 443,
        };
        assert!(matches!(
            encode_connect_request(&target),
            Err(CoreError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn reply_codes_have_messages() {
        assert_eq!(reply_error(0x05), "connection refused");
        assert_eq!(reply_error(0xAA), "unknown reply code");
    }
}
