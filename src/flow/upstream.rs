//! Upstream socket I/O. Dialing and per-flow copy loops run on the engine's
//! single-worker tokio runtime; every outcome is posted back as an
//! `UpstreamEvent` and drained at the start of each poll tick, so the
//! boundary lock is never held across an await point.

use super::nat::FlowId;
use crate::config::ProxyConfig;
use crate::socks5::{self, Socks5Target};
use crossbeam_channel::Sender;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Depth of the stack→upstream channel; a full channel pauses draining of
/// the stack socket and lets the advertised TCP window shrink.
pub(super) const UPSTREAM_CHANNEL_DEPTH: usize = 32;
const READ_CHUNK: usize = 16 * 1024;
const UDP_READ_CHUNK: usize = 2048;

#[derive(Debug)]
pub(super) enum UpstreamEvent {
    Connected(FlowId),
    ConnectFailed(FlowId, String),
    Data(FlowId, Vec<u8>),
    PeerClosed(FlowId),
    Error(FlowId, String),
}

pub(super) enum TcpDial {
    Direct(SocketAddr),
    Proxy {
        config: ProxyConfig,
        target: Socks5Target,
    },
}

/// Engine-side handle to a flow's upstream task.
pub(super) struct UpstreamHandle {
    pub(super) sender: Option<mpsc::Sender<Vec<u8>>>,
    task: JoinHandle<()>,
}

impl UpstreamHandle {
    /// Half-close: no more client bytes will follow.
    pub(super) fn close_input(&mut self) {
        self.sender = None;
    }

    pub(super) fn abort(&self) {
        self.task.abort();
    }
}

pub(super) fn spawn_tcp(
    runtime: &Handle,
    flow: FlowId,
    dial: TcpDial,
    events: Sender<UpstreamEvent>,
    connect_timeout: Duration,
) -> UpstreamHandle {
    let (sender, input) = mpsc::channel(UPSTREAM_CHANNEL_DEPTH);
    let task = runtime.spawn(async move {
        let stream = match dial {
            TcpDial::Direct(addr) => match timeout(connect_timeout, TcpStream::connect(addr)).await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(error)) => {
                    let _ = events.send(UpstreamEvent::ConnectFailed(flow, error.to_string()));
                    return;
                }
                Err(_) => {
                    let _ = events.send(UpstreamEvent::ConnectFailed(
                        flow,
                        "connect timed out".to_string(),
                    ));
                    return;
                }
            },
            TcpDial::Proxy { config, target } => {
                match socks5::connect(&config, &target, connect_timeout).await {
                    Ok(stream) => stream,
                    Err(error) => {
                        let _ =
                            events.send(UpstreamEvent::ConnectFailed(flow, error.to_string()));
                        return;
                    }
                }
            }
        };
        let _ = events.send(UpstreamEvent::Connected(flow));
        run_tcp_copy(flow, stream, input, events).await;
    });
    UpstreamHandle {
        sender: Some(sender),
        task,
    }
}

async fn run_tcp_copy(
    flow: FlowId,
    stream: TcpStream,
    mut input: mpsc::Receiver<Vec<u8>>,
    events: Sender<UpstreamEvent>,
) {
    let (mut reader, mut writer) = stream.into_split();
    let mut buf = vec![0u8; READ_CHUNK];
    let mut input_open = true;
    loop {
        tokio::select! {
            maybe = input.recv(), if input_open => match maybe {
                Some(bytes) => {
                    if let Err(error) = writer.write_all(&bytes).await {
                        let _ = events.send(UpstreamEvent::Error(flow, error.to_string()));
                        return;
                    }
                }
                None => {
                    // Engine dropped the sender: half-close toward the peer
                    // and keep relaying its remaining bytes.
                    input_open = false;
                    let _ = writer.shutdown().await;
                }
            },
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    let _ = events.send(UpstreamEvent::PeerClosed(flow));
                    return;
                }
                Ok(n) => {
                    let _ = events.send(UpstreamEvent::Data(flow, buf[..n].to_vec()));
                }
                Err(error) => {
                    let _ = events.send(UpstreamEvent::Error(flow, error.to_string()));
                    return;
                }
            },
        }
    }
}

pub(super) fn spawn_udp(
    runtime: &Handle,
    flow: FlowId,
    target: SocketAddr,
    events: Sender<UpstreamEvent>,
) -> UpstreamHandle {
    let (sender, mut input) = mpsc::channel::<Vec<u8>>(UPSTREAM_CHANNEL_DEPTH);
    let task = runtime.spawn(async move {
        let bind_addr = if target.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };
        let socket = match UdpSocket::bind(bind_addr).await {
            Ok(socket) => socket,
            Err(error) => {
                let _ = events.send(UpstreamEvent::ConnectFailed(flow, error.to_string()));
                return;
            }
        };
        if let Err(error) = socket.connect(target).await {
            let _ = events.send(UpstreamEvent::ConnectFailed(flow, error.to_string()));
            return;
        }
        let _ = events.send(UpstreamEvent::Connected(flow));

        let mut buf = vec![0u8; UDP_READ_CHUNK];
        loop {
            tokio::select! {
                maybe = input.recv() => match maybe {
                    Some(bytes) => {
                        if let Err(error) = socket.send(&bytes).await {
                            let _ = events.send(UpstreamEvent::Error(flow, error.to_string()));
                            return;
                        }
                    }
                    // Engine closed the flow.
                    None => return,
                },
                result = socket.recv(&mut buf) => match result {
                    Ok(n) => {
                        let _ = events.send(UpstreamEvent::Data(flow, buf[..n].to_vec()));
                    }
                    Err(error) => {
                        let _ = events.send(UpstreamEvent::Error(flow, error.to_string()));
                        return;
                    }
                },
            }
        }
    });
    UpstreamHandle {
        sender: Some(sender),
        task,
    }
}
