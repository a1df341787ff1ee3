use super::state::{
    TCP_RX_BUFFER_SIZE, TCP_TX_BUFFER_SIZE, UDP_BUFFER_SIZE, UDP_PACKET_METADATA,
};
use crate::device::VirtDevice;
use smoltcp::iface::{Config as IfaceConfig, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp::{Socket as TcpSocket, SocketBuffer as TcpSocketBuffer};
use smoltcp::socket::udp::{PacketBuffer, PacketMetadata, Socket as UdpSocket};
use smoltcp::time::Instant;
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, Ipv4Address, Ipv6Address};

/// Build the smoltcp interface plus pre-allocated TCP/UDP socket pools.
/// `any_ip` lets the pooled sockets listen on whatever destination the
/// client dialed; the interface addresses are only anchors for routing.
pub(super) fn build_interface_and_sockets(
    mut device: VirtDevice,
    pool_size: usize,
) -> (
    VirtDevice,
    Interface,
    SocketSet<'static>,
    Vec<SocketHandle>,
    Vec<SocketHandle>,
) {
    let ipv4_addr = Ipv4Address::new(10, 0, 0, 1);
    let ipv6_addr = Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

    let mut config = IfaceConfig::new(HardwareAddress::Ip);
    config.random_seed = 0;
    let mut interface = Interface::new(config, &mut device, Instant::from_millis(0));
    interface.set_any_ip(true);
    interface.update_ip_addrs(|ip_addrs| {
        ip_addrs.clear();
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv4(ipv4_addr), 24));
        let _ = ip_addrs.push(IpCidr::new(IpAddress::Ipv6(ipv6_addr), 64));
    });
    {
        let routes = interface.routes_mut();
        routes.add_default_ipv4_route(ipv4_addr).ok();
        routes.add_default_ipv6_route(ipv6_addr).ok();
    }

    let mut sockets = SocketSet::new(Vec::new());
    let mut tcp_pool = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let socket = TcpSocket::new(
            TcpSocketBuffer::new(vec![0; TCP_RX_BUFFER_SIZE]),
            TcpSocketBuffer::new(vec![0; TCP_TX_BUFFER_SIZE]),
        );
        let handle = sockets.add(socket);
        tcp_pool.push(handle);
    }

    let mut udp_pool = Vec::with_capacity(pool_size);
    for _ in 0..pool_size {
        let rx_meta = vec![PacketMetadata::EMPTY; UDP_PACKET_METADATA];
        let tx_meta = vec![PacketMetadata::EMPTY; UDP_PACKET_METADATA];
        let socket = UdpSocket::new(
            PacketBuffer::new(rx_meta, vec![0; UDP_BUFFER_SIZE]),
            PacketBuffer::new(tx_meta, vec![0; UDP_BUFFER_SIZE]),
        );
        let handle = sockets.add(socket);
        udp_pool.push(handle);
    }

    (device, interface, sockets, tcp_pool, udp_pool)
}
