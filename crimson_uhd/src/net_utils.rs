use crate::common::*;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Jumbo frame size the device streams with.
pub const MTU: usize = 9000;

/// Binds a non-blocking UDP socket for receiving, asking the kernel for `recv_buff_size` bytes of buffer.
///
/// Port 0 binds an ephemeral port, the actually bound port is returned.
pub fn create_mio_udp_socket(addr: SocketAddr, recv_buff_size: usize) -> std::io::Result<(mio::net::UdpSocket, u16)> {
  let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
  if recv_buff_size > 0 {
    socket.set_recv_buffer_size(recv_buff_size)?;
    let actual = socket.recv_buffer_size()?;
    if actual < recv_buff_size {
      warn!(
        "socket receive buffer for {addr} is {actual} bytes, requested {recv_buff_size}; \
         consider raising net.core.rmem_max to avoid overflows"
      );
    }
  }
  socket.bind(&addr.into())?;
  socket.set_nonblocking(true)?;
  let socket = mio::net::UdpSocket::from_std(socket.into());
  let port = socket.local_addr()?.port();
  return Ok((socket, port));
}

pub async fn create_tokio_udp_socket(self_ip: Ipv4Addr) -> tokio::io::Result<(UdpSocket, u16)> {
  let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(self_ip), 0)).await?;
  let port = socket.local_addr()?.port();
  return Ok((socket, port));
}
