//! UDP transport handing out received datagrams in frames from a fixed pool.
//!
//! A frame is lent to the caller as a [`ManagedRecvBuffer`] and goes back to
//! the pool when the buffer is dropped, so the steady state allocates nothing.

use crate::common::*;
use crate::net_utils::{create_mio_udp_socket, MTU};

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mio::net::UdpSocket;

const SOCKET_TOKEN: mio::Token = mio::Token(0);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ZeroCopyXportParams {
  pub recv_frame_size: usize,
  pub num_recv_frames: usize,
  pub send_frame_size: usize,
  pub num_send_frames: usize,
}

impl Default for ZeroCopyXportParams {
  fn default() -> Self {
    Self { recv_frame_size: MTU, num_recv_frames: 32, send_frame_size: 0, num_send_frames: 0 }
  }
}

/// Kernel socket buffer sizes, 0 keeps the system default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BuffParams {
  pub recv_buff_size: usize,
  pub send_buff_size: usize,
}

pub trait ZeroCopyRecv: Send {
  /// Waits up to `timeout` for the next datagram. `Ok(None)` means nothing arrived in time
  /// or every frame of the pool is still held by the caller.
  fn get_recv_buff(&mut self, timeout: Duration) -> std::io::Result<Option<ManagedRecvBuffer>>;
  fn get_num_recv_frames(&self) -> usize;
  fn get_recv_frame_size(&self) -> usize;
}

type FramePool = Arc<Mutex<Vec<Box<[u8]>>>>;

/// One received datagram. Derefs to its bytes.
pub struct ManagedRecvBuffer {
  frame: Option<Box<[u8]>>,
  len: usize,
  pool: Option<FramePool>,
}

impl ManagedRecvBuffer {
  /// A buffer not backed by any pool, for in-memory transports.
  pub fn from_vec(data: Vec<u8>) -> Self {
    let len = data.len();
    Self { frame: Some(data.into_boxed_slice()), len, pool: None }
  }
}

impl Deref for ManagedRecvBuffer {
  type Target = [u8];
  fn deref(&self) -> &[u8] {
    match &self.frame {
      Some(frame) => &frame[..self.len],
      None => &[],
    }
  }
}

impl Drop for ManagedRecvBuffer {
  fn drop(&mut self) {
    if let (Some(frame), Some(pool)) = (self.frame.take(), &self.pool) {
      if let Ok(mut pool) = pool.lock() {
        pool.push(frame);
      }
    }
  }
}

pub struct UdpStreamZeroCopy {
  socket: UdpSocket,
  poll: mio::Poll,
  events: mio::Events,
  pool: FramePool,
  params: ZeroCopyXportParams,
  local_addr: SocketAddr,
}

impl UdpStreamZeroCopy {
  /// Binds to `addr` (port 0 picks an ephemeral one) and allocates the frame pool.
  pub fn make(addr: SocketAddr, params: ZeroCopyXportParams, buff_params: BuffParams) -> std::io::Result<Self> {
    let (mut socket, port) = create_mio_udp_socket(addr, buff_params.recv_buff_size)?;
    let poll = mio::Poll::new()?;
    poll.registry().register(&mut socket, SOCKET_TOKEN, mio::Interest::READABLE)?;
    let pool = (0..params.num_recv_frames).map(|_| vec![0u8; params.recv_frame_size].into_boxed_slice()).collect();
    let local_addr = SocketAddr::new(addr.ip(), port);
    debug!(
      "zero-copy UDP transport on {local_addr}: {} frames of {} bytes",
      params.num_recv_frames, params.recv_frame_size
    );
    Ok(Self {
      socket,
      poll,
      events: mio::Events::with_capacity(4),
      pool: Arc::new(Mutex::new(pool)),
      params,
      local_addr,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Discards every datagram already queued on the socket, returns how many were dropped.
  pub fn flush(&mut self) -> usize {
    let mut scratch = vec![0u8; self.params.recv_frame_size];
    let mut dropped = 0;
    loop {
      match self.socket.recv(&mut scratch) {
        Ok(_) => dropped += 1,
        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
        Err(e) => {
          if e.kind() != ErrorKind::WouldBlock {
            warn!("error while flushing {}: {e:?}", self.local_addr);
          }
          break;
        }
      }
    }
    if dropped > 0 {
      debug!("flushed {dropped} stale packets from {}", self.local_addr);
    }
    dropped
  }

  fn take_frame(&self) -> Option<Box<[u8]>> {
    self.pool.lock().ok().and_then(|mut pool| pool.pop())
  }

  fn give_back(&self, frame: Box<[u8]>) {
    if let Ok(mut pool) = self.pool.lock() {
      pool.push(frame);
    }
  }
}

impl ZeroCopyRecv for UdpStreamZeroCopy {
  fn get_recv_buff(&mut self, timeout: Duration) -> std::io::Result<Option<ManagedRecvBuffer>> {
    let mut frame = match self.take_frame() {
      Some(frame) => frame,
      None => {
        trace!("all {} frames of {} are in use", self.params.num_recv_frames, self.local_addr);
        return Ok(None);
      }
    };
    let deadline = Instant::now() + timeout;
    loop {
      match self.socket.recv(&mut frame) {
        Ok(len) => {
          return Ok(Some(ManagedRecvBuffer { frame: Some(frame), len, pool: Some(self.pool.clone()) }));
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
        Err(e) => {
          self.give_back(frame);
          return Err(e);
        }
      }
      let now = Instant::now();
      if now >= deadline {
        self.give_back(frame);
        return Ok(None);
      }
      match self.poll.poll(&mut self.events, Some(deadline - now)) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::Interrupted => {}
        Err(e) => {
          self.give_back(frame);
          return Err(e);
        }
      }
    }
  }

  fn get_num_recv_frames(&self) -> usize {
    self.params.num_recv_frames
  }

  fn get_recv_frame_size(&self) -> usize {
    self.params.recv_frame_size
  }
}
