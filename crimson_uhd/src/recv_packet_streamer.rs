//! Multi-channel receive streamer.
//!
//! Owns one zero-copy transport per channel. Every `recv` pulls at most one
//! packet per channel, lines the channels up by timestamp and converts the
//! common part of the payloads into the caller's buffers. Packets larger than
//! the caller's buffers are handed out in fragments over several calls.

use crate::common::*;
use crate::convert::{ConvertId, Converter};
use crate::crimson_tng::DeviceControl;
use crate::stream::{RxErrorCode, RxMetadata, StreamCmd, StreamMode};
use crate::time_spec::TimeSpec;
use crate::udp_zero_copy::{ManagedRecvBuffer, ZeroCopyRecv};
use crate::vrt::{if_hdr_unpack_be, IfPacketInfo, VrtUnpacker};

use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_CHANNEL_SKEW_TIMEOUT: Duration = Duration::from_millis(10);
pub const DEFAULT_ALIGNMENT_FAILURE_THRESHOLD: usize = 32;

/// Bytes of a bad packet shown in the error log.
const HEADER_DUMP_LEN: usize = 28;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamerState {
  Unconfigured,
  Streaming,
  Stopped,
}

struct PendingPacket {
  buff: ManagedRecvBuffer,
  info: IfPacketInfo,
  num_samps: usize,
  /// Samples of this packet already handed out.
  offset: usize,
  out_of_sequence: bool,
}

struct RxChannel {
  xport: Box<dyn ZeroCopyRecv>,
  ctrl: Arc<dyn DeviceControl>,
  sink_id: String,
  pending: Option<PendingPacket>,
  next_packet_count: Option<u8>,
}

enum Pull {
  Packet(PendingPacket),
  Timeout,
  Failed(RxMetadata),
}

pub struct RecvPacketStreamer {
  channels: Vec<RxChannel>,
  convert_id: ConvertId,
  converter: Box<dyn Converter>,
  spp: usize,
  vrt_unpacker: VrtUnpacker,
  tick_rate: f64,
  samp_rate: f64,
  alignment_failure_threshold: usize,
  channel_skew_timeout: Duration,
  state: StreamerState,
}

impl RecvPacketStreamer {
  pub fn new(spp: usize, convert_id: ConvertId, converter: Box<dyn Converter>) -> Self {
    Self {
      channels: vec![],
      convert_id,
      converter,
      spp,
      vrt_unpacker: if_hdr_unpack_be,
      tick_rate: 1.0,
      samp_rate: 1.0,
      alignment_failure_threshold: DEFAULT_ALIGNMENT_FAILURE_THRESHOLD,
      channel_skew_timeout: DEFAULT_CHANNEL_SKEW_TIMEOUT,
      state: StreamerState::Unconfigured,
    }
  }

  /// Appends a channel fed by `xport`, whose stream commands go to `sink_id` of `ctrl`.
  pub fn add_channel(&mut self, xport: Box<dyn ZeroCopyRecv>, ctrl: Arc<dyn DeviceControl>, sink_id: impl Into<String>) {
    let sink_id = sink_id.into();
    debug!("streamer channel {} bound to {sink_id}", self.channels.len());
    self.channels.push(RxChannel { xport, ctrl, sink_id, pending: None, next_packet_count: None });
  }

  pub fn set_vrt_unpacker(&mut self, unpacker: VrtUnpacker) {
    self.vrt_unpacker = unpacker;
  }

  pub fn set_tick_rate(&mut self, rate: f64) {
    self.tick_rate = rate;
  }

  pub fn set_samp_rate(&mut self, rate: f64) {
    self.samp_rate = rate;
  }

  pub fn set_alignment_failure_threshold(&mut self, threshold: usize) {
    self.alignment_failure_threshold = threshold;
  }

  pub fn set_channel_skew_timeout(&mut self, timeout: Duration) {
    self.channel_skew_timeout = timeout;
  }

  pub fn get_num_channels(&self) -> usize {
    self.channels.len()
  }

  pub fn get_max_num_samps(&self) -> usize {
    self.spp
  }

  pub fn state(&self) -> StreamerState {
    self.state
  }

  /// Sends `cmd` to every channel. Failures of individual sinks are logged.
  pub fn issue_stream_cmd(&mut self, cmd: &StreamCmd) {
    debug!("issuing {cmd:?} to {} channels", self.channels.len());
    for ch in &self.channels {
      ch.ctrl.issue_stream_cmd(&ch.sink_id, cmd).log_and_forget();
    }
    self.state = match cmd.stream_mode {
      StreamMode::StopContinuous => StreamerState::Stopped,
      _ => StreamerState::Streaming,
    };
  }

  /// Receives up to `nsamps_per_buff` samples into each of `buffs`, one buffer per channel.
  ///
  /// Returns the number of samples written to every buffer. On any error the count is 0
  /// and the buffers are left untouched.
  ///
  /// # Panics
  ///
  /// If `buffs` does not hold exactly one buffer per channel, or if `T` is not the
  /// host format the streamer was created for.
  pub fn recv<T: HostSample>(&mut self, buffs: &mut [&mut [T]], nsamps_per_buff: usize, timeout: Duration) -> (usize, RxMetadata) {
    assert_eq!(buffs.len(), self.channels.len(), "recv needs one buffer per channel");
    assert_eq!(
      T::FORMAT, self.convert_id.output_format,
      "buffer type does not match the streamer's host format"
    );
    let nsamps = buffs.iter().map(|b| b.len()).fold(nsamps_per_buff, usize::min);

    let fragment_pending = self.channels.iter().any(|ch| ch.pending.as_ref().is_some_and(|p| p.offset > 0));
    if !fragment_pending {
      if let Err(md) = self.fill_and_align(timeout) {
        return (0, md);
      }
    }
    self.convert_pending(buffs, nsamps)
  }

  /// Makes sure every channel has a pending packet and that all of them start at the same time.
  fn fill_and_align(&mut self, timeout: Duration) -> Result<(), RxMetadata> {
    let mut next_timeout = timeout;
    let mut misalignments = 0;
    loop {
      for index in 0..self.channels.len() {
        if self.channels[index].pending.is_some() {
          continue;
        }
        let pulled = self.pull_packet(index, next_timeout);
        next_timeout = self.channel_skew_timeout;
        match pulled {
          Pull::Packet(packet) => self.channels[index].pending = Some(packet),
          Pull::Timeout => return Err(RxMetadata::error(RxErrorCode::Timeout)),
          Pull::Failed(md) => return Err(md),
        }
      }

      let ticks = self.channels.iter().map(|ch| ch.pending.as_ref().and_then(|p| packet_ticks(&p.info))).collect::<Vec<_>>();
      let Some(newest) = ticks.iter().flatten().max().copied() else {
        return Ok(());
      };
      if ticks.iter().all(|t| t.map_or(true, |t| t == newest)) {
        return Ok(());
      }

      misalignments += 1;
      if misalignments > self.alignment_failure_threshold {
        warn!("channels could not be aligned after {misalignments} attempts, dropping pending packets");
        for ch in &mut self.channels {
          ch.pending = None;
        }
        return Err(RxMetadata::error(RxErrorCode::Alignment));
      }
      for (ch, t) in self.channels.iter_mut().zip(ticks) {
        if t.is_some_and(|t| t < newest) {
          trace!("discarding packet at tick {t:?} on {}, newest is {newest}", ch.sink_id);
          ch.pending = None;
        }
      }
    }
  }

  fn pull_packet(&mut self, index: usize, timeout: Duration) -> Pull {
    let unpack = self.vrt_unpacker;
    let in_bpi = self.converter.input_bytes_per_item();
    let tick_rate = self.tick_rate;
    let ch = &mut self.channels[index];
    loop {
      let buff = match ch.xport.get_recv_buff(timeout) {
        Ok(Some(buff)) => buff,
        Ok(None) => return Pull::Timeout,
        Err(e) => {
          error!("transport error on {}: {e:?}", ch.sink_id);
          return Pull::Failed(RxMetadata::error(RxErrorCode::BadPacket));
        }
      };
      let info = match unpack(&buff) {
        Ok(info) => info,
        Err(e) => {
          error!("bad packet on {}: {e}, header {}", ch.sink_id, hex::encode(&buff[..buff.len().min(HEADER_DUMP_LEN)]));
          return Pull::Failed(RxMetadata::error(RxErrorCode::BadPacket));
        }
      };

      if !info.packet_type.is_data() {
        let payload = &buff[info.payload_range()];
        let code = payload.get(0..4).map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]])).unwrap_or(0);
        match RxErrorCode::from_code(code) {
          Some(RxErrorCode::None) => continue,
          Some(error_code) => {
            warn!("{} reported {error_code}", ch.sink_id);
            let mut md = RxMetadata::error(error_code);
            if let Some(ticks) = packet_ticks(&info) {
              md.has_time_spec = true;
              md.time_spec = TimeSpec::from_ticks(ticks, tick_rate);
            }
            return Pull::Failed(md);
          }
          None => {
            error!("unknown context code {code:#x} on {}", ch.sink_id);
            return Pull::Failed(RxMetadata::error(RxErrorCode::BadPacket));
          }
        }
      }

      let out_of_sequence = match ch.next_packet_count {
        Some(expected) if expected != info.packet_count => {
          warn!("{}: expected packet {expected}, got {}", ch.sink_id, info.packet_count);
          true
        }
        _ => false,
      };
      ch.next_packet_count = Some((info.packet_count + 1) & 0xf);

      if info.num_payload_bytes % in_bpi != 0 {
        warn!("{}: payload of {} bytes is not a whole number of samples", ch.sink_id, info.num_payload_bytes);
      }
      let num_samps = info.num_payload_bytes / in_bpi;
      return Pull::Packet(PendingPacket { buff, info, num_samps, offset: 0, out_of_sequence });
    }
  }

  fn convert_pending<T: HostSample>(&mut self, buffs: &mut [&mut [T]], nsamps: usize) -> (usize, RxMetadata) {
    let in_bpi = self.converter.input_bytes_per_item();
    let packets = self.channels.iter().filter_map(|ch| ch.pending.as_ref()).collect::<Vec<_>>();
    let Some(first) = packets.first() else {
      return (0, RxMetadata::error(RxErrorCode::Timeout));
    };
    let total = packets.iter().map(|p| p.num_samps).min().unwrap_or(0);
    if packets.iter().any(|p| p.num_samps != total) {
      warn!("channel packets differ in size, truncating to {total} samples");
    }
    let offset = first.offset;
    let n = nsamps.min(total.saturating_sub(offset));

    let mut md = RxMetadata {
      start_of_burst: first.info.sob && offset == 0,
      end_of_burst: first.info.eob && offset + n >= total,
      more_fragments: offset + n < total,
      fragment_offset: offset,
      out_of_sequence: packets.iter().any(|p| p.out_of_sequence && p.offset == 0),
      ..Default::default()
    };
    if let Some(ticks) = packet_ticks(&first.info) {
      md.has_time_spec = true;
      md.time_spec = TimeSpec::from_ticks(ticks, self.tick_rate) + offset as f64 / self.samp_rate;
    }

    for (ch, buff) in self.channels.iter_mut().zip(buffs.iter_mut()) {
      let Some(packet) = ch.pending.as_mut() else { continue };
      let start = packet.info.payload_range().start + packet.offset * in_bpi;
      self.converter.convert(&packet.buff[start..], bytemuck::cast_slice_mut(&mut buff[..n]), n);
      packet.offset += n;
      if packet.offset >= total {
        ch.pending = None;
      }
    }
    (n, md)
  }
}

impl Drop for RecvPacketStreamer {
  fn drop(&mut self) {
    if self.state == StreamerState::Streaming {
      self.issue_stream_cmd(&StreamCmd::new(StreamMode::StopContinuous));
    }
  }
}

/// Absolute device tick of the first sample, if the packet carries a timestamp.
fn packet_ticks(info: &IfPacketInfo) -> Option<i64> {
  if !info.has_tsf {
    return None;
  }
  Some(info.tsf as i64)
}
