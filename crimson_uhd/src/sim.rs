//! In-process Crimson TNG stand-in.
//!
//! Answers stream commands by sending VITA data packets over UDP to the
//! endpoint configured in the property tree of every commanded channel, paced
//! by a simulated device clock. Sample values are a ramp of the absolute
//! sample index (I) and the channel number (Q).

use crate::common::*;
use crate::convert::write_sc16_item32_be;
use crate::crimson_tng::{DeviceControl, RX_HEADER_SIZE};
use crate::error::{ConfigurationError, PropertyError};
use crate::net_utils::{create_tokio_udp_socket, MTU};
use crate::property_tree::{MemoryPropertyTree, PropValue, PropertyTree, PropertyTreeExt};
use crate::stream::{RxErrorCode, StreamCmd, StreamMode};
use crate::thread_utils::run_future_in_new_thread;
use crate::time_spec::TimeSpec;
use crate::vrt::{if_hdr_pack_be, IfPacketInfo, PacketType};

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use atomic::Atomic;
use bytebuffer::ByteBuffer;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::sleep_until;

pub const SIM_TREE_TOML: &str = include_str!("sim_tree.toml");

/// Rates are coerced to integer decimations of this clock.
pub const MASTER_CLOCK_RATE: f64 = 325e6;

/// Samples in a full data packet, the most a jumbo frame holds.
pub const SIM_SPP: usize = (MTU - RX_HEADER_SIZE) / 4;

/// How long after start-up the time difference loop reports convergence.
const CONVERGENCE_DELAY: Duration = Duration::from_millis(30);

const NO_DROP: u64 = u64::MAX;

const MB_PATH: &str = "/mboards/0";

pub fn default_tree() -> Result<MemoryPropertyTree, PropertyError> {
  MemoryPropertyTree::from_toml_str(SIM_TREE_TOML)
}

pub fn ramp_sample(channel: usize, index: u64) -> Sc16 {
  Sc16::new((index % 0x8000) as i16, channel as i16)
}

/// A data packet as the device sends it: stream id, fractional timestamp and trailer.
pub fn build_data_packet(sid: u32, packet_count: u8, ticks: u64, samples: &[Sc16], sob: bool, eob: bool) -> Vec<u8> {
  let mut info = IfPacketInfo {
    packet_type: PacketType::Data,
    has_sid: true,
    sid,
    has_tsf: true,
    tsf: ticks,
    has_tlr: true,
    packet_count: packet_count & 0xf,
    sob,
    eob,
    num_payload_words32: samples.len(),
    ..Default::default()
  };
  let mut out = ByteBuffer::new();
  if_hdr_pack_be(&mut info, &mut out);
  let mut payload = vec![0u8; samples.len() * 4];
  write_sc16_item32_be(samples, &mut payload);
  out.write_bytes(&payload);
  out.write_u32(info.tlr);
  out.into_vec()
}

/// A context packet whose single payload word is `code`.
pub fn build_context_packet(sid: u32, packet_count: u8, ticks: Option<u64>, code: RxErrorCode) -> Vec<u8> {
  let mut info = IfPacketInfo {
    packet_type: PacketType::Context,
    sid,
    has_tsf: ticks.is_some(),
    tsf: ticks.unwrap_or(0),
    packet_count: packet_count & 0xf,
    num_payload_words32: 1,
    ..Default::default()
  };
  let mut out = ByteBuffer::new();
  if_hdr_pack_be(&mut info, &mut out);
  out.write_u32(code as u32);
  out.into_vec()
}

fn channel_name(index: usize) -> String {
  format!("Channel_{}", (b'A' + index as u8) as char)
}

fn rate_path(index: usize) -> String {
  format!("{MB_PATH}/rx_dsps/{}/rate/value", channel_name(index))
}

fn coerced_rate(requested: f64) -> f64 {
  let decimation = if requested > 0.0 { (MASTER_CLOCK_RATE / requested).round().clamp(1.0, 65535.0) } else { 1.0 };
  MASTER_CLOCK_RATE / decimation
}

fn coerce_rate(value: PropValue) -> PropValue {
  match value {
    PropValue::Double(d) => PropValue::Double(coerced_rate(d)),
    PropValue::Int(i) => PropValue::Double(coerced_rate(i as f64)),
    other => other,
  }
}

struct DeviceClock {
  base: Mutex<(Instant, TimeSpec)>,
}

impl DeviceClock {
  fn now(&self) -> TimeSpec {
    let (instant, time) = *self.base.lock().unwrap();
    time + TimeSpec::from(instant.elapsed())
  }

  fn set(&self, time: TimeSpec) {
    *self.base.lock().unwrap() = (Instant::now(), time);
  }

  /// Host instant at which the device clock reads `time`.
  fn instant_at(&self, time: TimeSpec) -> Instant {
    let (instant, base) = *self.base.lock().unwrap();
    instant + base.duration_until(time)
  }
}

struct SimShared {
  tree: Arc<MemoryPropertyTree>,
  clock: DeviceClock,
  tick_rate: f64,
  rates: Vec<Atomic<f64>>,
  drop_after: AtomicU64,
}

enum SimCommand {
  Stream { channel: usize, cmd: StreamCmd },
  Shutdown,
}

struct Burst {
  dest: SocketAddr,
  rate: f64,
  mode: StreamMode,
  start_ticks: i64,
  /// Absolute index of the first sample of the burst.
  first_index: u64,
  sent: u64,
  /// `None` streams until stopped.
  remaining: Option<u64>,
}

impl Burst {
  fn next_len(&self) -> usize {
    self.remaining.map_or(SIM_SPP, |r| r.min(SIM_SPP as u64) as usize)
  }

  fn ticks_at(&self, sample: u64, tick_rate: f64) -> i64 {
    self.start_ticks + (sample as f64 * tick_rate / self.rate).round() as i64
  }

  /// The next packet leaves once its last sample has been "captured".
  fn due(&self, shared: &SimShared) -> Instant {
    let end = self.ticks_at(self.sent + self.next_len() as u64, shared.tick_rate);
    shared.clock.instant_at(TimeSpec::from_ticks(end, shared.tick_rate))
  }
}

struct Emitter {
  shared: Arc<SimShared>,
  socket: UdpSocket,
  bursts: Vec<Option<Burst>>,
  packet_counts: Vec<u8>,
}

impl Emitter {
  fn destination(&self, channel: usize) -> Result<SocketAddr, String> {
    let link = format!("{MB_PATH}/rx_link/{}", channel_name(channel));
    let ip = self.shared.tree.get::<String>(format!("{link}/ip_dest")).map_err(|e| e.to_string())?;
    let port = self.shared.tree.get::<String>(format!("{link}/port")).map_err(|e| e.to_string())?;
    let ip: IpAddr = ip.parse().map_err(|_| format!("bad address {ip:?}"))?;
    let port: u16 = port.parse().map_err(|_| format!("bad port {port:?}"))?;
    Ok(SocketAddr::new(ip, port))
  }

  async fn send(&self, dest: SocketAddr, packet: &[u8]) {
    if let Err(e) = self.socket.send_to(packet, dest).await {
      error!("simulator send to {dest} failed: {e:?}");
    }
  }

  async fn handle_command(&mut self, channel: usize, cmd: StreamCmd) {
    debug!("sim channel {channel}: {cmd:?}");
    if cmd.stream_mode == StreamMode::StopContinuous {
      self.bursts[channel] = None;
      return;
    }
    if let Some(burst) = &mut self.bursts[channel] {
      if burst.mode == StreamMode::NumSampsAndMore && cmd.stream_now && cmd.stream_mode != StreamMode::StartContinuous {
        burst.remaining = burst.remaining.map(|r| r + cmd.num_samps as u64);
        burst.mode = cmd.stream_mode;
        return;
      }
    }

    let now = self.shared.clock.now();
    let start = if cmd.stream_now {
      // next 10 ms boundary of device time
      TimeSpec::new(now.full_secs(), ((now.frac_secs() * 100.0).floor() + 1.0) / 100.0)
    } else {
      cmd.time_spec
    };
    let dest = match self.destination(channel) {
      Ok(dest) => dest,
      Err(e) => {
        error!("sim channel {channel} has no valid endpoint: {e}");
        return;
      }
    };
    if !cmd.stream_now && start < now {
      warn!("sim channel {channel}: command for {:?} arrived late at {:?}", start.real_secs(), now.real_secs());
      let ticks = now.to_ticks(self.shared.tick_rate) as u64;
      self.send(dest, &build_context_packet(channel as u32, 0, Some(ticks), RxErrorCode::LateCommand)).await;
      self.bursts[channel] = None;
      return;
    }

    let remaining = match cmd.stream_mode {
      StreamMode::StartContinuous => None,
      _ => Some(cmd.num_samps as u64),
    };
    if remaining == Some(0) {
      return;
    }
    let rate = self.shared.rates[channel].load(Ordering::Relaxed);
    let start_ticks = start.to_ticks(self.shared.tick_rate);
    self.bursts[channel] = Some(Burst {
      dest,
      rate,
      mode: cmd.stream_mode,
      start_ticks,
      first_index: (start_ticks as f64 * rate / self.shared.tick_rate).round() as u64,
      sent: 0,
      remaining,
    });
  }

  async fn emit_due(&mut self) {
    let now = Instant::now();
    let drop_after = self.shared.drop_after.load(Ordering::Relaxed);
    let mut outgoing = vec![];
    for channel in 0..self.bursts.len() {
      while let Some(burst) = &mut self.bursts[channel] {
        if burst.due(&self.shared) > now {
          break;
        }
        let len = burst.next_len();
        let ticks = burst.ticks_at(burst.sent, self.shared.tick_rate) as u64;
        let samples = (0..len as u64).map(|i| ramp_sample(channel, burst.first_index + burst.sent + i)).collect::<Vec<_>>();
        let sob = burst.sent == 0;
        let dropped = burst.sent >= drop_after;
        burst.sent += len as u64;
        if let Some(remaining) = &mut burst.remaining {
          *remaining -= len as u64;
        }
        let finished = burst.remaining == Some(0);
        let eob = finished && burst.mode == StreamMode::NumSampsAndDone;
        let dest = burst.dest;
        let mode = burst.mode;

        if !dropped {
          let count = self.packet_counts[channel];
          self.packet_counts[channel] = (count + 1) & 0xf;
          outgoing.push((dest, build_data_packet(channel as u32, count, ticks, &samples, sob, eob)));
        }
        if finished {
          if mode == StreamMode::NumSampsAndMore {
            outgoing.push((dest, build_context_packet(channel as u32, 0, None, RxErrorCode::BrokenChain)));
          }
          self.bursts[channel] = None;
        }
      }
    }
    for (dest, packet) in outgoing {
      self.send(dest, &packet).await;
    }
  }

  async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SimCommand>) {
    loop {
      let next_due = self.bursts.iter().flatten().map(|b| b.due(&self.shared)).min();
      let deadline = tokio::time::Instant::from_std(next_due.unwrap_or_else(Instant::now));
      tokio::select! {
        cmd = commands.recv() => match cmd {
          Some(SimCommand::Stream { channel, cmd }) => self.handle_command(channel, cmd).await,
          Some(SimCommand::Shutdown) | None => break,
        },
        _ = sleep_until(deadline), if next_due.is_some() => self.emit_due().await,
      }
    }
    debug!("simulator emitter stopped");
  }
}

/// Simulated device. Share it as the [`DeviceControl`] of a [`crate::CrimsonTng`].
pub struct SimulatedCrimson {
  shared: Arc<SimShared>,
  num_channels: usize,
  commands: mpsc::UnboundedSender<SimCommand>,
  started: Instant,
  thread: Mutex<Option<JoinHandle<()>>>,
}

impl SimulatedCrimson {
  /// Installs the rate coercers on `tree` and starts the emitter thread.
  pub fn start(tree: Arc<MemoryPropertyTree>) -> Result<Arc<Self>, ConfigurationError> {
    let tick_rate = tree.get::<f64>(format!("{MB_PATH}/tick_rate"))?;
    let num_channels = tree.list(&format!("{MB_PATH}/rx_link")).iter().filter(|n| n.starts_with("Channel_")).count();
    let rates = (0..num_channels)
      .map(|i| tree.get::<f64>(rate_path(i)).map(|r| Atomic::new(coerced_rate(r))))
      .collect::<Result<Vec<_>, _>>()?;
    let shared = Arc::new(SimShared {
      tree: tree.clone(),
      clock: DeviceClock { base: Mutex::new((Instant::now(), TimeSpec::default())) },
      tick_rate,
      rates,
      drop_after: AtomicU64::new(NO_DROP),
    });
    for i in 0..num_channels {
      let path = rate_path(i);
      tree.set_coercer(&path, coerce_rate);
      let weak: Weak<SimShared> = Arc::downgrade(&shared);
      tree.add_subscriber(&path, move |value| {
        if let (Some(shared), PropValue::Double(rate)) = (weak.upgrade(), value) {
          shared.rates[i].store(*rate, Ordering::Relaxed);
        }
      });
      tree.update(&path)?;
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let emitter_shared = shared.clone();
    let thread = run_future_in_new_thread("crimson sim", move || {
      Box::pin(async move {
        let (socket, port) = match create_tokio_udp_socket(Ipv4Addr::LOCALHOST).await {
          Ok(s) => s,
          Err(e) => {
            error!("simulator cannot create its socket: {e:?}");
            return;
          }
        };
        debug!("simulated Crimson TNG streaming from port {port}");
        let emitter = Emitter {
          shared: emitter_shared,
          socket,
          bursts: (0..num_channels).map(|_| None).collect(),
          packet_counts: vec![0; num_channels],
        };
        emitter.run(rx).await;
      })
    })?;
    info!("simulated Crimson TNG with {num_channels} RX channels started");
    Ok(Arc::new(Self { shared, num_channels, commands: tx, started: Instant::now(), thread: Mutex::new(Some(thread)) }))
  }

  /// Stops sending data packets after `samples` samples of every burst, `None` delivers everything.
  pub fn set_drop_after(&self, samples: Option<u64>) {
    self.shared.drop_after.store(samples.unwrap_or(NO_DROP), Ordering::Relaxed);
  }

  fn sink_channel(&self, sink_id: &str) -> Option<usize> {
    let letter = sink_id.strip_prefix("rx_")?.strip_suffix("/stream")?;
    let &[c] = letter.as_bytes() else { return None };
    let index = c.checked_sub(b'a')? as usize;
    (index < self.num_channels).then_some(index)
  }
}

impl DeviceControl for SimulatedCrimson {
  fn issue_stream_cmd(&self, sink_id: &str, cmd: &StreamCmd) -> std::io::Result<()> {
    let channel = self
      .sink_channel(sink_id)
      .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("unknown sink {sink_id}")))?;
    self
      .commands
      .send(SimCommand::Stream { channel, cmd: *cmd })
      .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "simulator stopped"))
  }

  fn get_time_now(&self) -> TimeSpec {
    self.shared.clock.now()
  }

  fn set_time_now(&self, time: TimeSpec) {
    self.shared.clock.set(time);
  }

  fn time_diff_converged(&self) -> bool {
    self.started.elapsed() >= CONVERGENCE_DELAY
  }
}

impl Drop for SimulatedCrimson {
  fn drop(&mut self) {
    self.commands.send(SimCommand::Shutdown).log_and_forget();
    if let Some(thread) = self.thread.lock().ok().and_then(|mut t| t.take()) {
      if thread.join().is_err() {
        error!("simulator thread panicked");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::crimson_tng::{CrimsonTng, RxStreamConfig, ALL_CHANS};
  use crate::recv_packet_streamer::RecvPacketStreamer;
  use crate::stream::{RxMetadata, StreamArgs};

  fn setup(channels: &[usize]) -> (CrimsonTng, Arc<SimulatedCrimson>, RecvPacketStreamer) {
    let tree = Arc::new(default_tree().unwrap());
    let sim = SimulatedCrimson::start(tree.clone()).unwrap();
    let dev = CrimsonTng::new(tree, sim.clone()).with_config(RxStreamConfig::default());
    let streamer = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels(channels.to_vec())).unwrap();
    (dev, sim, streamer)
  }

  fn recv_all(streamer: &mut RecvPacketStreamer, first_timeout: Duration) -> (Vec<Vec<Sc16>>, Vec<RxMetadata>) {
    let n = streamer.get_num_channels();
    let spp = streamer.get_max_num_samps();
    let mut out = vec![vec![]; n];
    let mut mds = vec![];
    let mut bufs = vec![vec![Sc16::default(); spp]; n];
    let mut timeout = first_timeout;
    loop {
      let mut refs = bufs.iter_mut().map(|b| b.as_mut_slice()).collect::<Vec<_>>();
      let (num, md) = streamer.recv(&mut refs, spp, timeout);
      timeout = Duration::from_millis(100);
      if md.error_code != RxErrorCode::None {
        mds.push(md);
        break;
      }
      for (o, b) in out.iter_mut().zip(&bufs) {
        o.extend_from_slice(&b[..num]);
      }
      let eob = md.end_of_burst;
      mds.push(md);
      if eob {
        break;
      }
    }
    (out, mds)
  }

  #[test]
  fn test_rate_is_coerced_to_clock_decimation() {
    let tree = Arc::new(default_tree().unwrap());
    let sim = SimulatedCrimson::start(tree.clone()).unwrap();
    let dev = CrimsonTng::new(tree, sim.clone());
    dev.set_rx_rate(100e6 / 16.0, ALL_CHANS).unwrap();
    assert_eq!(dev.get_rx_rate(3).unwrap(), 6.25e6);
    dev.set_rx_rate(7e6, 1).unwrap();
    assert_eq!(dev.get_rx_rate(1).unwrap(), MASTER_CLOCK_RATE / 46.0);
    assert_eq!(sim.shared.rates[1].load(Ordering::Relaxed), MASTER_CLOCK_RATE / 46.0);
  }

  #[test]
  fn test_deferred_start_delivers_aligned_ramps() {
    let (dev, _sim, mut streamer) = setup(&[0, 2]);
    let start = dev.get_time_now() + 0.3;
    streamer.issue_stream_cmd(&StreamCmd::num_samps_and_done(5000).at(start));

    let mut bufs = vec![vec![Sc16::default(); 100]; 2];
    let mut refs = bufs.iter_mut().map(|b| b.as_mut_slice()).collect::<Vec<_>>();
    let (n, md) = streamer.recv(&mut refs, 100, Duration::from_millis(100));
    assert_eq!((n, md.error_code), (0, RxErrorCode::Timeout));

    let (out, mds) = recv_all(&mut streamer, Duration::from_secs(1));
    assert_eq!(out[0].len(), 5000);
    assert_eq!(out[1].len(), 5000);
    assert!(mds[0].start_of_burst && mds[0].has_time_spec);
    assert!((mds[0].time_spec.real_secs() - start.real_secs()).abs() < 1e-6);
    assert!(mds.last().unwrap().end_of_burst);

    let first = out[0][0].re as i64;
    for (i, (a, c)) in out[0].iter().zip(&out[1]).enumerate() {
      assert_eq!(a.re as i64, (first + i as i64) % 0x8000);
      assert_eq!(a.re, c.re);
      assert_eq!((a.im, c.im), (0, 2));
    }
  }

  #[test]
  fn test_late_command_is_reported() {
    let (dev, _sim, mut streamer) = setup(&[1]);
    dev.set_time_now(TimeSpec::from_secs(10.0));
    streamer.issue_stream_cmd(&StreamCmd::num_samps_and_done(100).at(TimeSpec::from_secs(9.0)));
    let mut buf = vec![Sc16::default(); 100];
    let (n, md) = streamer.recv(&mut [&mut buf], 100, Duration::from_secs(1));
    assert_eq!((n, md.error_code), (0, RxErrorCode::LateCommand));
    assert!(md.has_time_spec && md.time_spec.real_secs() >= 10.0);
  }

  #[test]
  fn test_drop_after_stops_delivery() {
    let (dev, sim, mut streamer) = setup(&[0]);
    sim.set_drop_after(Some(SIM_SPP as u64));
    streamer.issue_stream_cmd(&StreamCmd::num_samps_and_done(3 * SIM_SPP).at(dev.get_time_now() + 0.05));
    let (out, mds) = recv_all(&mut streamer, Duration::from_secs(1));
    assert_eq!(out[0].len(), SIM_SPP);
    assert_eq!(mds.last().unwrap().error_code, RxErrorCode::Timeout);
  }

  #[test]
  fn test_continuous_stream_until_stopped() {
    let (_dev, _sim, mut streamer) = setup(&[3]);
    streamer.issue_stream_cmd(&StreamCmd::new(StreamMode::StartContinuous));
    let mut buf = vec![Sc16::default(); SIM_SPP];
    for _ in 0..3 {
      let (n, md) = streamer.recv(&mut [&mut buf], SIM_SPP, Duration::from_secs(1));
      assert_eq!((n, md.error_code), (SIM_SPP, RxErrorCode::None));
      assert!(!md.end_of_burst);
    }
    streamer.issue_stream_cmd(&StreamCmd::new(StreamMode::StopContinuous));
  }

  #[test]
  fn test_sink_ids() {
    let tree = Arc::new(default_tree().unwrap());
    let sim = SimulatedCrimson::start(tree).unwrap();
    assert_eq!(sim.sink_channel("rx_a/stream"), Some(0));
    assert_eq!(sim.sink_channel("rx_d/stream"), Some(3));
    assert_eq!(sim.sink_channel("rx_e/stream"), None);
    assert!(sim.issue_stream_cmd("tx_a/stream", &StreamCmd::new(StreamMode::StopContinuous)).is_err());
  }
}
