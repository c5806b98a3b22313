use crate::common::*;
use crate::convert::{get_bytes_per_item, get_converter, ConvertId, ITEM32_BE_SUFFIX};
use crate::device_addr::DeviceAddr;
use crate::error::{ConfigurationError, PropertyError, Result};
use crate::net_utils::MTU;
use crate::property_tree::{FsPath, PropertyTree, PropertyTreeExt};
use crate::recv_packet_streamer::{RecvPacketStreamer, DEFAULT_CHANNEL_SKEW_TIMEOUT};
use crate::sim::{default_tree, SimulatedCrimson};
use crate::stream::{StreamArgs, StreamCmd};
use crate::time_spec::TimeSpec;
use crate::udp_zero_copy::{BuffParams, UdpStreamZeroCopy, ZeroCopyXportParams};
use crate::vrt::{if_hdr_unpack_be, MAX_IF_HDR_WORDS32};

use std::collections::BTreeSet;
use std::env;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;

/// Selects every channel in per-channel setters.
pub const ALL_CHANS: usize = usize::MAX;

/// The only wire format the device streams.
const OTW_FORMAT: &str = "sc16";

/// VITA header bytes of a data packet: the largest header plus the trailer,
/// minus the class id and integer timestamp the device never sends.
pub const RX_HEADER_SIZE: usize = MAX_IF_HDR_WORDS32 * 4 + 4 - 8 - 4;

/// Largest payload of a UDP datagram over IPv4.
const MAX_UDP_PAYLOAD: usize = 65507;

/// Device-side operations that don't go through the property tree.
pub trait DeviceControl: Send + Sync {
  /// Delivers `cmd` to the stream command sink `sink_id`, e.g. `"rx_a/stream"`.
  fn issue_stream_cmd(&self, sink_id: &str, cmd: &StreamCmd) -> std::io::Result<()>;
  fn get_time_now(&self) -> TimeSpec;
  fn set_time_now(&self, time: TimeSpec);
  /// Whether the host/device time difference loop has settled.
  fn time_diff_converged(&self) -> bool;
}

#[derive(Clone, Debug, PartialEq)]
pub struct RxStreamConfig {
  pub num_recv_frames: usize,
  /// Kernel receive buffer per channel socket, 0 keeps the system default.
  pub recv_buff_size: usize,
  /// Sleep after powering on each channel.
  pub power_settle: Duration,
  pub convergence_poll_interval: Duration,
  pub convergence_max_attempts: usize,
  /// Defaults to a whole frame pool's worth of packets per channel.
  pub alignment_failure_threshold: Option<usize>,
  pub channel_skew_timeout: Duration,
}

impl Default for RxStreamConfig {
  fn default() -> Self {
    Self {
      num_recv_frames: 32,
      recv_buff_size: 4 * 1024 * 1024,
      power_settle: Duration::ZERO,
      convergence_poll_interval: Duration::from_millis(10),
      convergence_max_attempts: 500,
      alignment_failure_threshold: None,
      channel_skew_timeout: DEFAULT_CHANNEL_SKEW_TIMEOUT,
    }
  }
}

fn env_override<T: FromStr>(name: &str) -> Option<T> {
  let value = env::var(name).ok()?;
  match value.parse() {
    Ok(v) => Some(v),
    Err(_) => {
      warn!("ignoring invalid {name}={value:?}");
      None
    }
  }
}

impl RxStreamConfig {
  /// Defaults, overridden by `CRIMSON_NUM_RECV_FRAMES`, `CRIMSON_RECV_BUFF_SIZE` and `CRIMSON_POWER_SETTLE_MS`.
  pub fn from_env() -> Self {
    let mut config = Self::default();
    if let Some(frames) = env_override("CRIMSON_NUM_RECV_FRAMES") {
      config.num_recv_frames = frames;
    }
    if let Some(size) = env_override("CRIMSON_RECV_BUFF_SIZE") {
      config.recv_buff_size = size;
    }
    if let Some(ms) = env_override("CRIMSON_POWER_SETTLE_MS") {
      config.power_settle = Duration::from_millis(ms);
    }
    config
  }
}

struct Endpoint {
  letter: char,
  addr: SocketAddr,
  iface: String,
}

fn chan_letter(index: usize) -> char {
  (b'A' + index as u8) as char
}

fn sink_id(index: usize) -> String {
  format!("rx_{}/stream", chan_letter(index).to_ascii_lowercase())
}

pub struct CrimsonTng {
  tree: Arc<dyn PropertyTree>,
  ctrl: Arc<dyn DeviceControl>,
  config: RxStreamConfig,
  mb_path: FsPath,
}

impl CrimsonTng {
  pub fn new(tree: Arc<dyn PropertyTree>, ctrl: Arc<dyn DeviceControl>) -> Self {
    Self { tree, ctrl, config: RxStreamConfig::from_env(), mb_path: FsPath::new("/mboards/0") }
  }

  /// Opens the device described by `addr`. Only the simulated device (`type=sim`, the default) is available,
  /// `drop_after=N` makes it stop delivering data after N samples of every burst.
  pub fn make(addr: &DeviceAddr) -> Result<Self> {
    match addr.get("type").unwrap_or("sim") {
      "sim" => {
        let tree = Arc::new(default_tree()?);
        let sim = SimulatedCrimson::start(tree.clone())?;
        if addr.has_key("drop_after") {
          sim.set_drop_after(Some(addr.cast::<u64>("drop_after", 0)?));
        }
        Ok(Self::new(tree, sim))
      }
      _ => Err(ConfigurationError::NoDevice(addr.to_string())),
    }
  }

  pub fn with_config(mut self, config: RxStreamConfig) -> Self {
    self.config = config;
    self
  }

  pub fn tree(&self) -> &Arc<dyn PropertyTree> {
    &self.tree
  }

  fn link_path(&self, index: usize) -> FsPath {
    &self.mb_path / "rx_link" / format!("Channel_{}", chan_letter(index))
  }

  fn rate_path(&self, index: usize) -> FsPath {
    &self.mb_path / "rx_dsps" / format!("Channel_{}", chan_letter(index)) / "rate/value"
  }

  pub fn get_rx_num_channels(&self) -> usize {
    self.tree.list((&self.mb_path / "rx_link").as_str()).iter().filter(|name| name.starts_with("Channel_")).count()
  }

  fn check_channel(&self, chan: usize) -> std::result::Result<usize, PropertyError> {
    if chan < self.get_rx_num_channels() {
      Ok(chan)
    } else {
      Err(PropertyError::PathNotFound(format!("{}/rx_dsps/<channel {chan}>", self.mb_path)))
    }
  }

  fn channels_or_all(&self, chan: usize) -> std::result::Result<Vec<usize>, PropertyError> {
    if chan == ALL_CHANS {
      Ok((0..self.get_rx_num_channels()).collect())
    } else {
      Ok(vec![self.check_channel(chan)?])
    }
  }

  /// Requests `rate` samples per second on `chan` (or [`ALL_CHANS`]), the device may coerce it.
  pub fn set_rx_rate(&self, rate: f64, chan: usize) -> std::result::Result<(), PropertyError> {
    for index in self.channels_or_all(chan)? {
      self.tree.set(self.rate_path(index), rate)?;
    }
    Ok(())
  }

  pub fn get_rx_rate(&self, chan: usize) -> std::result::Result<f64, PropertyError> {
    let index = self.check_channel(if chan == ALL_CHANS { 0 } else { chan })?;
    self.tree.get(self.rate_path(index))
  }

  pub fn get_time_now(&self) -> TimeSpec {
    self.ctrl.get_time_now()
  }

  pub fn set_time_now(&self, time: TimeSpec) {
    self.ctrl.set_time_now(time)
  }

  /// Human readable summary of the device.
  pub fn get_pp_string(&self) -> String {
    let name = self.tree.get::<String>(&self.mb_path / "name").unwrap_or_else(|_| "Crimson TNG".to_owned());
    let mut s = format!("Single Crimson TNG Device\n  Mboard 0: {name}\n");
    if let Ok(tick_rate) = self.tree.get::<f64>(&self.mb_path / "tick_rate") {
      s += &format!("    Tick rate: {:.3} MHz\n", tick_rate / 1e6);
    }
    for index in 0..self.get_rx_num_channels() {
      let link = self.link_path(index);
      let ip = self.tree.get::<String>(&link / "ip_dest").unwrap_or_default();
      let port = self.tree.get::<String>(&link / "port").unwrap_or_default();
      let rate = self.get_rx_rate(index).map(|r| format!("{:.6} Msps", r / 1e6)).unwrap_or_else(|_| "unknown rate".to_owned());
      s += &format!("    RX Channel {}: {rate}, endpoint {ip}:{port}\n", chan_letter(index));
    }
    s
  }

  fn validate_channels(&self, channels: &[usize]) -> Result<()> {
    let available = self.get_rx_num_channels();
    let mut seen = BTreeSet::new();
    for &index in channels {
      if index >= available {
        return Err(ConfigurationError::InvalidChannel { index, available });
      }
      if !seen.insert(index) {
        return Err(ConfigurationError::DuplicateChannel(index));
      }
    }
    Ok(())
  }

  fn resolve_endpoint(&self, index: usize) -> Result<Endpoint> {
    let letter = chan_letter(index);
    let link = self.link_path(index);
    let port = self.tree.get::<String>(&link / "port")?;
    let ip = self.tree.get::<String>(&link / "ip_dest")?;
    let iface = self.tree.get::<String>(&link / "iface")?;
    let port: u16 = port
      .trim()
      .parse()
      .map_err(|_| ConfigurationError::InvalidEndpoint { channel: letter, reason: format!("bad port {port:?}") })?;
    let ip: IpAddr = ip
      .trim()
      .parse()
      .map_err(|_| ConfigurationError::InvalidEndpoint { channel: letter, reason: format!("bad address {ip:?}") })?;
    Ok(Endpoint { letter, addr: SocketAddr::new(ip, port), iface })
  }

  fn wait_for_time_convergence(&self) -> Result<()> {
    for attempt in 0..self.config.convergence_max_attempts {
      if self.ctrl.time_diff_converged() {
        if attempt > 0 {
          debug!("device time converged after {attempt} polls");
        }
        return Ok(());
      }
      std::thread::sleep(self.config.convergence_poll_interval);
    }
    Err(ConfigurationError::TimeNotConverged { attempts: self.config.convergence_max_attempts })
  }

  /// Powers on the requested channels and binds a transport to each of them.
  ///
  /// Every argument and endpoint is checked before anything is written to the device.
  pub fn get_rx_stream(&self, args: &StreamArgs) -> Result<RecvPacketStreamer> {
    let mut args = args.clone();
    if !args.otw_format.is_empty() && args.otw_format != OTW_FORMAT {
      warn!("wire format {} not supported by the device, using {OTW_FORMAT}", args.otw_format);
    }
    args.otw_format = OTW_FORMAT.to_owned();
    if args.channels.is_empty() {
      args.channels = vec![0];
    }
    self.validate_channels(&args.channels)?;

    let convert_id = ConvertId::new(args.otw_format.clone() + ITEM32_BE_SUFFIX, args.cpu_format.clone());
    let converter = get_converter(&convert_id)?;

    let bpp = MTU - RX_HEADER_SIZE;
    let bpi = get_bytes_per_item(&args.otw_format)?;
    let spp_arg = args.args.cast::<f64>("spp", (bpp / bpi) as f64)?;
    let packet_size = Some(spp_arg)
      .filter(|spp| spp.is_finite() && *spp >= 1.0)
      .and_then(|spp| (spp as usize).checked_mul(bpi))
      .and_then(|bytes| bytes.checked_add(RX_HEADER_SIZE))
      .filter(|&size| size <= MAX_UDP_PAYLOAD);
    let Some(packet_size) = packet_size else {
      return Err(ConfigurationError::InvalidStreamArg {
        key: "spp".to_owned(),
        value: args.args.get("spp").unwrap_or_default().to_owned(),
      });
    };
    let spp = spp_arg as usize;

    let endpoints = args.channels.iter().map(|&index| self.resolve_endpoint(index)).collect::<Result<Vec<_>>>()?;
    let tick_rate = self.tree.get::<f64>(&self.mb_path / "tick_rate")?;

    let xport_params = ZeroCopyXportParams {
      recv_frame_size: MTU.max(packet_size),
      num_recv_frames: self.config.num_recv_frames,
      send_frame_size: 0,
      num_send_frames: 0,
    };
    let buff_params = BuffParams { recv_buff_size: self.config.recv_buff_size, send_buff_size: 0 };
    info!(
      "creating RX streamer on channels {} ({convert_id}, {spp} samples per packet)",
      args.channels.iter().map(|&i| chan_letter(i)).join(",")
    );

    let mut streamer = RecvPacketStreamer::new(spp, convert_id, converter);
    streamer.set_vrt_unpacker(if_hdr_unpack_be);
    for (&index, endpoint) in args.channels.iter().zip(&endpoints) {
      let link = self.link_path(index);
      self.tree.set(&self.mb_path / "rx" / format!("Channel_{}", endpoint.letter) / "pwr", "1".to_owned())?;
      if !self.config.power_settle.is_zero() {
        std::thread::sleep(self.config.power_settle);
      }
      self.tree.set(&link / "vita_en", "1".to_owned())?;
      self.tree.set(&link / "stream", "1".to_owned())?;

      let mut xport = UdpStreamZeroCopy::make(endpoint.addr, xport_params, buff_params)?;
      if endpoint.addr.port() == 0 {
        self.tree.set(&link / "port", xport.local_addr().port().to_string())?;
      }
      xport.flush();
      debug!("channel {} listening on {} ({})", endpoint.letter, xport.local_addr(), endpoint.iface);
      streamer.add_channel(Box::new(xport), self.ctrl.clone(), sink_id(index));
    }

    for &index in &args.channels {
      self.tree.update(self.rate_path(index).as_str())?;
    }
    streamer.set_samp_rate(self.tree.get::<f64>(self.rate_path(args.channels[0]))?);
    streamer.set_tick_rate(tick_rate);
    streamer.set_alignment_failure_threshold(
      self.config.alignment_failure_threshold.unwrap_or(self.config.num_recv_frames * args.channels.len()),
    );
    streamer.set_channel_skew_timeout(self.config.channel_skew_timeout);

    self.wait_for_time_convergence()?;
    Ok(streamer)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::property_tree::MemoryPropertyTree;
  use std::sync::atomic::{AtomicUsize, Ordering};

  struct FakeControl {
    converged: bool,
  }

  impl DeviceControl for FakeControl {
    fn issue_stream_cmd(&self, _sink_id: &str, _cmd: &StreamCmd) -> std::io::Result<()> {
      Ok(())
    }
    fn get_time_now(&self) -> TimeSpec {
      TimeSpec::from_secs(3.0)
    }
    fn set_time_now(&self, _time: TimeSpec) {}
    fn time_diff_converged(&self) -> bool {
      self.converged
    }
  }

  fn device(converged: bool) -> (CrimsonTng, Arc<MemoryPropertyTree>, Arc<AtomicUsize>) {
    let tree = Arc::new(default_tree().unwrap());
    let writes = Arc::new(AtomicUsize::new(0));
    for letter in ['A', 'B', 'C', 'D'] {
      for path in [
        format!("/mboards/0/rx/Channel_{letter}/pwr"),
        format!("/mboards/0/rx_link/Channel_{letter}/vita_en"),
        format!("/mboards/0/rx_link/Channel_{letter}/stream"),
      ] {
        let writes = writes.clone();
        tree.add_subscriber(&path, move |_| {
          writes.fetch_add(1, Ordering::SeqCst);
        });
      }
    }
    let config = RxStreamConfig {
      convergence_poll_interval: Duration::from_millis(1),
      convergence_max_attempts: 3,
      ..Default::default()
    };
    let dev = CrimsonTng::new(tree.clone(), Arc::new(FakeControl { converged })).with_config(config);
    (dev, tree, writes)
  }

  #[test]
  fn test_header_size() {
    assert_eq!(RX_HEADER_SIZE, 20);
  }

  #[test]
  fn test_num_channels_and_pp_string() {
    let (dev, _, _) = device(true);
    assert_eq!(dev.get_rx_num_channels(), 4);
    let pp = dev.get_pp_string();
    assert!(pp.starts_with("Single Crimson TNG Device"));
    assert!(pp.contains("RX Channel D"));
    assert_eq!(dev.get_time_now(), TimeSpec::from_secs(3.0));
  }

  #[test]
  fn test_rejected_arguments_leave_no_writes() {
    let (dev, _, writes) = device(true);
    let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels([0, 7])).err().unwrap();
    assert!(matches!(err, ConfigurationError::InvalidChannel { index: 7, available: 4 }));
    let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels([1, 1])).err().unwrap();
    assert!(matches!(err, ConfigurationError::DuplicateChannel(1)));
    let err = dev.get_rx_stream(&StreamArgs::new("sc8", "sc16")).err().unwrap();
    assert!(matches!(err, ConfigurationError::NoConverter { .. }));
    let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_arg("spp", 0)).err().unwrap();
    assert!(matches!(err, ConfigurationError::InvalidStreamArg { .. }));
    let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_arg("spp", "many")).err().unwrap();
    assert!(matches!(err, ConfigurationError::InvalidStreamArg { .. }));
    assert_eq!(writes.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_oversized_spp_is_rejected() {
    let (dev, _, writes) = device(true);
    for spp in ["20000", "1e20", "inf"] {
      let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_arg("spp", spp)).err().unwrap();
      assert!(matches!(err, ConfigurationError::InvalidStreamArg { ref key, .. } if key == "spp"));
    }
    assert_eq!(writes.load(Ordering::SeqCst), 0);
    // (65507 - 20) / 4 still fits in one datagram
    let streamer = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_arg("spp", 16371)).unwrap();
    assert_eq!(streamer.get_max_num_samps(), 16371);
  }

  #[test]
  fn test_rate_of_unknown_channel_is_an_error() {
    let (dev, _, _) = device(true);
    assert!(matches!(dev.get_rx_rate(200), Err(PropertyError::PathNotFound(_))));
    assert!(matches!(dev.set_rx_rate(1e6, 4), Err(PropertyError::PathNotFound(_))));
    dev.set_rx_rate(1e6, ALL_CHANS).unwrap();
    assert!(dev.get_rx_rate(ALL_CHANS).is_ok());
  }

  #[test]
  fn test_bad_endpoint_is_detected_before_writes() {
    let (dev, tree, writes) = device(true);
    tree.set("/mboards/0/rx_link/Channel_B/ip_dest", "not-an-ip".to_owned()).unwrap();
    let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels([0, 1])).err().unwrap();
    assert!(matches!(err, ConfigurationError::InvalidEndpoint { channel: 'B', .. }));
    assert_eq!(writes.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_binds_channels_with_default_spp() {
    let (dev, tree, writes) = device(true);
    let streamer = dev.get_rx_stream(&StreamArgs::new("fc32", "sc16").with_channels([0, 2])).unwrap();
    assert_eq!(streamer.get_num_channels(), 2);
    assert_eq!(streamer.get_max_num_samps(), (9000 - 20) / 4);
    assert_eq!(writes.load(Ordering::SeqCst), 6);
    assert!(tree.get::<bool>("/mboards/0/rx/Channel_C/pwr").unwrap());
    assert!(!tree.get::<bool>("/mboards/0/rx/Channel_B/pwr").unwrap());
    let port: u16 = tree.get::<String>("/mboards/0/rx_link/Channel_A/port").unwrap().parse().unwrap();
    assert_ne!(port, 0);
  }

  #[test]
  fn test_spp_override_and_default_channel() {
    let (dev, _, _) = device(true);
    let streamer = dev.get_rx_stream(&StreamArgs::new("sc16", "").with_arg("spp", 1000)).unwrap();
    assert_eq!(streamer.get_max_num_samps(), 1000);
    assert_eq!(streamer.get_num_channels(), 1);
  }

  #[test]
  fn test_make_from_address() {
    let dev = CrimsonTng::make(&DeviceAddr::parse("type=sim")).unwrap();
    assert_eq!(dev.get_rx_num_channels(), 4);
    assert!(matches!(CrimsonTng::make(&DeviceAddr::parse("type=usb")), Err(ConfigurationError::NoDevice(_))));
    assert!(matches!(
      CrimsonTng::make(&DeviceAddr::parse("drop_after=lots")),
      Err(ConfigurationError::InvalidStreamArg { .. })
    ));
  }

  #[test]
  fn test_time_not_converged() {
    let (dev, _, _) = device(false);
    let err = dev.get_rx_stream(&StreamArgs::new("sc16", "sc16")).err().unwrap();
    assert!(matches!(err, ConfigurationError::TimeNotConverged { attempts: 3 }));
  }
}
