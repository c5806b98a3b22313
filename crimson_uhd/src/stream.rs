use thiserror::Error;

use crate::device_addr::DeviceAddr;
use crate::time_spec::TimeSpec;

/// Everything needed to build a streamer: sample formats, channel list and extra options.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamArgs {
  /// Host sample format, e.g. `"fc32"`.
  pub cpu_format: String,
  /// Over-the-wire sample format, e.g. `"sc16"`.
  pub otw_format: String,
  /// Extra options, e.g. `spp=1000`.
  pub args: DeviceAddr,
  /// Device channel indices. Empty means channel 0.
  pub channels: Vec<usize>,
}

impl StreamArgs {
  pub fn new(cpu_format: &str, otw_format: &str) -> Self {
    Self { cpu_format: cpu_format.to_owned(), otw_format: otw_format.to_owned(), ..Default::default() }
  }

  pub fn with_channels(mut self, channels: impl Into<Vec<usize>>) -> Self {
    self.channels = channels.into();
    self
  }

  pub fn with_arg(mut self, key: &str, value: impl ToString) -> Self {
    self.args.set(key, value);
    self
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
  StartContinuous,
  StopContinuous,
  /// Stream `num_samps` samples, then end the burst.
  NumSampsAndDone,
  /// Stream `num_samps` samples and expect another command to continue the burst.
  NumSampsAndMore,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StreamCmd {
  pub stream_mode: StreamMode,
  pub num_samps: usize,
  /// Start as soon as the command arrives, `time_spec` is ignored.
  pub stream_now: bool,
  pub time_spec: TimeSpec,
}

impl StreamCmd {
  pub fn new(stream_mode: StreamMode) -> Self {
    Self { stream_mode, num_samps: 0, stream_now: true, time_spec: TimeSpec::default() }
  }

  pub fn num_samps_and_done(num_samps: usize) -> Self {
    Self { num_samps, ..Self::new(StreamMode::NumSampsAndDone) }
  }

  /// Defers the start of streaming to the device time `time_spec`.
  pub fn at(mut self, time_spec: TimeSpec) -> Self {
    self.stream_now = false;
    self.time_spec = time_spec;
    self
  }
}

/// Error codes reported in [`RxMetadata`]. Discriminants match the codes carried in context packets.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RxErrorCode {
  #[default]
  #[error("no error")]
  None = 0x0,
  #[error("timeout: no packet received")]
  Timeout = 0x1,
  #[error("late command: stream command arrived after its start time")]
  LateCommand = 0x2,
  #[error("broken chain: expected another stream command")]
  BrokenChain = 0x4,
  #[error("overflow: device could not keep up")]
  Overflow = 0x8,
  #[error("alignment: channels could not be time-aligned")]
  Alignment = 0xc,
  #[error("bad packet: could not parse")]
  BadPacket = 0xf,
}

impl RxErrorCode {
  pub fn from_code(code: u32) -> Option<Self> {
    Some(match code {
      0x0 => Self::None,
      0x1 => Self::Timeout,
      0x2 => Self::LateCommand,
      0x4 => Self::BrokenChain,
      0x8 => Self::Overflow,
      0xc => Self::Alignment,
      0xf => Self::BadPacket,
      _ => return None,
    })
  }
}

/// Filled in by every `recv` call.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct RxMetadata {
  pub error_code: RxErrorCode,
  pub has_time_spec: bool,
  /// Time of the first sample in the returned buffers.
  pub time_spec: TimeSpec,
  pub start_of_burst: bool,
  pub end_of_burst: bool,
  /// The packet did not fit into the buffers, the rest is returned by the next `recv`.
  pub more_fragments: bool,
  /// Offset in samples of this fragment within its packet.
  pub fragment_offset: usize,
  /// A gap in packet sequence numbers was detected before this packet.
  pub out_of_sequence: bool,
}

impl RxMetadata {
  pub fn error(error_code: RxErrorCode) -> Self {
    Self { error_code, ..Default::default() }
  }

  pub fn strerror(&self) -> String {
    self.error_code.to_string()
  }
}
