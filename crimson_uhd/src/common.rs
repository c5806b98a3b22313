use bytemuck::{Pod, Zeroable};

pub use log::{debug, error, info, trace, warn};

/// Complex sample with 16-bit signed components, host format `sc16`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Sc16 {
  pub re: i16,
  pub im: i16,
}

/// Complex sample with 32-bit float components, host format `fc32`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Fc32 {
  pub re: f32,
  pub im: f32,
}

/// Complex sample with 64-bit float components, host format `fc64`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Fc64 {
  pub re: f64,
  pub im: f64,
}

impl Sc16 {
  pub const fn new(re: i16, im: i16) -> Self {
    Self { re, im }
  }
}

/// Host sample types a receive buffer can be made of.
pub trait HostSample: Pod {
  /// Name of the host format, as passed in `StreamArgs::cpu_format`.
  const FORMAT: &'static str;
}

impl HostSample for Sc16 {
  const FORMAT: &'static str = "sc16";
}
impl HostSample for Fc32 {
  const FORMAT: &'static str = "fc32";
}
impl HostSample for Fc64 {
  const FORMAT: &'static str = "fc64";
}

pub trait LogAndForget {
  fn log_and_forget(&self);
}

impl<T, E: std::fmt::Debug> LogAndForget for Result<T, E> {
  fn log_and_forget(&self) {
    if let Err(e) = self {
      warn!("Encountered error {e:?} at {:?}", std::backtrace::Backtrace::capture());
    }
  }
}
