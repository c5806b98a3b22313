use std::time::Duration;

use crimson_uhd::{CrimsonTng, RecvPacketStreamer, RxErrorCode, Sc16, StreamCmd};
use log::{debug, error};

/// Padding added to the first receive timeout on top of the start delay.
const TIMEOUT_PADDING: Duration = Duration::from_millis(100);

#[derive(Clone, Debug)]
pub struct AcquisitionParams {
  /// Start this many seconds after the current device time, immediately if not positive.
  pub secs: f64,
  /// Samples per channel.
  pub nsamps: usize,
  /// Print every received packet.
  pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcquisitionReport {
  /// Samples accumulated over all channels.
  pub received: usize,
  pub expected: usize,
}

impl AcquisitionReport {
  pub fn is_complete(&self) -> bool {
    self.received >= self.expected
  }
}

/// Requests `nsamps` samples per channel and collects them until done or until the stream times out.
///
/// A timeout ends the acquisition normally (the shortfall is reported on stderr),
/// any other receiver error aborts it.
pub fn run_acquisition(usrp: &CrimsonTng, rx: &mut RecvPacketStreamer, params: &AcquisitionParams) -> Result<AcquisitionReport, RxErrorCode> {
  let mut stream_cmd = StreamCmd::num_samps_and_done(params.nsamps);
  if params.secs > 0.0 {
    println!();
    println!("Begin streaming {} samples, {} seconds in the future...", params.nsamps, params.secs);
    stream_cmd = stream_cmd.at(usrp.get_time_now() + params.secs);
  }
  rx.issue_stream_cmd(&stream_cmd);

  let spp = rx.get_max_num_samps();
  let num_channels = rx.get_num_channels();
  let mut buffs = vec![vec![Sc16::default(); spp]; num_channels];
  let expected = params.nsamps * num_channels;

  // the first call blocks until the start time has passed
  let mut timeout = Duration::from_secs_f64(params.secs.max(0.0)) + TIMEOUT_PADDING;
  let mut received = 0;
  while received < expected {
    let mut refs = buffs.iter_mut().map(|b| b.as_mut_slice()).collect::<Vec<_>>();
    let (num_rx_samps, md) = rx.recv(&mut refs, spp, timeout);
    println!("received {num_rx_samps} samples");
    timeout = TIMEOUT_PADDING;

    match md.error_code {
      RxErrorCode::None => {}
      RxErrorCode::Timeout => break,
      other => {
        error!("Receiver error {}", md.strerror());
        return Err(other);
      }
    }
    if params.verbose {
      println!(
        "Received packet: {num_rx_samps} samples, {} full secs, {:.6} frac secs",
        md.time_spec.full_secs(),
        md.time_spec.frac_secs()
      );
    }
    received += num_rx_samps * num_channels;
  }
  debug!("accumulated {received} of {expected} samples");

  if received < expected {
    eprintln!("Receive timeout before all samples received...");
  }
  Ok(AcquisitionReport { received, expected })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crimson_uhd::sim::{default_tree, SimulatedCrimson};
  use crimson_uhd::{DeviceAddr, DeviceControl, StreamArgs, TimeSpec};
  use std::sync::Arc;

  /// Simulated device whose reported time stays at 1 s while its own clock runs ahead.
  struct LaggingClock(Arc<SimulatedCrimson>);

  impl DeviceControl for LaggingClock {
    fn issue_stream_cmd(&self, sink_id: &str, cmd: &StreamCmd) -> std::io::Result<()> {
      self.0.issue_stream_cmd(sink_id, cmd)
    }
    fn get_time_now(&self) -> TimeSpec {
      TimeSpec::from_secs(1.0)
    }
    fn set_time_now(&self, time: TimeSpec) {
      self.0.set_time_now(time)
    }
    fn time_diff_converged(&self) -> bool {
      self.0.time_diff_converged()
    }
  }

  fn acquire(addr: &str, channels: &[usize], secs: f64, nsamps: usize) -> Result<AcquisitionReport, RxErrorCode> {
    let usrp = CrimsonTng::make(&DeviceAddr::parse(addr)).unwrap();
    let mut rx = usrp.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels(channels.to_vec())).unwrap();
    run_acquisition(&usrp, &mut rx, &AcquisitionParams { secs, nsamps, verbose: false })
  }

  #[test]
  fn test_timed_acquisition_on_four_channels() {
    let report = acquire("type=sim", &[0, 1, 2, 3], 1.5, 10000).unwrap();
    assert_eq!(report, AcquisitionReport { received: 40000, expected: 40000 });
    assert!(report.is_complete());
  }

  #[test]
  fn test_immediate_start() {
    let report = acquire("", &[2], 0.0, 3000).unwrap();
    assert_eq!(report.received, 3000);
  }

  #[test]
  fn test_stream_stopping_midway_is_a_shortfall() {
    let report = acquire("type=sim,drop_after=2245", &[0, 1], 0.2, 10000).unwrap();
    assert_eq!(report.received, 2 * 2245);
    assert_eq!(report.expected, 20000);
    assert!(!report.is_complete());
  }

  #[test]
  fn test_late_start_aborts_the_run() {
    let tree = Arc::new(default_tree().unwrap());
    let sim = SimulatedCrimson::start(tree.clone()).unwrap();
    sim.set_time_now(TimeSpec::from_secs(10.0));
    let usrp = CrimsonTng::new(tree, Arc::new(LaggingClock(sim)));
    let mut rx = usrp.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels(vec![0, 1])).unwrap();
    let result = run_acquisition(&usrp, &mut rx, &AcquisitionParams { secs: 0.2, nsamps: 10000, verbose: false });
    assert_eq!(result, Err(RxErrorCode::LateCommand));
  }
}
