use std::error::Error;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use log::error;

use crimson_uhd::utils::set_thread_priority_safe;
use crimson_uhd::{CrimsonTng, DeviceAddr, StreamArgs, ALL_CHANS};

mod acquisition;

use acquisition::{run_acquisition, AcquisitionParams};

#[derive(Parser, Debug)]
#[command(author, version, about = "Receive a timed burst of samples from a Crimson TNG", long_about = None, disable_help_flag = true)]
struct Args {
  /// single device address args
  #[arg(long, default_value = "")]
  args: String,
  /// number of seconds in the future to receive
  #[arg(long, default_value_t = 1.5)]
  secs: f64,
  /// total number of samples to receive
  #[arg(long, default_value_t = 10000)]
  nsamps: usize,
  /// rate of incoming samples
  #[arg(long, default_value_t = 100e6 / 16.0)]
  rate: f64,
  /// which channel(s) to use (specify "0", "1", "0,1", etc)
  #[arg(long, default_value = "0,1,2,3")]
  channels: String,
  /// don't print every received packet
  #[arg(long)]
  dilv: bool,
  /// help message
  #[arg(long)]
  help: bool,
}

fn parse_channels(list: &str) -> Result<Vec<usize>, String> {
  list
    .split(|c| c == '"' || c == '\'' || c == ',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(|s| s.parse().map_err(|_| format!("invalid channel {s:?}")))
    .collect()
}

fn run(args: &Args) -> Result<(), Box<dyn Error>> {
  println!();
  println!("Creating the usrp device with: {}...", args.args);
  let usrp = CrimsonTng::make(&DeviceAddr::parse(&args.args))?;
  println!("Using Device: {}", usrp.get_pp_string());

  let channels = parse_channels(&args.channels)?;
  if channels.iter().any(|&ch| ch >= usrp.get_rx_num_channels()) {
    return Err("Invalid channel(s) specified.".into());
  }

  println!("Setting RX Rate: {:.6} Msps...", args.rate / 1e6);
  usrp.set_rx_rate(args.rate, ALL_CHANS)?;
  println!("Actual RX Rate: {:.6} Msps...", usrp.get_rx_rate(ALL_CHANS)? / 1e6);
  println!();

  let mut rx = usrp.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels(channels))?;
  let params = AcquisitionParams { secs: args.secs, nsamps: args.nsamps, verbose: !args.dilv };
  let report = run_acquisition(&usrp, &mut rx, &params)?;

  println!();
  println!("Done!");
  println!();
  println!("received {}", report.received);
  Ok(())
}

fn main() -> ExitCode {
  let logenv = env_logger::Env::default().default_filter_or("info");
  env_logger::init_from_env(logenv);

  let args = Args::parse();
  if args.help {
    println!("Crimson RX Timed Samples {}", Args::command().render_help());
    return ExitCode::from(255);
  }

  set_thread_priority_safe();

  match run(&args) {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      error!("{e}");
      ExitCode::FAILURE
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let args = Args::parse_from(["rx_timed_samples"]);
    assert_eq!(args.args, "");
    assert_eq!(args.secs, 1.5);
    assert_eq!(args.nsamps, 10000);
    assert_eq!(args.rate, 6.25e6);
    assert_eq!(args.channels, "0,1,2,3");
    assert!(!args.dilv && !args.help);
  }

  #[test]
  fn test_help_is_a_plain_flag() {
    let args = Args::parse_from(["rx_timed_samples", "--help", "--channels", "1"]);
    assert!(args.help);
    assert_eq!(args.channels, "1");
  }

  #[test]
  fn test_parse_channels() {
    assert_eq!(parse_channels("0,1,2,3").unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(parse_channels("\"2\"").unwrap(), vec![2]);
    assert!(parse_channels("0,x").is_err());
  }
}
