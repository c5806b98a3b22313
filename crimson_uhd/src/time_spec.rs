use std::cmp::Ordering;
use std::ops::{Add, Sub};
use std::time::Duration;

/// Device time: whole seconds plus a fractional part kept in `[0, 1)`.
///
/// Splitting the value keeps sub-nanosecond precision for timestamps far from the epoch,
/// which a single `f64` of seconds would lose.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TimeSpec {
  full_secs: i64,
  frac_secs: f64,
}

impl TimeSpec {
  pub fn new(full_secs: i64, frac_secs: f64) -> Self {
    let carry = frac_secs.floor();
    let mut ts = Self { full_secs: full_secs + carry as i64, frac_secs: frac_secs - carry };
    // rounding in the subtraction above may produce exactly 1.0
    if ts.frac_secs >= 1.0 {
      ts.full_secs += 1;
      ts.frac_secs -= 1.0;
    }
    ts
  }

  pub fn from_secs(secs: f64) -> Self {
    Self::new(0, secs)
  }

  /// `ticks` counted at `tick_rate` Hz since time zero.
  pub fn from_ticks(ticks: i64, tick_rate: f64) -> Self {
    let rate_i = tick_rate as i64;
    if rate_i > 0 && rate_i as f64 == tick_rate {
      // integer rates (the common case) convert without rounding the whole seconds
      Self::new(ticks.div_euclid(rate_i), ticks.rem_euclid(rate_i) as f64 / tick_rate)
    } else {
      let full = (ticks as f64 / tick_rate).floor();
      let rem_ticks = ticks as f64 - full * tick_rate;
      Self::new(full as i64, rem_ticks / tick_rate)
    }
  }

  pub fn to_ticks(&self, tick_rate: f64) -> i64 {
    self.full_secs.wrapping_mul(tick_rate as i64)
      + ((tick_rate - tick_rate.trunc()) * self.full_secs as f64 + self.frac_secs * tick_rate).round() as i64
  }

  pub fn full_secs(&self) -> i64 {
    self.full_secs
  }

  pub fn frac_secs(&self) -> f64 {
    self.frac_secs
  }

  pub fn real_secs(&self) -> f64 {
    self.full_secs as f64 + self.frac_secs
  }

  /// Duration from `self` until `later`, zero if `later` is not after `self`.
  pub fn duration_until(&self, later: TimeSpec) -> Duration {
    let diff = later - *self;
    if diff.full_secs < 0 {
      Duration::ZERO
    } else {
      Duration::from_secs(diff.full_secs as u64) + Duration::from_secs_f64(diff.frac_secs)
    }
  }
}

impl From<Duration> for TimeSpec {
  fn from(d: Duration) -> Self {
    Self::new(d.as_secs() as i64, d.subsec_nanos() as f64 / 1e9)
  }
}

impl Add for TimeSpec {
  type Output = TimeSpec;
  fn add(self, rhs: TimeSpec) -> TimeSpec {
    TimeSpec::new(self.full_secs + rhs.full_secs, self.frac_secs + rhs.frac_secs)
  }
}

impl Add<f64> for TimeSpec {
  type Output = TimeSpec;
  fn add(self, rhs: f64) -> TimeSpec {
    self + TimeSpec::from_secs(rhs)
  }
}

impl Sub for TimeSpec {
  type Output = TimeSpec;
  fn sub(self, rhs: TimeSpec) -> TimeSpec {
    TimeSpec::new(self.full_secs - rhs.full_secs, self.frac_secs - rhs.frac_secs)
  }
}

impl PartialOrd for TimeSpec {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    match self.full_secs.cmp(&other.full_secs) {
      Ordering::Equal => self.frac_secs.partial_cmp(&other.frac_secs),
      ord => Some(ord),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_normalization() {
    let ts = TimeSpec::new(1, 2.25);
    assert_eq!(ts.full_secs(), 3);
    assert_eq!(ts.frac_secs(), 0.25);
    let neg = TimeSpec::new(0, -0.5);
    assert_eq!(neg.full_secs(), -1);
    assert_eq!(neg.frac_secs(), 0.5);
    assert_eq!(neg.real_secs(), -0.5);
  }

  #[test]
  fn test_ticks_round_trip_integer_rate() {
    let rate = 100e6;
    for ticks in [0i64, 1, 99_999_999, 100_000_000, 1_234_567_890_123] {
      assert_eq!(TimeSpec::from_ticks(ticks, rate).to_ticks(rate), ticks);
    }
    let ts = TimeSpec::from_ticks(150_000_000, rate);
    assert_eq!(ts.full_secs(), 1);
    assert!((ts.frac_secs() - 0.5).abs() < 1e-12);
  }

  #[test]
  fn test_ticks_round_trip_fractional_rate() {
    let rate = 322_265_625.5;
    for ticks in [0i64, 7, 322_265_625, 10_000_000_000] {
      assert_eq!(TimeSpec::from_ticks(ticks, rate).to_ticks(rate), ticks);
    }
  }

  #[test]
  fn test_arithmetic_and_ordering() {
    let now = TimeSpec::new(10, 0.75);
    let later = now + 1.5;
    assert_eq!(later.full_secs(), 12);
    assert!((later.frac_secs() - 0.25).abs() < 1e-12);
    assert!(later > now);
    assert!(now < later);
    let d = now.duration_until(later);
    assert!((d.as_secs_f64() - 1.5).abs() < 1e-9);
    assert_eq!(later.duration_until(now), Duration::ZERO);
  }
}
