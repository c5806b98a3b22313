use std::fmt::Display;
use std::mem::size_of;

use crate::common::*;
use crate::error::ConfigurationError;

/// Suffix of wire formats carried as big-endian 32-bit items, e.g. `sc16_item32_be`.
pub const ITEM32_BE_SUFFIX: &str = "_item32_be";

/// Size in bytes of one sample of `format`.
pub fn get_bytes_per_item(format: &str) -> Result<usize, ConfigurationError> {
  let base = format.strip_suffix(ITEM32_BE_SUFFIX).unwrap_or(format);
  Ok(match base {
    "s8" => 1,
    "sc8" | "s16" => 2,
    "sc12" => 3,
    "sc16" | "f32" => 4,
    "fc32" => 8,
    "fc64" => 16,
    _ => return Err(ConfigurationError::UnknownFormat(format.to_owned())),
  })
}

/// Identifies a conversion between two sample formats.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvertId {
  pub input_format: String,
  pub num_inputs: usize,
  pub output_format: String,
  pub num_outputs: usize,
}

impl ConvertId {
  pub fn new(input_format: impl Into<String>, output_format: impl Into<String>) -> Self {
    Self { input_format: input_format.into(), num_inputs: 1, output_format: output_format.into(), num_outputs: 1 }
  }
}

impl Display for ConvertId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}_{}_{}_{}", self.input_format, self.num_inputs, self.output_format, self.num_outputs)
  }
}

pub trait Converter: Send {
  fn input_bytes_per_item(&self) -> usize;
  fn output_bytes_per_item(&self) -> usize;
  /// Converts the first `nsamps` samples of `input` into `output`.
  /// Both slices must hold at least `nsamps` samples of their format.
  fn convert(&self, input: &[u8], output: &mut [u8], nsamps: usize);
}

pub struct SamplesReader<'a> {
  pub bytes: &'a [u8],
  pub read_pos: usize,
  pub stride: usize,
  pub remaining_samples: usize,
}

impl<'a> SamplesReader<'a> {
  pub fn new(bytes: &'a [u8], stride: usize, samples: usize) -> Self {
    Self { bytes, read_pos: 0, stride, remaining_samples: samples }
  }
  #[inline(always)]
  fn get_next_bytes(&mut self, count: usize) -> Option<&'a [u8]> {
    if self.remaining_samples == 0 || self.read_pos + count > self.bytes.len() {
      return None;
    }
    let r = &self.bytes[self.read_pos..self.read_pos + count];
    self.read_pos += self.stride;
    self.remaining_samples -= 1;
    return Some(r);
  }
  #[inline(always)]
  fn size_hint(&self) -> (usize, Option<usize>) {
    let fitting = self.bytes.len().saturating_sub(self.read_pos).div_ceil(self.stride.max(1));
    let size = self.remaining_samples.min(fitting);
    (size, Some(size))
  }
}

/// Reads `sc16` samples packed as big-endian 32-bit items, I in the upper half.
pub struct Sc16Item32BeIterator<'a>(pub SamplesReader<'a>);

impl<'a> Iterator for Sc16Item32BeIterator<'a> {
  type Item = Sc16;
  #[inline(always)]
  fn next(&mut self) -> Option<Sc16> {
    self.0.get_next_bytes(4).map(|b| Sc16::new(i16::from_be_bytes([b[0], b[1]]), i16::from_be_bytes([b[2], b[3]])))
  }
  #[inline(always)]
  fn size_hint(&self) -> (usize, Option<usize>) {
    self.0.size_hint()
  }
}
impl<'a> ExactSizeIterator for Sc16Item32BeIterator<'a> {}

/// Writes `src` as big-endian `sc16` 32-bit items into `dst`, returns the number of samples written.
pub fn write_sc16_item32_be<'a>(src: impl IntoIterator<Item = &'a Sc16>, dst: &mut [u8]) -> usize {
  let mut written = 0;
  for (sample, out) in src.into_iter().zip(dst.chunks_exact_mut(4)) {
    out[0..2].copy_from_slice(&sample.re.to_be_bytes());
    out[2..4].copy_from_slice(&sample.im.to_be_bytes());
    written += 1;
  }
  written
}

/// Scale applied when converting 16-bit integers to floats.
pub const SC16_FLOAT_SCALE: f64 = 1.0 / 32767.0;

macro_rules! item32_be_converter {
  ($name: ident, $out_type: ty, $to_host: expr) => {
    pub struct $name;
    impl Converter for $name {
      fn input_bytes_per_item(&self) -> usize {
        4
      }
      fn output_bytes_per_item(&self) -> usize {
        size_of::<$out_type>()
      }
      #[inline(always)]
      fn convert(&self, input: &[u8], output: &mut [u8], nsamps: usize) {
        let reader = Sc16Item32BeIterator(SamplesReader::new(input, 4, nsamps));
        for (sample, out) in reader.zip(output.chunks_exact_mut(size_of::<$out_type>())) {
          let host: $out_type = $to_host(sample);
          out.copy_from_slice(bytemuck::bytes_of(&host));
        }
      }
    }
  };
}

item32_be_converter!(Sc16Item32BeToSc16, Sc16, |s: Sc16| s);
item32_be_converter!(Sc16Item32BeToFc32, Fc32, |s: Sc16| Fc32 {
  re: (s.re as f64 * SC16_FLOAT_SCALE) as f32,
  im: (s.im as f64 * SC16_FLOAT_SCALE) as f32,
});
item32_be_converter!(Sc16Item32BeToFc64, Fc64, |s: Sc16| Fc64 {
  re: s.re as f64 * SC16_FLOAT_SCALE,
  im: s.im as f64 * SC16_FLOAT_SCALE,
});

/// Host `sc16` to wire `sc16_item32_be`, used on the transmitting side.
pub struct Sc16ToSc16Item32Be;

impl Converter for Sc16ToSc16Item32Be {
  fn input_bytes_per_item(&self) -> usize {
    size_of::<Sc16>()
  }
  fn output_bytes_per_item(&self) -> usize {
    4
  }
  fn convert(&self, input: &[u8], output: &mut [u8], nsamps: usize) {
    let samples = input
      .chunks_exact(size_of::<Sc16>())
      .take(nsamps)
      .map(|b| bytemuck::pod_read_unaligned::<Sc16>(b))
      .collect::<Vec<_>>();
    write_sc16_item32_be(&samples, output);
  }
}

/// Selects the converter for `id`.
pub fn get_converter(id: &ConvertId) -> Result<Box<dyn Converter>, ConfigurationError> {
  if id.num_inputs != 1 || id.num_outputs != 1 {
    return Err(ConfigurationError::NoConverter { input: id.input_format.clone(), output: id.output_format.clone() });
  }
  let converter: Box<dyn Converter> = match (id.input_format.as_str(), id.output_format.as_str()) {
    ("sc16_item32_be", "sc16") => Box::new(Sc16Item32BeToSc16),
    ("sc16_item32_be", "fc32") => Box::new(Sc16Item32BeToFc32),
    ("sc16_item32_be", "fc64") => Box::new(Sc16Item32BeToFc64),
    ("sc16", "sc16_item32_be") => Box::new(Sc16ToSc16Item32Be),
    (input, output) => {
      return Err(ConfigurationError::NoConverter { input: input.to_owned(), output: output.to_owned() });
    }
  };
  debug!("selected converter {id}");
  Ok(converter)
}

#[cfg(test)]
mod tests {
  use super::*;

  const WIRE: [u8; 12] = [
    0x00, 0x01, 0xff, 0xff, // 1, -1
    0x7f, 0xff, 0x80, 0x01, // 32767, -32767
    0x12, 0x34, 0x00, 0x00, // 0x1234, 0
  ];

  #[test]
  fn test_bytes_per_item() {
    assert_eq!(get_bytes_per_item("sc16").unwrap(), 4);
    assert_eq!(get_bytes_per_item("sc16_item32_be").unwrap(), 4);
    assert_eq!(get_bytes_per_item("fc32").unwrap(), 8);
    assert!(matches!(get_bytes_per_item("bogus"), Err(ConfigurationError::UnknownFormat(_))));
  }

  #[test]
  fn test_sc16_wire_to_host() {
    let conv = get_converter(&ConvertId::new("sc16_item32_be", "sc16")).unwrap();
    let mut out = [Sc16::default(); 3];
    conv.convert(&WIRE, bytemuck::cast_slice_mut(&mut out), 3);
    assert_eq!(out, [Sc16::new(1, -1), Sc16::new(32767, -32767), Sc16::new(0x1234, 0)]);
  }

  #[test]
  fn test_converts_only_nsamps() {
    let conv = get_converter(&ConvertId::new("sc16_item32_be", "sc16")).unwrap();
    let mut out = [Sc16::new(7, 7); 3];
    conv.convert(&WIRE, bytemuck::cast_slice_mut(&mut out), 2);
    assert_eq!(out[2], Sc16::new(7, 7));
  }

  #[test]
  fn test_float_scaling() {
    let conv = get_converter(&ConvertId::new("sc16_item32_be", "fc32")).unwrap();
    assert_eq!(conv.output_bytes_per_item(), 8);
    let mut out = [Fc32::default(); 3];
    conv.convert(&WIRE, bytemuck::cast_slice_mut(&mut out), 3);
    assert_eq!(out[1], Fc32 { re: 1.0, im: -1.0 });
    assert!((out[0].re - 1.0 / 32767.0).abs() < 1e-9);

    let conv = get_converter(&ConvertId::new("sc16_item32_be", "fc64")).unwrap();
    let mut out = [Fc64::default(); 3];
    conv.convert(&WIRE, bytemuck::cast_slice_mut(&mut out), 3);
    assert_eq!(out[1], Fc64 { re: 1.0, im: -1.0 });
  }

  #[test]
  fn test_wire_round_trip_through_converters() {
    let samples: Vec<Sc16> = (0..64).map(|i| Sc16::new(i * 100 - 3000, 3000 - i * 77)).collect();
    let mut wire = vec![0u8; samples.len() * 4];
    let to_wire = get_converter(&ConvertId::new("sc16", "sc16_item32_be")).unwrap();
    to_wire.convert(bytemuck::cast_slice(&samples), &mut wire, samples.len());

    let mut back = vec![Sc16::default(); samples.len()];
    let from_wire = get_converter(&ConvertId::new("sc16_item32_be", "sc16")).unwrap();
    from_wire.convert(&wire, bytemuck::cast_slice_mut(&mut back), samples.len());
    assert_eq!(back, samples);
  }

  #[test]
  fn test_unknown_conversion() {
    let err = get_converter(&ConvertId::new("sc8_item32_be", "fc32")).err().unwrap();
    assert!(matches!(err, ConfigurationError::NoConverter { .. }));
    assert_eq!(ConvertId::new("sc16_item32_be", "fc32").to_string(), "sc16_item32_be_1_fc32_1");
  }
}
