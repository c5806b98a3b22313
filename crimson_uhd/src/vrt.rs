//! VITA-49 IF packet header (un)packing.
//!
//! Header word layout (most significant bit first):
//! ```text
//! 31..28 packet type | 27 C | 26 T | 25 SOB | 24 EOB | 23..22 TSI | 21..20 TSF | 19..16 count | 15..0 size
//! ```
//! followed by the optional stream id, class id (2 words), integer timestamp,
//! fractional timestamp (2 words), then the payload and an optional trailer word.

use bytebuffer::ByteBuffer;
use thiserror::Error;

/// Header word, stream id, class id (2), integer timestamp, fractional timestamp (2).
pub const MAX_IF_HDR_WORDS32: usize = 7;

const SIZE_OF_WORD32: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PacketType {
  #[default]
  Data,
  Extension,
  Context,
  ExtensionContext,
}

impl PacketType {
  pub fn is_data(&self) -> bool {
    matches!(self, Self::Data | Self::Extension)
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct IfPacketInfo {
  pub packet_type: PacketType,
  /// Total packet length, filled in by unpack and pack.
  pub num_packet_words32: usize,
  /// Filled in by unpack and pack.
  pub num_header_words32: usize,
  pub num_payload_words32: usize,
  pub num_payload_bytes: usize,
  /// 4-bit rolling sequence number.
  pub packet_count: u8,
  pub sob: bool,
  pub eob: bool,
  pub has_sid: bool,
  pub sid: u32,
  pub has_cid: bool,
  pub cid: u64,
  pub has_tsi: bool,
  pub tsi: u32,
  pub has_tsf: bool,
  pub tsf: u64,
  pub has_tlr: bool,
  pub tlr: u32,
}

impl IfPacketInfo {
  /// Byte range of the payload within the packet buffer.
  pub fn payload_range(&self) -> std::ops::Range<usize> {
    let start = self.num_header_words32 * SIZE_OF_WORD32;
    start..start + self.num_payload_bytes
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VrtError {
  #[error("packet of {0} bytes is too short for a VITA header")]
  TooShort(usize),
  #[error("header declares {declared} words but only {available} were received")]
  Truncated { declared: usize, available: usize },
  #[error("header declares {packet} words, fewer than its {header} header words")]
  InconsistentSize { packet: usize, header: usize },
  #[error("unsupported packet type {0:#x}")]
  UnsupportedType(u32),
}

/// Function parsing a raw packet into its header info.
pub type VrtUnpacker = fn(&[u8]) -> Result<IfPacketInfo, VrtError>;

fn word_be(buf: &[u8], index: usize) -> u32 {
  let i = index * SIZE_OF_WORD32;
  u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

fn word_le(buf: &[u8], index: usize) -> u32 {
  let i = index * SIZE_OF_WORD32;
  u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]])
}

#[inline(always)]
fn if_hdr_unpack(packet: &[u8], word: fn(&[u8], usize) -> u32) -> Result<IfPacketInfo, VrtError> {
  if packet.len() < SIZE_OF_WORD32 {
    return Err(VrtError::TooShort(packet.len()));
  }
  let available = packet.len() / SIZE_OF_WORD32;
  let hdr = word(packet, 0);
  let mut info = IfPacketInfo::default();

  let type_bits = hdr >> 28;
  (info.packet_type, info.has_sid) = match type_bits {
    0x0 => (PacketType::Data, false),
    0x1 => (PacketType::Data, true),
    0x2 => (PacketType::Extension, false),
    0x3 => (PacketType::Extension, true),
    0x4 => (PacketType::Context, true),
    0x5 => (PacketType::ExtensionContext, true),
    other => return Err(VrtError::UnsupportedType(other)),
  };
  info.has_cid = hdr & (1 << 27) != 0;
  info.has_tlr = info.packet_type.is_data() && hdr & (1 << 26) != 0;
  info.sob = hdr & (1 << 25) != 0;
  info.eob = hdr & (1 << 24) != 0;
  info.has_tsi = (hdr >> 22) & 0x3 != 0;
  info.has_tsf = (hdr >> 20) & 0x3 != 0;
  info.packet_count = ((hdr >> 16) & 0xf) as u8;
  info.num_packet_words32 = (hdr & 0xffff) as usize;

  let num_header_words32 = 1
    + info.has_sid as usize
    + 2 * info.has_cid as usize
    + info.has_tsi as usize
    + 2 * info.has_tsf as usize;
  let trailer_words32 = info.has_tlr as usize;
  if info.num_packet_words32 < num_header_words32 + trailer_words32 {
    return Err(VrtError::InconsistentSize { packet: info.num_packet_words32, header: num_header_words32 });
  }
  if info.num_packet_words32 > available {
    return Err(VrtError::Truncated { declared: info.num_packet_words32, available });
  }

  let mut index = 1;
  if info.has_sid {
    info.sid = word(packet, index);
    index += 1;
  }
  if info.has_cid {
    info.cid = ((word(packet, index) as u64) << 32) | word(packet, index + 1) as u64;
    index += 2;
  }
  if info.has_tsi {
    info.tsi = word(packet, index);
    index += 1;
  }
  if info.has_tsf {
    info.tsf = ((word(packet, index) as u64) << 32) | word(packet, index + 1) as u64;
    index += 2;
  }
  info.num_header_words32 = index;
  info.num_payload_words32 = info.num_packet_words32 - num_header_words32 - trailer_words32;
  info.num_payload_bytes = info.num_payload_words32 * SIZE_OF_WORD32;
  if info.has_tlr {
    info.tlr = word(packet, info.num_packet_words32 - 1);
  }
  Ok(info)
}

/// Unpacks a big-endian VITA IF header. The payload is `&packet[info.payload_range()]`.
pub fn if_hdr_unpack_be(packet: &[u8]) -> Result<IfPacketInfo, VrtError> {
  if_hdr_unpack(packet, word_be)
}

/// Unpacks a little-endian VITA IF header.
pub fn if_hdr_unpack_le(packet: &[u8]) -> Result<IfPacketInfo, VrtError> {
  if_hdr_unpack(packet, word_le)
}

/// Writes the big-endian header words described by `info` to `out`.
///
/// `info.num_payload_words32` must be set; the header and packet lengths are computed and
/// stored back into `info`. The caller appends the payload and then, if `has_tlr`, the trailer.
pub fn if_hdr_pack_be(info: &mut IfPacketInfo, out: &mut ByteBuffer) {
  let has_sid = info.has_sid || !info.packet_type.is_data();
  let has_tlr = info.has_tlr && info.packet_type.is_data();
  info.has_sid = has_sid;
  info.has_tlr = has_tlr;
  info.num_header_words32 =
    1 + has_sid as usize + 2 * info.has_cid as usize + info.has_tsi as usize + 2 * info.has_tsf as usize;
  info.num_packet_words32 = info.num_header_words32 + info.num_payload_words32 + has_tlr as usize;
  info.num_payload_bytes = info.num_payload_words32 * SIZE_OF_WORD32;

  let type_bits: u32 = match (info.packet_type, has_sid) {
    (PacketType::Data, false) => 0x0,
    (PacketType::Data, true) => 0x1,
    (PacketType::Extension, false) => 0x2,
    (PacketType::Extension, true) => 0x3,
    (PacketType::Context, _) => 0x4,
    (PacketType::ExtensionContext, _) => 0x5,
  };
  let mut hdr = type_bits << 28;
  hdr |= (info.has_cid as u32) << 27;
  hdr |= (has_tlr as u32) << 26;
  hdr |= (info.sob as u32) << 25;
  hdr |= (info.eob as u32) << 24;
  // TSI "other", TSF "sample count" (device ticks)
  hdr |= (if info.has_tsi { 0x3 } else { 0x0 }) << 22;
  hdr |= (if info.has_tsf { 0x1 } else { 0x0 }) << 20;
  hdr |= ((info.packet_count & 0xf) as u32) << 16;
  hdr |= (info.num_packet_words32 & 0xffff) as u32;

  out.write_u32(hdr);
  if has_sid {
    out.write_u32(info.sid);
  }
  if info.has_cid {
    out.write_u64(info.cid);
  }
  if info.has_tsi {
    out.write_u32(info.tsi);
  }
  if info.has_tsf {
    out.write_u64(info.tsf);
  }
}
