// Crimson UHD
// Copyright (C) 2024 Crimson UHD contributors
// 
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
// 
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
// 
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.


//! Receive streaming driver for Crimson TNG software-defined radios
//! 
//! Every RX channel of the radio streams VITA-49 data packets over UDP to its
//! own host endpoint. [`CrimsonTng::get_rx_stream`] powers the requested
//! channels on, binds a zero-copy UDP transport to each endpoint and returns a
//! [`RecvPacketStreamer`] which unframes, time-aligns and converts the
//! packets of all channels at once.
//! 
//! Without hardware, [`CrimsonTng::make`] opens an in-process simulated radio:
//! ```no_run
//! use std::time::Duration;
//! use crimson_uhd::{CrimsonTng, DeviceAddr, Sc16, StreamArgs, StreamCmd};
//! 
//! let usrp = CrimsonTng::make(&DeviceAddr::parse("type=sim")).unwrap();
//! let mut rx = usrp.get_rx_stream(&StreamArgs::new("sc16", "sc16").with_channels([0, 1])).unwrap();
//! rx.issue_stream_cmd(&StreamCmd::num_samps_and_done(10000).at(usrp.get_time_now() + 0.5));
//! 
//! let spp = rx.get_max_num_samps();
//! let (mut a, mut b) = (vec![Sc16::default(); spp], vec![Sc16::default(); spp]);
//! let (n, md) = rx.recv(&mut [&mut a, &mut b], spp, Duration::from_secs(1));
//! println!("{n} samples at {:?}: {}", md.time_spec, md.strerror());
//! ```
//! 


mod common;
mod convert;
mod crimson_tng;
mod device_addr;
mod error;
mod net_utils;
mod os_utils;
mod property_tree;
mod recv_packet_streamer;
mod stream;
mod thread_utils;
mod time_spec;
mod udp_zero_copy;
mod vrt;

pub mod sim;

pub use common::{Fc32, Fc64, HostSample, Sc16};
pub use convert::{get_bytes_per_item, get_converter, ConvertId, Converter};
pub use crimson_tng::{CrimsonTng, DeviceControl, RxStreamConfig, ALL_CHANS};
pub use device_addr::DeviceAddr;
pub use error::{ConfigurationError, PropertyError};
pub use property_tree::{FsPath, MemoryPropertyTree, PropType, PropValue, PropertyTree, PropertyTreeExt};
pub use recv_packet_streamer::{RecvPacketStreamer, StreamerState};
pub use stream::{RxErrorCode, RxMetadata, StreamArgs, StreamCmd, StreamMode};
pub use time_spec::TimeSpec;
pub use udp_zero_copy::{BuffParams, ManagedRecvBuffer, UdpStreamZeroCopy, ZeroCopyRecv, ZeroCopyXportParams};
pub use vrt::{if_hdr_pack_be, if_hdr_unpack_be, if_hdr_unpack_le, IfPacketInfo, PacketType, VrtError};

pub mod utils {
  pub use crate::common::LogAndForget;
  pub use crate::os_utils::{set_current_thread_realtime, set_thread_priority_safe};
  pub use crate::thread_utils::run_future_in_new_thread;
}
