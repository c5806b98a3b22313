use crate::common::*;

use thread_priority::{thread_native_id, Error};

#[cfg(target_family = "unix")]
pub fn set_current_thread_realtime(priority_hint: u8) -> Result<(), Error> {
  use thread_priority::unix::set_thread_priority_and_policy;
  use thread_priority::{RealtimeThreadSchedulePolicy, ThreadPriority, ThreadPriorityValue, ThreadSchedulePolicy};

  let priority = ThreadPriorityValue::try_from(priority_hint).map_err(Error::Priority)?;
  set_thread_priority_and_policy(
    thread_native_id(),
    ThreadPriority::Crossplatform(priority),
    ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
  )
}

#[cfg(not(target_family = "unix"))]
pub fn set_current_thread_realtime(_priority_hint: u8) -> Result<(), Error> {
  thread_priority::set_current_thread_priority(thread_priority::ThreadPriority::Max)
}

/// Raises the priority of the calling thread for sample streaming. Failing to do so
/// (e.g. without `CAP_SYS_NICE`) only risks overflows, so it is reported and ignored.
pub fn set_thread_priority_safe() -> bool {
  match set_current_thread_realtime(50) {
    Ok(()) => true,
    Err(e) => {
      warn!("unable to set realtime thread priority: {e:?}");
      false
    }
  }
}
