use crate::common::*;

use std::{pin::Pin, thread::JoinHandle};

use futures::Future;

/// Runs the future returned by `future_cb` to completion on a new named thread with its own current-thread runtime.
pub fn run_future_in_new_thread(
  name: impl ToString,
  future_cb: impl FnOnce() -> Pin<Box<dyn Future<Output = ()> + 'static>> + Send + 'static,
) -> std::io::Result<JoinHandle<()>> {
  let name = name.to_string();
  std::thread::Builder::new().name(name.clone()).spawn(move || {
    let runtime = tokio::runtime::Builder::new_current_thread().thread_name(&name).enable_all().build();
    match runtime {
      Ok(runtime) => runtime.block_on(future_cb()),
      Err(e) => error!("cannot start runtime for thread {name}: {e:?}"),
    }
  })
}
