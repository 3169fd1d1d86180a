// Thin façade over the tokio runtime so every crate spawns and
// synchronizes through the same surface

use std::future::Future;

use log::trace;
use ::tokio::task::JoinHandle;

pub use ::tokio::{select, task, time};

pub mod sync {
    pub use ::tokio::sync::*;
}

// Spawn a named task
// The name is only used for tracing, tokio doesn't expose task names on
// stable without the tracing feature
pub fn spawn_task<F>(name: &str, future: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    if log::log_enabled!(log::Level::Trace) {
        trace!("Spawning task: {}", name);
    }
    ::tokio::spawn(future)
}
