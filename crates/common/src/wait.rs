use std::time::{Duration, Instant};

/// Poll `connect` until it succeeds or `deadline` elapses.
///
/// Shared-memory participants race each other at startup: a reader may try
/// to open a region the writer has not created yet. This helper retries the
/// connection at `poll_interval` until the resource appears.
pub fn wait_for_resource<F, T, E>(
    mut connect: F,
    poll_interval: Duration,
    deadline: Duration,
    resource_name: &str,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let start = Instant::now();
    loop {
        match connect() {
            Ok(resource) => {
                tracing::debug!("{} available after {:?}", resource_name, start.elapsed());
                return Ok(resource);
            }
            Err(e) if start.elapsed() < deadline => {
                tracing::trace!("waiting for {} ({})", resource_name, e);
                std::thread::sleep(poll_interval);
            }
            Err(e) => return Err(e),
        }
    }
}
