//! Subscriber setup for the `isg` binary
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! left to the binary (or to tests that want output).

use tracing_subscriber::EnvFilter;

/// Install the global subscriber
///
/// `RUST_LOG` wins when set, otherwise `info`. Logs go to stderr so
/// command output on stdout stays machine-readable. Calling this twice
/// is harmless.
pub fn init(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
