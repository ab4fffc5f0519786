//! Tracing setup for binaries and experiments embedding the kernel.
//!
//! The kernel only emits `tracing` events; installing a subscriber is left to
//! whoever drives the simulation. `MESHSIM_LOG_FORMAT=json` switches to JSON
//! output, `MESHSIM_LOG_TO_STDERR` redirects it, `RUST_LOG` overrides levels.

#[cfg(feature = "trace")]
pub use tracer::init_tracer;

#[cfg(feature = "trace")]
mod tracer {
    use tracing::level_filters::LevelFilter;
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

    pub use tracing_subscriber::util::TryInitError;

    /// Installs the global subscriber. Fails if one is already set.
    pub fn init_tracer(level: Option<LevelFilter>) -> Result<(), TryInitError> {
        let default_filter = if cfg!(any(test, debug_assertions)) {
            LevelFilter::DEBUG
        } else {
            LevelFilter::INFO
        };
        let filter_layer = tracing_subscriber::EnvFilter::builder()
            .with_default_directive(level.unwrap_or(default_filter).into())
            .from_env_lossy();

        let use_json = std::env::var("MESHSIM_LOG_FORMAT")
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let to_stderr = std::env::var("MESHSIM_LOG_TO_STDERR").is_ok();
        let with_location = cfg!(any(test, debug_assertions));

        let fmt_layer = match (use_json, to_stderr) {
            (true, true) => tracing_subscriber::fmt::layer()
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (true, false) => tracing_subscriber::fmt::layer()
                .json()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
            (false, true) => tracing_subscriber::fmt::layer()
                .with_file(with_location)
                .with_line_number(with_location)
                .with_writer(std::io::stderr)
                .boxed(),
            (false, false) => tracing_subscriber::fmt::layer()
                .with_file(with_location)
                .with_line_number(with_location)
                .boxed(),
        };

        tracing_subscriber::registry()
            .with(fmt_layer.with_filter(filter_layer))
            .try_init()
    }
}
