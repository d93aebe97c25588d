use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the process-wide tracing subscriber. Filtering follows RUST_LOG
/// with an `info` default; LOG_FORMAT=json switches to structured output.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
		registry.with(fmt::layer().json().flatten_event(true)).init();
	} else {
		registry.with(fmt::layer()).init();
	}
}

/// Variant for tests: never panics when a subscriber is already installed.
pub fn try_setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer())
		.try_init();
}
