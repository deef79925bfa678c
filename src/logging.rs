
// Diagnostics go to stderr so that stdout stays the measurement console

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

// RUST_LOG, when set, takes precedence over the configured level
pub fn init(level:&str) -> Result<()> {
	let filter = match EnvFilter::try_from_default_env() {
		Ok(filter) => filter,
		Err(_) => EnvFilter::try_new(level).map_err(|e| Error::configuration(format!("invalid log level {:?}: {}", level, e)))?,
	};

	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_writer(std::io::stderr)
		.with_target(false)
		.compact()
		.try_init()
		.map_err(|e| Error::configuration(format!("unable to install log subscriber: {}", e)))
}
