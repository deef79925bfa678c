
// Hardware-timed, single point measurements over the active slots of a bursty RF waveform (LTE/NR TDD).
// The waveform's marker is fixed at sample 0, so the source delay moves the measurement window into the
// slot instead.

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use dcpower_rf::config::AcquisitionConfig;
use dcpower_rf::devices::open_session;
use dcpower_rf::logging;

#[derive(Parser, Debug)]
#[command(name = "pulsed_rf_measurements")]
#[command(about = "Triggered DC power measurements synchronized to RF bursts", long_about = None)]
struct Cli {
	/// TOML configuration file
	#[arg(long)]
	config: Option<PathBuf>,

	/// Instrument resource name or VXI-11 host
	#[arg(long)]
	resource: Option<String>,

	/// Use the simulated instrument
	#[arg(long)]
	simulate: bool,

	#[arg(long)]
	voltage_level: Option<f64>,

	#[arg(long)]
	current_limit: Option<f64>,

	/// Samples per second
	#[arg(long)]
	sample_rate: Option<f64>,

	/// Measurement window in seconds
	#[arg(long)]
	measurement_interval: Option<f64>,

	#[arg(long)]
	trigger_terminal: Option<String>,

	/// Delay in seconds between the trigger edge and the measurement
	#[arg(long)]
	trigger_delay: Option<f64>,

	/// Seconds to wait for each triggered record
	#[arg(long)]
	fetch_timeout: Option<f64>,

	/// Keep every averaged reading in this JSON file
	#[arg(long)]
	readings_json: Option<PathBuf>,

	#[arg(long)]
	log_level: Option<String>,
}

impl Cli {

	fn apply(self, config:&mut AcquisitionConfig) {
		if let Some(r) = self.resource { config.instrument.resource_name = r; }
		if self.simulate { config.instrument.simulate = true; }
		if let Some(v) = self.voltage_level { config.source.voltage_level = v; }
		if let Some(a) = self.current_limit { config.source.current_limit = a; }
		if let Some(r) = self.sample_rate { config.measurement.sample_rate = r; }
		if let Some(s) = self.measurement_interval { config.measurement.measurement_interval = s; }
		if let Some(t) = self.trigger_terminal { config.trigger.input_terminal = t; }
		if let Some(d) = self.trigger_delay { config.trigger.delay_s = d; }
		if let Some(t) = self.fetch_timeout { config.acquisition.fetch_timeout_s = t; }
		if let Some(p) = self.readings_json { config.output.readings_json = Some(p); }
		if let Some(l) = self.log_level { config.logging.level = l; }
	}

}

fn main() -> Result<()> {
	let cli = Cli::parse();

	let mut config = AcquisitionConfig::load(cli.config.as_deref()).context("loading configuration")?;
	cli.apply(&mut config);
	config.validate().context("invalid configuration")?;

	logging::init(&config.logging.level)?;

	let session = open_session(&config.instrument)
		.with_context(|| format!("opening instrument session {}", config.instrument.resource_name))?;

	let stdin = io::stdin();
	let stdout = io::stdout();
	match dcpower_rf::run(&config, session, stdin.lock(), stdout.lock()) {
		Ok(iterations) => {
			info!(iterations, "done");
			Ok(())
		},
		Err(e) => {
			error!(error = %e, "measurement aborted");
			Err(e.into())
		},
	}
}
