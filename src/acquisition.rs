
// Drives one instrument session through triggered measurement cycles.
//
// The session moves through
// `Unconfigured -> SourceConfigured -> MeasurementConfigured -> TriggerArmed -> {Acquiring <-> Idle} -> Closed`.
// Every acquisition that initiates the session also aborts it, whether the fetch succeeded or not, and
// the session is reset and closed exactly once: by shutdown(), or on drop if
// shutdown never ran.

use std::fmt;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AcquisitionConfig;
use crate::devices::{ApertureTimeUnits, DcPowerSession, Event, Measurement, MeasureWhen, OutputFunction, Setting, SourceMode, TriggerType};
use crate::error::{Error, Result};
use crate::measurement::{average, record_length, AveragedReading};

pub const PROMPT:&str = "Press enter to take another measurement. Enter 'exit' to close.";
pub const EXIT_COMMAND:&str = "exit";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
	Unconfigured,
	SourceConfigured,
	MeasurementConfigured,
	TriggerArmed,
	Acquiring,
	Idle,
	Closed,
}

impl fmt::Display for SessionState {
	fn fmt(&self, f:&mut fmt::Formatter<'_>) -> fmt::Result { fmt::Debug::fmt(self, f) }
}

pub struct AcquisitionController<S: DcPowerSession> {
	session: S,
	state: SessionState,
	continue_on_timeout: bool,
	readings_json: Option<PathBuf>,
	readings: Vec<AveragedReading>,
}

fn finite_positive(name:&str, x:f64) -> Result<()> {
	if x.is_finite() && x > 0.0 { Ok(()) }
	else { Err(Error::configuration(format!("{} must be greater than zero, got {}", name, x))) }
}

impl<S: DcPowerSession> AcquisitionController<S> {

	pub fn new(session:S) -> Self {
		Self {
			session,
			state: SessionState::Unconfigured,
			continue_on_timeout: false,
			readings_json: None,
			readings: vec![],
		}
	}

	pub fn with_continue_on_timeout(mut self, enabled:bool) -> Self {
		self.continue_on_timeout = enabled;
		self
	}

	pub fn with_readings_json(mut self, path:Option<PathBuf>) -> Self {
		self.readings_json = path;
		self
	}

	pub fn state(&self) -> SessionState { self.state }

	pub fn session(&self) -> &S { &self.session }

	pub fn readings(&self) -> &[AveragedReading] { &self.readings }

	fn expect(&self, operation:&'static str, allowed:&[SessionState]) -> Result<()> {
		if allowed.contains(&self.state) { Ok(()) }
		else { Err(Error::InvalidState{ operation, state: self.state.to_string() }) }
	}

	pub fn configure_source(&mut self, voltage_level:f64, current_limit:f64, voltage_range:f64, current_range:f64) -> Result<()> {
		self.expect("configure_source", &[SessionState::Unconfigured, SessionState::SourceConfigured])?;

		if !voltage_level.is_finite() {
			return Err(Error::configuration(format!("voltage level must be finite, got {}", voltage_level)));
		}
		finite_positive("current limit", current_limit)?;
		finite_positive("voltage level range", voltage_range)?;
		finite_positive("current limit range", current_range)?;

		self.session.set(Setting::SourceMode(SourceMode::SinglePoint))?;
		self.session.set(Setting::OutputFunction(OutputFunction::DcVoltage))?;
		self.session.set(Setting::VoltageLevel(voltage_level))?;
		self.session.set(Setting::CurrentLimit(current_limit))?;
		self.session.set(Setting::VoltageLevelRange(voltage_range))?;
		self.session.set(Setting::CurrentLimitRange(current_range))?;

		info!(voltage_level, current_limit, voltage_range, current_range, "source configured");
		self.state = SessionState::SourceConfigured;
		Ok(())
	}

	// Starts sourcing without measuring and waits for the output to settle.  The output stays on after
	// the abort.
	pub fn prime_source(&mut self, settle_timeout:Duration) -> Result<()> {
		self.expect("prime_source", &[SessionState::SourceConfigured])?;

		self.session.initiate()?;
		let settled = self.session.wait_for_event(Event::SourceComplete, settle_timeout);
		let aborted = self.session.abort();
		settled?;
		aborted?;

		info!(?settle_timeout, "source settled");
		Ok(())
	}

	// Returns the record length derived from the coerced aperture time
	pub fn configure_measurement(&mut self, sample_rate:f64, measurement_interval:f64) -> Result<usize> {
		self.expect("configure_measurement", &[SessionState::SourceConfigured, SessionState::MeasurementConfigured])?;
		finite_positive("sample rate", sample_rate)?;
		finite_positive("measurement interval", measurement_interval)?;

		self.session.set(Setting::ApertureTimeUnits(ApertureTimeUnits::Seconds))?;
		self.session.set(Setting::ApertureTime(1.0 / sample_rate))?;
		self.session.commit()?;

		let aperture = self.session.aperture_time()?;
		let n = record_length(measurement_interval, aperture)?;
		self.session.set(Setting::MeasureRecordLengthIsFinite(true))?;
		self.session.set(Setting::MeasureRecordLength(n))?;

		info!(aperture, record_length = n, "measurement configured");
		self.state = SessionState::MeasurementConfigured;
		Ok(n)
	}

	pub fn configure_trigger(&mut self, trigger_source:&str, trigger_delay:f64) -> Result<()> {
		self.expect("configure_trigger", &[SessionState::MeasurementConfigured, SessionState::TriggerArmed])?;
		if trigger_source.trim().is_empty() {
			return Err(Error::configuration("trigger input terminal can't be empty"));
		}
		if !(trigger_delay.is_finite() && trigger_delay >= 0.0) {
			return Err(Error::configuration(format!("trigger delay must be a non-negative number of seconds, got {}", trigger_delay)));
		}

		self.session.set(Setting::SourceTriggerType(TriggerType::DigitalEdge))?;
		self.session.set(Setting::DigitalEdgeSourceTriggerInputTerminal(trigger_source.to_owned()))?;
		self.session.set(Setting::SourceDelay(trigger_delay))?;
		self.session.set(Setting::MeasureWhen(MeasureWhen::AutomaticallyAfterSourceComplete))?;

		info!(terminal = trigger_source, trigger_delay, "trigger armed");
		self.state = SessionState::TriggerArmed;
		Ok(())
	}

	// One initiate/fetch/abort round trip.  The abort happens whatever the fetch did.
	pub fn acquire_one(&mut self, record_length:usize, timeout:Duration) -> Result<Vec<Measurement>> {
		self.expect("acquire_one", &[SessionState::TriggerArmed, SessionState::Idle])?;
		if record_length == 0 {
			return Err(Error::configuration("record length must be at least 1"));
		}

		self.session.initiate()?;
		self.state = SessionState::Acquiring;

		let fetched = self.session.fetch_multiple(record_length, timeout);
		let aborted = self.session.abort();
		if aborted.is_ok() { self.state = SessionState::Idle; }

		let record = fetched?;
		aborted?;
		debug!(samples = record.len(), "record fetched");
		Ok(record)
	}

	// Acquire, print, prompt, until the operator types exit or the input ends.  Returns the number of
	// records that were acquired and printed.
	pub fn run_loop<R: BufRead, W: Write>(&mut self, record_length:usize, timeout:Duration, mut input:R, mut output:W) -> Result<usize> {
		let mut iterations = 0;
		let mut line = String::new();

		loop {
			match self.acquire_one(record_length, timeout) {
				Ok(record) => {
					let reading = average(&record)?;
					writeln!(output, "{}", reading.voltage_line())?;
					writeln!(output, "{}", reading.current_line())?;
					if reading.compliance_samples > 0 {
						warn!(compliance_samples = reading.compliance_samples, samples = reading.samples, "output hit the current limit");
					}
					self.record(reading)?;
					iterations += 1;
				},
				Err(e @ Error::AcquisitionTimeout{ .. }) if self.continue_on_timeout => {
					warn!(error = %e, "no trigger received, session returned to idle");
					writeln!(output, "Acquisition timed out: {}", e)?;
				},
				Err(e) => return Err(e),
			}

			write!(output, "{}", PROMPT)?;
			output.flush()?;

			line.clear();
			if input.read_line(&mut line)? == 0 {
				debug!("input closed");
				break;
			}
			if line.trim_end_matches(&['\r', '\n'][..]).eq_ignore_ascii_case(EXIT_COMMAND) {
				break;
			}
		}

		info!(iterations, "measurement loop finished");
		Ok(iterations)
	}

	// Readings are only kept while there is a file to keep them in
	fn record(&mut self, reading:AveragedReading) -> Result<()> {
		let path = match &self.readings_json {
			Some(path) => path,
			None => return Ok(()),
		};

		self.readings.push(reading);
		let json = serde_json::to_string_pretty(&self.readings)
			.map_err(|e| Error::protocol(format!("unable to serialize readings: {}", e)))?;
		fs::write(path, json.as_bytes())?;
		Ok(())
	}

	// Configure source, settle, configure measurement and trigger.  Returns the record length.
	pub fn start(&mut self, config:&AcquisitionConfig) -> Result<usize> {
		config.validate()?;
		let source = &config.source;
		self.configure_source(source.voltage_level, source.current_limit, source.voltage_level_range, source.current_limit_range)?;
		self.prime_source(config.settle_timeout()?)?;
		let n = self.configure_measurement(config.measurement.sample_rate, config.measurement.measurement_interval)?;
		self.configure_trigger(&config.trigger.input_terminal, config.trigger.delay_s)?;
		Ok(n)
	}

	// Reset and close.  Both are attempted even if the first fails, and the session counts as closed
	// afterwards either way.
	pub fn shutdown(&mut self) -> Result<()> {
		self.expect("shutdown", &[
			SessionState::Unconfigured, SessionState::SourceConfigured, SessionState::MeasurementConfigured,
			SessionState::TriggerArmed, SessionState::Acquiring, SessionState::Idle,
		])?;

		let reset = self.session.reset();
		let closed = self.session.close();
		self.state = SessionState::Closed;
		info!("session closed");
		reset?;
		closed
	}

}

impl<S: DcPowerSession> Drop for AcquisitionController<S> {

	fn drop(&mut self) {
		if self.state != SessionState::Closed {
			warn!(state = %self.state, "controller dropped without shutdown, closing session");
			if let Err(e) = self.shutdown() {
				warn!(error = %e, "shutdown on drop failed");
			}
		}
	}

}

// The whole program: start, loop, and shut down exactly once.  When several steps fail the first
// error is returned.
pub fn run<S: DcPowerSession, R: BufRead, W: Write>(config:&AcquisitionConfig, session:S, input:R, output:W) -> Result<usize> {
	let mut controller = AcquisitionController::new(session)
		.with_continue_on_timeout(config.acquisition.continue_on_timeout)
		.with_readings_json(config.output.readings_json.clone());

	let result = config.fetch_timeout().and_then(|timeout| {
		let n = controller.start(config)?;
		controller.run_loop(n, timeout, input, output)
	});
	let shutdown = controller.shutdown();

	let iterations = result?;
	shutdown?;
	Ok(iterations)
}
