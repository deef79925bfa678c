
// Acquisition settings.
//
// Built once at startup from, in increasing priority: the built-in defaults (the reference
// LTE/NR TDD setup), an optional TOML file, and `DCPOWER_` environment variables with `__`
// separating sections, e.g. `DCPOWER_SOURCE__VOLTAGE_LEVEL=3.3`. The result is immutable for the
// duration of the measurement loop.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
	providers::{Env, Format, Serialized, Toml},
	Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::measurement::record_length;

pub const ENV_PREFIX:&str = "DCPOWER_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AcquisitionConfig {
	pub instrument: InstrumentConfig,
	pub source: SourceConfig,
	pub measurement: MeasurementConfig,
	pub trigger: TriggerConfig,
	pub acquisition: LoopConfig,
	pub logging: LoggingConfig,
	pub output: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
	// Instrument resource name, or host name / address for VXI-11
	pub resource_name: String,
	// Channel list; empty means all channels
	pub channels: String,
	// Reset the instrument when the session opens
	pub reset: bool,
	// Use the simulated instrument instead of hardware
	pub simulate: bool,
	// VXI-11 logical device name
	pub device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
	pub voltage_level: f64,
	pub current_limit: f64,
	pub voltage_level_range: f64,
	pub current_limit_range: f64,
	// Upper bound on waiting for the output to settle before measurements are configured
	pub settle_timeout_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeasurementConfig {
	pub sample_rate: f64,
	// Length of the measured window in seconds
	pub measurement_interval: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
	pub input_terminal: String,
	// Wait between the trigger edge and the start of the measurement window
	pub delay_s: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
	pub fetch_timeout_s: f64,
	// Report a missed trigger and keep looping instead of stopping
	pub continue_on_timeout: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
	pub level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct OutputConfig {
	// Rewritten with every averaged reading so far after each iteration
	pub readings_json: Option<PathBuf>,
}

impl Default for InstrumentConfig {
	fn default() -> Self {
		Self {
			resource_name: "DC_01".to_owned(),
			channels: String::new(),
			reset: true,
			simulate: false,
			device: "inst0".to_owned(),
		}
	}
}

impl Default for SourceConfig {
	fn default() -> Self {
		Self {
			voltage_level: 5.0,
			current_limit: 1.0,
			voltage_level_range: 6.0,
			current_limit_range: 1.0,
			settle_timeout_s: 5.0,
		}
	}
}

impl Default for MeasurementConfig {
	fn default() -> Self {
		Self { sample_rate: 100e3, measurement_interval: 2e-3 }
	}
}

impl Default for TriggerConfig {
	fn default() -> Self {
		Self { input_terminal: "PXI_Trig2".to_owned(), delay_s: 2.0e-3 }
	}
}

impl Default for LoopConfig {
	fn default() -> Self {
		Self { fetch_timeout_s: 10.0, continue_on_timeout: false }
	}
}

impl Default for LoggingConfig {
	fn default() -> Self {
		Self { level: "info".to_owned() }
	}
}

fn seconds(name:&str, s:f64) -> Result<Duration> {
	Duration::try_from_secs_f64(s).map_err(|_| Error::configuration(format!("{} must be a non-negative number of seconds, got {}", name, s)))
}

fn require_positive(name:&str, x:f64) -> Result<()> {
	if x.is_finite() && x > 0.0 { Ok(()) }
	else { Err(Error::configuration(format!("{} must be greater than zero, got {}", name, x))) }
}

impl AcquisitionConfig {

	// Defaults, then the file (if given), then the environment.
	pub fn load(path:Option<&Path>) -> Result<Self> {
		Self::load_with_prefix(path, ENV_PREFIX)
	}

	pub(crate) fn load_with_prefix(path:Option<&Path>, prefix:&str) -> Result<Self> {
		let mut figment = Figment::from(Serialized::defaults(AcquisitionConfig::default()));
		if let Some(path) = path {
			if !path.exists() {
				return Err(Error::configuration(format!("config file {} does not exist", path.display())));
			}
			figment = figment.merge(Toml::file(path));
		}
		let config:Self = figment.merge(Env::prefixed(prefix).split("__")).extract()?;
		Ok(config)
	}

	pub fn settle_timeout(&self) -> Result<Duration> { seconds("source.settle_timeout_s", self.source.settle_timeout_s) }

	pub fn fetch_timeout(&self) -> Result<Duration> { seconds("acquisition.fetch_timeout_s", self.acquisition.fetch_timeout_s) }

	// Catches what can be caught without an instrument. The driver still has the last word on
	// ranges it supports.
	pub fn validate(&self) -> Result<()> {
		if self.instrument.resource_name.trim().is_empty() {
			return Err(Error::configuration("instrument.resource_name can't be empty"));
		}

		let s = &self.source;
		if !s.voltage_level.is_finite() {
			return Err(Error::configuration("source.voltage_level must be finite"));
		}
		require_positive("source.current_limit", s.current_limit)?;
		require_positive("source.voltage_level_range", s.voltage_level_range)?;
		require_positive("source.current_limit_range", s.current_limit_range)?;
		if s.voltage_level.abs() > s.voltage_level_range {
			return Err(Error::configuration(format!("source.voltage_level {} V exceeds source.voltage_level_range {} V", s.voltage_level, s.voltage_level_range)));
		}
		if s.current_limit > s.current_limit_range {
			return Err(Error::configuration(format!("source.current_limit {} A exceeds source.current_limit_range {} A", s.current_limit, s.current_limit_range)));
		}
		self.settle_timeout()?;

		require_positive("measurement.sample_rate", self.measurement.sample_rate)?;
		require_positive("measurement.measurement_interval", self.measurement.measurement_interval)?;
		record_length(self.measurement.measurement_interval, 1.0 / self.measurement.sample_rate)?;

		if self.trigger.input_terminal.trim().is_empty() {
			return Err(Error::configuration("trigger.input_terminal can't be empty"));
		}
		seconds("trigger.delay_s", self.trigger.delay_s)?;

		if self.fetch_timeout()?.is_zero() {
			return Err(Error::configuration("acquisition.fetch_timeout_s must be greater than zero"));
		}

		let valid_levels = ["trace", "debug", "info", "warn", "error"];
		if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
			return Err(Error::configuration(format!(
				"Invalid logging.level '{}'. Must be one of: {}", self.logging.level, valid_levels.join(", "))));
		}

		Ok(())
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[test]
	fn defaults_match_reference_setup() {
		let c = AcquisitionConfig::default();
		assert_eq!(c.instrument.resource_name, "DC_01");
		assert!(c.instrument.reset);
		assert_eq!(c.source.voltage_level, 5.0);
		assert_eq!(c.source.current_limit, 1.0);
		assert_eq!(c.source.voltage_level_range, 6.0);
		assert_eq!(c.source.current_limit_range, 1.0);
		assert_eq!(c.measurement.sample_rate, 100e3);
		assert_eq!(c.measurement.measurement_interval, 2e-3);
		assert_eq!(c.trigger.input_terminal, "PXI_Trig2");
		assert_eq!(c.trigger.delay_s, 2.0e-3);
		assert_eq!(c.fetch_timeout().unwrap(), Duration::from_secs(10));
		assert!(c.validate().is_ok());
	}

	#[test]
	fn toml_file_overrides_defaults() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[source]\nvoltage_level = 3.3\n\n[trigger]\ninput_terminal = \"PXI_Trig0\"\n\n[acquisition]\ncontinue_on_timeout = true").unwrap();

		let c = AcquisitionConfig::load_with_prefix(Some(file.path()), "DCPOWER_TOML_TEST_").unwrap();
		assert_eq!(c.source.voltage_level, 3.3);
		assert_eq!(c.source.current_limit, 1.0);
		assert_eq!(c.trigger.input_terminal, "PXI_Trig0");
		assert!(c.acquisition.continue_on_timeout);
	}

	#[test]
	fn environment_overrides_file() {
		let mut file = tempfile::NamedTempFile::new().unwrap();
		writeln!(file, "[measurement]\nsample_rate = 50000.0").unwrap();

		std::env::set_var("DCPOWER_ENV_TEST_MEASUREMENT__SAMPLE_RATE", "200000.0");
		let c = AcquisitionConfig::load_with_prefix(Some(file.path()), "DCPOWER_ENV_TEST_").unwrap();
		std::env::remove_var("DCPOWER_ENV_TEST_MEASUREMENT__SAMPLE_RATE");
		assert_eq!(c.measurement.sample_rate, 200e3);
	}

	#[test]
	fn missing_file_is_an_error() {
		let r = AcquisitionConfig::load_with_prefix(Some(Path::new("/nonexistent/dcpower.toml")), "DCPOWER_MISSING_TEST_");
		assert!(matches!(r, Err(Error::Configuration(_))));
	}

	#[test]
	fn validation_catches_bad_values() {
		let mut c = AcquisitionConfig::default();
		c.source.voltage_level = 7.0;
		assert!(c.validate().is_err());

		let mut c = AcquisitionConfig::default();
		c.measurement.sample_rate = 0.0;
		assert!(c.validate().is_err());

		let mut c = AcquisitionConfig::default();
		c.measurement.measurement_interval = 1e-6;
		assert!(c.validate().is_err());

		let mut c = AcquisitionConfig::default();
		c.trigger.delay_s = -1.0;
		assert!(c.validate().is_err());

		let mut c = AcquisitionConfig::default();
		c.logging.level = "loud".into();
		assert!(c.validate().is_err());
	}
}
