
// The instrument is reached through a session object that owns configuration, sourcing and measurement.
// Everything above this module only talks to the DcPowerSession trait.

use std::fmt;
use std::time::Duration;

use serde::{Serialize, Deserialize};
use tracing::info;

use crate::config::InstrumentConfig;
use crate::error::Result;

pub mod scpi_smu;
pub mod simulated;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceMode {
	SinglePoint,
	Sequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFunction {
	DcVoltage,
	DcCurrent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApertureTimeUnits {
	Seconds,
	PowerLineCycles,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerType {
	None,
	DigitalEdge,
	SoftwareEdge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasureWhen {
	AutomaticallyAfterSourceComplete,
	OnDemand,
	OnMeasureTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
	SourceComplete,
	MeasureComplete,
}

impl fmt::Display for Event {
	fn fmt(&self, f:&mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Event::SourceComplete  => write!(f, "source complete event"),
			Event::MeasureComplete => write!(f, "measure complete event"),
		}
	}
}

// Typed scalar properties of a session.  Units are volts, amps and seconds.
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
	SourceMode(SourceMode),
	OutputFunction(OutputFunction),
	VoltageLevel(f64),
	CurrentLimit(f64),
	VoltageLevelRange(f64),
	CurrentLimitRange(f64),
	ApertureTimeUnits(ApertureTimeUnits),
	ApertureTime(f64),
	MeasureRecordLengthIsFinite(bool),
	MeasureRecordLength(usize),
	SourceTriggerType(TriggerType),
	DigitalEdgeSourceTriggerInputTerminal(String),
	// Time between receiving the source trigger and asserting source complete
	SourceDelay(f64),
	MeasureWhen(MeasureWhen),
}

// One fetched sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
	pub voltage: f64,
	pub current: f64,
	pub in_compliance: bool,
}

impl Measurement {
	pub fn new(voltage:f64, current:f64) -> Self { Self{ voltage, current, in_compliance: false } }
}

// Capabilities the acquisition controller needs from an instrument driver.
//
// Settings may be buffered until commit() (or an initiate(), which commits implicitly). Values the
// hardware coerces are read back through the getters.
pub trait DcPowerSession {

	fn set(&mut self, setting:Setting) -> Result<()>;

	// Aperture time actually in effect, after any coercion by the instrument
	fn aperture_time(&mut self) -> Result<f64>;

	fn commit(&mut self) -> Result<()>;

	fn initiate(&mut self) -> Result<()>;

	// Stops generation and measurement.  The output keeps sourcing the last level.
	fn abort(&mut self) -> Result<()>;

	fn wait_for_event(&mut self, event:Event, timeout:Duration) -> Result<()>;

	fn fetch_multiple(&mut self, count:usize, timeout:Duration) -> Result<Vec<Measurement>>;

	fn reset(&mut self) -> Result<()>;

	fn close(&mut self) -> Result<()>;

}

impl<T: DcPowerSession + ?Sized> DcPowerSession for Box<T> {
	fn set(&mut self, setting:Setting) -> Result<()> { (**self).set(setting) }
	fn aperture_time(&mut self) -> Result<f64> { (**self).aperture_time() }
	fn commit(&mut self) -> Result<()> { (**self).commit() }
	fn initiate(&mut self) -> Result<()> { (**self).initiate() }
	fn abort(&mut self) -> Result<()> { (**self).abort() }
	fn wait_for_event(&mut self, event:Event, timeout:Duration) -> Result<()> { (**self).wait_for_event(event, timeout) }
	fn fetch_multiple(&mut self, count:usize, timeout:Duration) -> Result<Vec<Measurement>> { (**self).fetch_multiple(count, timeout) }
	fn reset(&mut self) -> Result<()> { (**self).reset() }
	fn close(&mut self) -> Result<()> { (**self).close() }
}

impl<T: DcPowerSession + ?Sized> DcPowerSession for &mut T {
	fn set(&mut self, setting:Setting) -> Result<()> { (**self).set(setting) }
	fn aperture_time(&mut self) -> Result<f64> { (**self).aperture_time() }
	fn commit(&mut self) -> Result<()> { (**self).commit() }
	fn initiate(&mut self) -> Result<()> { (**self).initiate() }
	fn abort(&mut self) -> Result<()> { (**self).abort() }
	fn wait_for_event(&mut self, event:Event, timeout:Duration) -> Result<()> { (**self).wait_for_event(event, timeout) }
	fn fetch_multiple(&mut self, count:usize, timeout:Duration) -> Result<Vec<Measurement>> { (**self).fetch_multiple(count, timeout) }
	fn reset(&mut self) -> Result<()> { (**self).reset() }
	fn close(&mut self) -> Result<()> { (**self).close() }
}

// Opens the configured instrument, resetting it first if asked to
pub fn open_session(config:&InstrumentConfig) -> Result<Box<dyn DcPowerSession>> {
	let mut session:Box<dyn DcPowerSession> = if config.simulate {
		info!(resource = %config.resource_name, "opening simulated session");
		Box::new(simulated::SimulatedSession::new(&config.resource_name, simulated::SimulatedConfig::default()))
	} else {
		Box::new(scpi_smu::ScpiSmu::open(&config.resource_name, &config.device)?)
	};

	if config.reset {
		session.reset()?;
	}
	Ok(session)
}
