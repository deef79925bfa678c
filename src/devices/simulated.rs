
// An in-process model of a source-measure unit.  It follows the same contract as the hardware drivers
// (settings are buffered until commit, initiate commits implicitly, fetches are bounded by a timeout)
// and keeps a journal of every call so tests can check sequencing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use tracing::debug;

use crate::error::{Error, Result};
use super::{
	ApertureTimeUnits, DcPowerSession, Event, Measurement, MeasureWhen, OutputFunction, Setting, SourceMode, TriggerType,
};

#[derive(Debug, Clone)]
pub struct SimulatedConfig {
	// Sampling clock that aperture times are coerced to
	pub timebase_hz: f64,
	pub max_voltage_range: f64,
	pub max_current_range: f64,
	// Resistive load on the output
	pub load_ohms: f64,
	// Peak amplitude of uniform noise added to each sample, in base units
	pub noise: f64,
	// Whether the source-complete event ever arrives
	pub settles: bool,
	pub seed: u64,
}

impl Default for SimulatedConfig {
	fn default() -> Self {
		Self {
			timebase_hz: 1.8e6,
			max_voltage_range: 60.0,
			max_current_range: 3.0,
			load_ohms: 10.0,
			noise: 0.0,
			settles: true,
			seed: 0,
		}
	}
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
	Set(Setting),
	Commit,
	Initiate,
	Abort,
	WaitForEvent(Event),
	FetchMultiple(usize),
	Reset,
	Close,
}

// Shared view of the calls made on a simulated session; it outlives the session itself
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Call>>>);

impl Journal {

	fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
		self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	fn push(&self, call:Call) { self.lock().push(call); }

	pub fn calls(&self) -> Vec<Call> { self.lock().clone() }

	pub fn count(&self, call:&Call) -> usize { self.lock().iter().filter(|c| *c == call).count() }

}

#[derive(Debug, Clone, PartialEq)]
struct Settings {
	source_mode: SourceMode,
	output_function: OutputFunction,
	voltage_level: f64,
	current_limit: f64,
	voltage_level_range: f64,
	current_limit_range: f64,
	aperture_time_units: ApertureTimeUnits,
	aperture_time: f64,
	record_length_is_finite: bool,
	record_length: usize,
	trigger_type: TriggerType,
	trigger_terminal: String,
	source_delay: f64,
	measure_when: MeasureWhen,
}

impl Default for Settings {
	fn default() -> Self {
		Self {
			source_mode: SourceMode::SinglePoint,
			output_function: OutputFunction::DcVoltage,
			voltage_level: 0.0,
			current_limit: 0.01,
			voltage_level_range: 6.0,
			current_limit_range: 0.01,
			aperture_time_units: ApertureTimeUnits::Seconds,
			aperture_time: 0.0333,
			record_length_is_finite: true,
			record_length: 1,
			trigger_type: TriggerType::None,
			trigger_terminal: String::new(),
			source_delay: 0.0,
			measure_when: MeasureWhen::AutomaticallyAfterSourceComplete,
		}
	}
}

pub struct SimulatedSession {
	resource_name: String,
	config: SimulatedConfig,
	pending: Settings,
	committed: Settings,
	running: bool,
	closed: bool,
	triggers: VecDeque<bool>,
	journal: Journal,
	rng: StdRng,
}

fn finite(name:&str, x:f64) -> Result<f64> {
	if x.is_finite() { Ok(x) }
	else { Err(Error::configuration(format!("{} must be a finite number, got {}", name, x))) }
}

fn positive(name:&str, x:f64) -> Result<f64> {
	if finite(name, x)? > 0.0 { Ok(x) }
	else { Err(Error::configuration(format!("{} must be greater than zero, got {}", name, x))) }
}

impl SimulatedSession {

	pub fn new(resource_name:&str, config:SimulatedConfig) -> Self {
		let rng = StdRng::seed_from_u64(config.seed);
		Self {
			resource_name: resource_name.to_owned(),
			config,
			pending: Settings::default(),
			committed: Settings::default(),
			running: false,
			closed: false,
			triggers: VecDeque::new(),
			journal: Journal::default(),
			rng,
		}
	}

	pub fn journal(&self) -> Journal { self.journal.clone() }

	// Scripts whether the next acquisitions see their trigger edge.  Unscripted acquisitions are triggered.
	pub fn queue_triggers<I: IntoIterator<Item = bool>>(&mut self, outcomes:I) {
		self.triggers.extend(outcomes);
	}

	fn ensure_open(&self) -> Result<()> {
		if self.closed { Err(Error::device(format!("Session {} is closed", self.resource_name))) }
		else { Ok(()) }
	}

	fn coerce_aperture(&self, aperture:f64) -> f64 {
		let ticks = (aperture * self.config.timebase_hz).round().max(1.0);
		ticks / self.config.timebase_hz
	}

	fn apply(&mut self) -> Result<()> {
		let s = &self.pending;
		if s.voltage_level.abs() > s.voltage_level_range {
			return Err(Error::configuration(format!("Voltage level {} V exceeds the {} V range", s.voltage_level, s.voltage_level_range)));
		}
		if s.current_limit > s.current_limit_range {
			return Err(Error::configuration(format!("Current limit {} A exceeds the {} A range", s.current_limit, s.current_limit_range)));
		}
		if s.trigger_type == TriggerType::DigitalEdge && s.trigger_terminal.is_empty() {
			return Err(Error::configuration("Digital edge trigger needs an input terminal"));
		}

		let mut committed = s.clone();
		committed.aperture_time = self.coerce_aperture(s.aperture_time);
		self.pending.aperture_time = committed.aperture_time;
		self.committed = committed;
		Ok(())
	}

	fn sample(&mut self) -> Measurement {
		let s = &self.committed;
		let demanded = s.voltage_level / self.config.load_ohms;
		let in_compliance = demanded.abs() > s.current_limit;
		let (mut voltage, mut current) = if in_compliance {
			let current = s.current_limit.copysign(demanded);
			(current * self.config.load_ohms, current)
		} else {
			(s.voltage_level, demanded)
		};

		if self.config.noise > 0.0 {
			let n = self.config.noise;
			voltage += self.rng.gen_range(-n..=n);
			current += self.rng.gen_range(-n..=n);
		}
		Measurement{ voltage, current, in_compliance }
	}

}

impl DcPowerSession for SimulatedSession {

	fn set(&mut self, setting:Setting) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::Set(setting.clone()));

		let s = &mut self.pending;
		match setting {
			Setting::SourceMode(m) => s.source_mode = m,
			Setting::OutputFunction(f) => s.output_function = f,
			Setting::VoltageLevel(v) => s.voltage_level = finite("voltage_level", v)?,
			Setting::CurrentLimit(a) => s.current_limit = positive("current_limit", a)?,
			Setting::VoltageLevelRange(v) => {
				if positive("voltage_level_range", v)? > self.config.max_voltage_range {
					return Err(Error::configuration(format!("Voltage range {} V not supported, maximum is {} V", v, self.config.max_voltage_range)));
				}
				s.voltage_level_range = v;
			},
			Setting::CurrentLimitRange(a) => {
				if positive("current_limit_range", a)? > self.config.max_current_range {
					return Err(Error::configuration(format!("Current range {} A not supported, maximum is {} A", a, self.config.max_current_range)));
				}
				s.current_limit_range = a;
			},
			Setting::ApertureTimeUnits(u) => s.aperture_time_units = u,
			Setting::ApertureTime(t) => s.aperture_time = positive("aperture_time", t)?,
			Setting::MeasureRecordLengthIsFinite(f) => s.record_length_is_finite = f,
			Setting::MeasureRecordLength(n) => {
				if n == 0 { return Err(Error::configuration("measure_record_length must be at least 1")); }
				s.record_length = n;
			},
			Setting::SourceTriggerType(t) => s.trigger_type = t,
			Setting::DigitalEdgeSourceTriggerInputTerminal(t) => s.trigger_terminal = t,
			Setting::SourceDelay(d) => {
				if finite("source_delay", d)? < 0.0 { return Err(Error::configuration("source_delay can't be negative")); }
				s.source_delay = d;
			},
			Setting::MeasureWhen(m) => s.measure_when = m,
		}
		Ok(())
	}

	fn aperture_time(&mut self) -> Result<f64> {
		self.ensure_open()?;
		Ok(self.committed.aperture_time)
	}

	fn commit(&mut self) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::Commit);
		self.apply()
	}

	fn initiate(&mut self) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::Initiate);
		if self.running {
			return Err(Error::device("Session is already running; abort it first"));
		}
		if self.pending != self.committed { self.apply()?; }
		self.running = true;
		debug!(resource = %self.resource_name, "simulated session initiated");
		Ok(())
	}

	fn abort(&mut self) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::Abort);
		self.running = false;
		Ok(())
	}

	fn wait_for_event(&mut self, event:Event, timeout:Duration) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::WaitForEvent(event));
		if !self.running || (event == Event::SourceComplete && !self.config.settles) {
			return Err(Error::Timeout{ event: event.to_string(), timeout });
		}
		Ok(())
	}

	fn fetch_multiple(&mut self, count:usize, timeout:Duration) -> Result<Vec<Measurement>> {
		self.ensure_open()?;
		self.journal.push(Call::FetchMultiple(count));
		if !self.running {
			return Err(Error::device("Fetch requires an initiated session"));
		}
		if self.committed.record_length_is_finite && count > self.committed.record_length {
			return Err(Error::device(format!("Requested {} samples but the record length is {}", count, self.committed.record_length)));
		}

		let triggered = match self.committed.trigger_type {
			TriggerType::None => true,
			_ => self.triggers.pop_front().unwrap_or(true),
		};
		let needed = self.committed.source_delay + count as f64 * self.committed.aperture_time;
		if !triggered || needed > timeout.as_secs_f64() {
			return Err(Error::AcquisitionTimeout{ timeout });
		}

		Ok((0..count).map(|_| self.sample()).collect())
	}

	fn reset(&mut self) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::Reset);
		self.running = false;
		self.pending = Settings::default();
		self.committed = Settings::default();
		Ok(())
	}

	fn close(&mut self) -> Result<()> {
		self.ensure_open()?;
		self.journal.push(Call::Close);
		self.running = false;
		self.closed = true;
		Ok(())
	}

}

#[cfg(test)]
mod tests {
	use super::*;

	fn session() -> SimulatedSession { SimulatedSession::new("DC_01", SimulatedConfig::default()) }

	#[test]
	fn aperture_is_coerced_to_timebase_ticks() {
		let mut s = session();
		s.set(Setting::ApertureTime(1.0 / 100e3)).unwrap();
		s.commit().unwrap();
		assert!((s.aperture_time().unwrap() - 1e-5).abs() < 1e-15);

		s.set(Setting::ApertureTime(1e-9)).unwrap();
		s.commit().unwrap();
		assert_eq!(s.aperture_time().unwrap(), 1.0 / 1.8e6);
	}

	#[test]
	fn commit_rejects_level_beyond_range() {
		let mut s = session();
		s.set(Setting::VoltageLevelRange(6.0)).unwrap();
		s.set(Setting::VoltageLevel(7.5)).unwrap();
		assert!(matches!(s.commit(), Err(Error::Configuration(_))));
	}

	#[test]
	fn unsupported_ranges_are_rejected_at_set() {
		let mut s = session();
		assert!(s.set(Setting::CurrentLimitRange(10.0)).is_err());
		assert!(s.set(Setting::VoltageLevelRange(-1.0)).is_err());
		assert!(s.set(Setting::ApertureTime(f64::NAN)).is_err());
	}

	#[test]
	fn fetch_needs_initiate_and_respects_triggers() {
		let mut s = session();
		s.set(Setting::SourceTriggerType(TriggerType::DigitalEdge)).unwrap();
		s.set(Setting::DigitalEdgeSourceTriggerInputTerminal("PXI_Trig2".into())).unwrap();
		s.set(Setting::MeasureRecordLength(4)).unwrap();
		s.set(Setting::ApertureTime(1e-5)).unwrap();
		assert!(s.fetch_multiple(4, Duration::from_secs(1)).is_err());

		s.queue_triggers(vec![false]);
		s.initiate().unwrap();
		let e = s.fetch_multiple(4, Duration::from_secs(1)).unwrap_err();
		assert!(matches!(e, Error::AcquisitionTimeout{ .. }));
		s.abort().unwrap();

		s.initiate().unwrap();
		assert_eq!(s.fetch_multiple(4, Duration::from_secs(1)).unwrap().len(), 4);
	}

	#[test]
	fn samples_follow_load_and_compliance() {
		let mut s = session();
		s.set(Setting::CurrentLimitRange(1.0)).unwrap();
		s.set(Setting::CurrentLimit(1.0)).unwrap();
		s.set(Setting::VoltageLevel(5.0)).unwrap();
		s.set(Setting::MeasureRecordLength(2)).unwrap();
		s.initiate().unwrap();
		let m = s.fetch_multiple(2, Duration::from_secs(1)).unwrap();
		assert_eq!(m[0], Measurement{ voltage: 5.0, current: 0.5, in_compliance: false });
		s.abort().unwrap();

		s.set(Setting::CurrentLimit(0.25)).unwrap();
		s.initiate().unwrap();
		let m = s.fetch_multiple(1, Duration::from_secs(1)).unwrap();
		assert_eq!(m[0], Measurement{ voltage: 2.5, current: 0.25, in_compliance: true });
	}

	#[test]
	fn settle_timeout_when_source_never_settles() {
		let mut s = SimulatedSession::new("DC_01", SimulatedConfig{ settles: false, ..Default::default() });
		s.initiate().unwrap();
		let e = s.wait_for_event(Event::SourceComplete, Duration::from_millis(50)).unwrap_err();
		assert!(matches!(e, Error::Timeout{ .. }));
	}

	#[test]
	fn nothing_works_after_close() {
		let mut s = session();
		let journal = s.journal();
		s.close().unwrap();
		assert!(s.initiate().is_err());
		assert!(s.close().is_err());
		assert_eq!(journal.calls(), vec![Call::Close]);
	}
}
