
// Reducing fetched records to the numbers we print

use serde::{Serialize, Deserialize};

use crate::devices::Measurement;
use crate::error::{Error, Result};

// Ratios this close to an integer are treated as that integer before flooring, so that
// e.g. 2 ms / 10 us gives 200 samples rather than 199
const RECORD_LENGTH_SNAP:f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AveragedReading {
	pub voltage: f64,
	pub current: f64,
	pub samples: usize,
	pub compliance_samples: usize,
}

impl AveragedReading {

	pub fn voltage_line(&self) -> String { format!("Average Voltage = {:.3}V", self.voltage) }

	// Current is printed in milliamps
	pub fn current_line(&self) -> String { format!("Average Current = {:.3}mA", self.current * 1000.0) }

}

// Mean voltage and current of a record.  Uses a running mean, so a record of identical samples
// averages to exactly that sample.
pub fn average(record:&[Measurement]) -> Result<AveragedReading> {
	if record.is_empty() { return Err(Error::EmptyRecord); }

	let mut voltage = 0.0;
	let mut current = 0.0;
	for (i, m) in record.iter().enumerate() {
		let k = (i + 1) as f64;
		voltage += (m.voltage - voltage) / k;
		current += (m.current - current) / k;
	}

	Ok(AveragedReading {
		voltage,
		current,
		samples: record.len(),
		compliance_samples: record.iter().filter(|m| m.in_compliance).count(),
	})
}

// Number of whole apertures that fit in the measurement interval
pub fn record_length(measurement_interval:f64, aperture_time:f64) -> Result<usize> {
	if !(aperture_time.is_finite() && aperture_time > 0.0) {
		return Err(Error::configuration(format!("aperture time must be positive, got {}", aperture_time)));
	}
	if !(measurement_interval.is_finite() && measurement_interval > 0.0) {
		return Err(Error::configuration(format!("measurement interval must be positive, got {}", measurement_interval)));
	}

	let ratio = measurement_interval / aperture_time;
	let nearest = ratio.round();
	let n = if (ratio - nearest).abs() <= RECORD_LENGTH_SNAP * nearest.max(1.0) { nearest } else { ratio.floor() };

	if n < 1.0 {
		return Err(Error::configuration(format!(
			"measurement interval {} s is shorter than one aperture of {} s", measurement_interval, aperture_time)));
	}
	if n > usize::MAX as f64 {
		return Err(Error::configuration("record length is too large"));
	}
	Ok(n as usize)
}
