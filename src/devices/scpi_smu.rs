
// Source-measure unit driven with SCPI over VXI-11.  The command set follows the common SMU dialect
// (:SOUR/:SENS/:TRIG subsystems, :FETC:ARR? returning interleaved voltage,current pairs).

use std::net::TcpStream;
use std::str;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Serialize, Deserialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::rpc::tcp_clients::RpcStream;
use crate::vxi11::{CoreClient, DEFAULT_IO_TIMEOUT};
use super::{ApertureTimeUnits, DcPowerSession, Event, Measurement, MeasureWhen, OutputFunction, Setting, SourceMode, TriggerType};

lazy_static! {
	static ref IDN_RE: Regex     = Regex::new("([^,]+),([^,]+),([^,]+),([^,\\s]+)").unwrap();
	static ref SYST_ERR_RE: Regex = Regex::new(r#"^\s*([+-]?\d+)\s*,\s*"?([^"]*)"?"#).unwrap();
}

// The instrument's error queue is finite; stop draining after this many entries
const MAX_QUEUED_ERRORS:usize = 32;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
	pub manufacturer: String,
	pub model: String,
	pub serial_num: String,
	pub fw_version: String,
}

pub fn parse_identity(idn:&str) -> Result<Identity> {
	let caps = IDN_RE.captures(idn).ok_or_else(|| Error::protocol(format!("Unable to parse *IDN? response {:?}", idn)))?;
	let field = |i:usize| caps.get(i).map(|m| m.as_str().trim().to_owned()).unwrap_or_default();
	Ok(Identity{ manufacturer: field(1), model: field(2), serial_num: field(3), fw_version: field(4) })
}

// Returns None for the "0,No error" entry
pub fn parse_system_error(resp:&str) -> Result<Option<(i32, String)>> {
	let caps = SYST_ERR_RE.captures(resp).ok_or_else(|| Error::protocol(format!("Unable to parse :SYST:ERR? response {:?}", resp)))?;
	let code:i32 = caps[1].parse().map_err(|_| Error::protocol(format!("Bad error code in {:?}", resp)))?;
	if code == 0 { Ok(None) }
	else { Ok(Some((code, caps[2].trim().to_owned()))) }
}

// Parses the interleaved "v0,i0,v1,i1,..." response of :FETC:ARR?
pub fn parse_fetch_array(resp:&str, current_limit:f64) -> Result<Vec<Measurement>> {
	let values = resp.trim().split(',')
		.filter(|s| !s.trim().is_empty())
		.map(|s| s.trim().parse::<f64>().map_err(|_| Error::protocol(format!("Unable to parse {:?} as a number", s))))
		.collect::<Result<Vec<f64>>>()?;

	if values.len() % 2 != 0 {
		return Err(Error::protocol(format!("Expected voltage,current pairs but got {} values", values.len())));
	}

	Ok(values.chunks(2).map(|pair| Measurement {
		voltage: pair[0],
		current: pair[1],
		in_compliance: current_limit > 0.0 && pair[1].abs() >= current_limit,
	}).collect())
}

// SCPI for a setting.  Some settings have no command of their own (they only change how later
// settings are sent), those return None.
pub fn command_for(setting:&Setting, units:ApertureTimeUnits) -> Result<Option<String>> {
	let cmd = match setting {
		Setting::SourceMode(SourceMode::SinglePoint) => ":SOUR:VOLT:MODE FIX".to_owned(),
		Setting::SourceMode(SourceMode::Sequence)    => ":SOUR:VOLT:MODE LIST".to_owned(),
		Setting::OutputFunction(OutputFunction::DcVoltage) => ":SOUR:FUNC:MODE VOLT".to_owned(),
		Setting::OutputFunction(OutputFunction::DcCurrent) => ":SOUR:FUNC:MODE CURR".to_owned(),
		Setting::VoltageLevel(v)      => format!(":SOUR:VOLT {}", v),
		Setting::CurrentLimit(a)      => format!(":SENS:CURR:PROT {}", a),
		Setting::VoltageLevelRange(v) => format!(":SOUR:VOLT:RANG {}", v),
		Setting::CurrentLimitRange(a) => format!(":SENS:CURR:RANG {}", a),
		Setting::ApertureTimeUnits(_) => return Ok(None),
		Setting::ApertureTime(t) => match units {
			ApertureTimeUnits::Seconds         => format!(":SENS:CURR:APER {0};:SENS:VOLT:APER {0}", t),
			ApertureTimeUnits::PowerLineCycles => format!(":SENS:CURR:NPLC {0};:SENS:VOLT:NPLC {0}", t),
		},
		Setting::MeasureRecordLengthIsFinite(true) => return Ok(None),
		Setting::MeasureRecordLengthIsFinite(false) => {
			return Err(Error::configuration("This instrument only supports finite measurement records"));
		},
		Setting::MeasureRecordLength(n) => format!(":TRIG:ACQ:COUN {}", n),
		Setting::SourceTriggerType(TriggerType::None)         => ":TRIG:TRAN:SOUR AINT".to_owned(),
		Setting::SourceTriggerType(TriggerType::SoftwareEdge) => ":TRIG:TRAN:SOUR BUS".to_owned(),
		// The terminal picks the input line
		Setting::SourceTriggerType(TriggerType::DigitalEdge)  => return Ok(None),
		Setting::DigitalEdgeSourceTriggerInputTerminal(t) => {
			if t.is_empty() || !t.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
				return Err(Error::configuration(format!("Invalid trigger terminal {:?}", t)));
			}
			format!(":TRIG:TRAN:SOUR {}", t)
		},
		Setting::SourceDelay(d) => format!(":TRIG:TRAN:DEL {}", d),
		Setting::MeasureWhen(MeasureWhen::AutomaticallyAfterSourceComplete) => ":TRIG:ACQ:SOUR AINT".to_owned(),
		Setting::MeasureWhen(MeasureWhen::OnDemand)         => ":TRIG:ACQ:SOUR BUS".to_owned(),
		Setting::MeasureWhen(MeasureWhen::OnMeasureTrigger) => ":TRIG:ACQ:SOUR EXT".to_owned(),
	};
	Ok(Some(cmd))
}

pub struct ScpiSmu<S: RpcStream = TcpStream> {
	core: CoreClient<S>,
	pub identity: Identity,
	units: ApertureTimeUnits,
	current_limit: f64,
}

impl ScpiSmu<TcpStream> {

	pub fn open(host:&str, device:&str) -> Result<Self> {
		let mut core = CoreClient::new(host)?;
		core.create_link(device)?;
		let smu = Self::from_core(core)?;
		info!(host, manufacturer = %smu.identity.manufacturer, model = %smu.identity.model, serial = %smu.identity.serial_num, "connected to SMU");
		Ok(smu)
	}

}

impl<S: RpcStream> ScpiSmu<S> {

	// Takes over a core channel that already has a link
	pub fn from_core(mut core:CoreClient<S>) -> Result<Self> {
		let idn = core.ask(b"*IDN?", DEFAULT_IO_TIMEOUT)?;
		let idn = str::from_utf8(&idn).map_err(|_| Error::protocol("Received a response to *IDN? but unable to interpret as UTF-8"))?;
		let identity = parse_identity(idn)?;

		let mut smu = Self{ core, identity, units: ApertureTimeUnits::Seconds, current_limit: 0.0 };
		smu.write(":FORM:ELEM:SENS VOLT,CURR")?;
		Ok(smu)
	}

	pub fn write(&mut self, cmd:&str) -> Result<()> {
		debug!(cmd, "scpi write");
		self.core.write(cmd.as_bytes(), DEFAULT_IO_TIMEOUT)
	}

	pub fn ask_str(&mut self, cmd:&str) -> Result<String> {
		self.ask_str_with_timeout(cmd, DEFAULT_IO_TIMEOUT)
	}

	fn ask_str_with_timeout(&mut self, cmd:&str, timeout:Duration) -> Result<String> {
		debug!(cmd, "scpi query");
		let resp = self.core.ask_with_timeout(cmd.as_bytes(), timeout)?;
		String::from_utf8(resp).map_err(|_| Error::protocol("Unable to parse response as UTF-8"))
	}

	// Pulls everything off the error queue and reports the first entry
	fn check_errors(&mut self) -> Result<()> {
		let mut first:Option<(i32, String)> = None;
		for _ in 0..MAX_QUEUED_ERRORS {
			let resp = self.ask_str(":SYST:ERR?")?;
			match parse_system_error(&resp)? {
				None => break,
				Some((code, msg)) => {
					warn!(code, msg = %msg, "instrument reported an error");
					first.get_or_insert((code, msg));
				},
			}
		}

		match first {
			None => Ok(()),
			Some((code, msg)) => Err(Error::configuration(format!("instrument error {}: {}", code, msg))),
		}
	}

}

impl<S: RpcStream> DcPowerSession for ScpiSmu<S> {

	fn set(&mut self, setting:Setting) -> Result<()> {
		match setting {
			Setting::ApertureTimeUnits(u) => self.units = u,
			Setting::CurrentLimit(a) => self.current_limit = a,
			_ => { },
		}
		match command_for(&setting, self.units)? {
			Some(cmd) => self.write(&cmd),
			None => Ok(()),
		}
	}

	fn aperture_time(&mut self) -> Result<f64> {
		let query = match self.units {
			ApertureTimeUnits::Seconds         => ":SENS:CURR:APER?",
			ApertureTimeUnits::PowerLineCycles => ":SENS:CURR:NPLC?",
		};
		let resp = self.ask_str(query)?;
		resp.trim().parse::<f64>().map_err(|_| Error::protocol(format!("Unable to parse aperture time {:?}", resp)))
	}

	fn commit(&mut self) -> Result<()> {
		self.ask_str("*OPC?")?;
		self.check_errors()
	}

	// Nothing gets sourced until the instrument has accepted every setting sent so far
	fn initiate(&mut self) -> Result<()> {
		self.commit()?;
		self.write(":OUTP ON")?;
		self.write(":INIT")
	}

	fn abort(&mut self) -> Result<()> { self.write(":ABOR") }

	fn wait_for_event(&mut self, event:Event, timeout:Duration) -> Result<()> {
		match self.ask_str_with_timeout("*OPC?", timeout) {
			Ok(_) => Ok(()),
			Err(e) if e.is_timeout() => Err(Error::Timeout{ event: event.to_string(), timeout }),
			Err(e) => Err(e),
		}
	}

	fn fetch_multiple(&mut self, count:usize, timeout:Duration) -> Result<Vec<Measurement>> {
		match self.ask_str_with_timeout("*OPC?", timeout) {
			Ok(_) => { },
			Err(e) if e.is_timeout() => return Err(Error::AcquisitionTimeout{ timeout }),
			Err(e) => return Err(e),
		}

		let resp = self.ask_str(":FETC:ARR?")?;
		let mut samples = parse_fetch_array(&resp, self.current_limit)?;
		if samples.len() < count {
			return Err(Error::protocol(format!("Asked for {} samples but the instrument returned {}", count, samples.len())));
		}
		samples.truncate(count);
		Ok(samples)
	}

	fn reset(&mut self) -> Result<()> {
		self.write("*RST")?;
		self.write("*CLS")?;
		self.units = ApertureTimeUnits::Seconds;
		self.current_limit = 0.0;
		Ok(())
	}

	fn close(&mut self) -> Result<()> {
		if self.core.link().is_some() { self.core.destroy_link() }
		else { Ok(()) }
	}

}

impl<S: RpcStream> Drop for ScpiSmu<S> {

	fn drop(&mut self) {
		if let Err(e) = self.close() {
			warn!(error = %e, "unable to destroy VXI-11 link");
		}
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::tcp_clients::TcpClient;
	use crate::rpc::tcp_clients::tests::{framed_reply, ScriptedStream};
	use crate::vxi11::{DEVICE_CORE_PROG, DEVICE_CORE_VERS, ERR_IO_TIMEOUT, REASON_END};
	use crate::xdr::Packer;

	fn words(ws:&[i32]) -> Vec<u8> {
		let mut p = Packer::new();
		for w in ws { p.pack_i32(*w).unwrap(); }
		p.as_bytes().to_vec()
	}

	// Canned VXI-11 replies for a session, in call order
	struct Script {
		xid: u32,
		bytes: Vec<u8>,
	}

	impl Script {

		// Link, *IDN? and the data format command sent on open
		fn new() -> Self {
			let mut script = Self{ xid: 0, bytes: vec![] };
			script.reply(&words(&[0, 7, 1025, 4096]))
				.ask("*IDN?", "Keysight Technologies,B2901A,MY51140001,3.4.2011.5100\n")
				.write(":FORM:ELEM:SENS VOLT,CURR");
			script
		}

		fn reply(&mut self, body:&[u8]) -> &mut Self {
			self.xid += 1;
			self.bytes.extend(framed_reply(self.xid, body, 1));
			self
		}

		fn write(&mut self, cmd:&str) -> &mut Self {
			self.reply(&words(&[0, cmd.len() as i32]))
		}

		fn read(&mut self, error:i32, data:&[u8]) -> &mut Self {
			let mut p = Packer::new();
			p.pack_i32(error).unwrap();
			p.pack_i32(if error == 0 { REASON_END } else { 0 }).unwrap();
			p.pack_variable_len_opaque(data).unwrap();
			self.reply(p.as_bytes())
		}

		fn ask(&mut self, cmd:&str, resp:&str) -> &mut Self {
			self.write(cmd);
			self.read(0, resp.as_bytes())
		}

		fn open(self) -> ScpiSmu<ScriptedStream> {
			let stream = ScriptedStream::new(self.bytes);
			let mut core = CoreClient::from_client(TcpClient::from_stream(stream, DEVICE_CORE_PROG, DEVICE_CORE_VERS));
			core.create_link("inst0").unwrap();
			ScpiSmu::from_core(core).unwrap()
		}

	}

	// Everything the session wrote, SCPI text included
	fn sent(smu:&ScpiSmu<ScriptedStream>) -> String {
		String::from_utf8_lossy(&smu.core.client().get_ref().output).into_owned()
	}

	#[test]
	fn open_reads_identity() {
		let smu = Script::new().open();
		assert_eq!(smu.identity.model, "B2901A");
		assert!(sent(&smu).contains(":FORM:ELEM:SENS VOLT,CURR"));
	}

	#[test]
	fn rejected_setting_stops_initiate_before_the_output_turns_on() {
		let mut script = Script::new();
		script.write(":SOUR:VOLT 50")
			.ask("*OPC?", "1\n")
			.ask(":SYST:ERR?", "-222,\"Data out of range\"\n")
			.ask(":SYST:ERR?", "+0,\"No error\"\n");
		let mut smu = script.open();

		smu.set(Setting::VoltageLevel(50.0)).unwrap();
		let e = smu.initiate().unwrap_err();
		assert!(matches!(e, Error::Configuration(_)));
		assert!(e.to_string().contains("-222"));

		let sent = sent(&smu);
		assert!(sent.contains(":SOUR:VOLT 50"));
		assert!(!sent.contains(":OUTP ON"));
		assert!(!sent.contains(":INIT"));
	}

	#[test]
	fn initiate_commits_then_turns_the_output_on() {
		let mut script = Script::new();
		script.ask("*OPC?", "1\n")
			.ask(":SYST:ERR?", "+0,\"No error\"\n")
			.write(":OUTP ON")
			.write(":INIT");
		let mut smu = script.open();
		smu.initiate().unwrap();

		let sent = sent(&smu);
		let opc = sent.find("*OPC?").unwrap();
		let err = sent.find(":SYST:ERR?").unwrap();
		let on = sent.find(":OUTP ON").unwrap();
		let init = sent.find(":INIT").unwrap();
		assert!(opc < err && err < on && on < init);
	}

	#[test]
	fn instrument_timeouts_become_event_and_acquisition_timeouts() {
		let mut script = Script::new();
		script.write("*OPC?").read(ERR_IO_TIMEOUT, b"")
			.write("*OPC?").read(ERR_IO_TIMEOUT, b"");
		let mut smu = script.open();
		let wait = Duration::from_millis(500);

		let e = smu.wait_for_event(Event::SourceComplete, wait).unwrap_err();
		assert!(matches!(e, Error::Timeout{ ref event, timeout } if event.as_str() == "source complete event" && timeout == wait));

		let e = smu.fetch_multiple(2, wait).unwrap_err();
		assert!(matches!(e, Error::AcquisitionTimeout{ timeout } if timeout == wait));
	}

	#[test]
	fn fetch_checks_count_and_flags_compliance() {
		let mut script = Script::new();
		script.ask("*OPC?", "1\n")
			.ask(":FETC:ARR?", "5.0,0.5,5.0,0.5\n")
			.write(":SENS:CURR:PROT 1")
			.ask("*OPC?", "1\n")
			.ask(":FETC:ARR?", "5.0,0.5,4.9,1.0,5.0,0.5\n");
		let mut smu = script.open();
		let wait = Duration::from_secs(1);

		assert!(matches!(smu.fetch_multiple(3, wait), Err(Error::Protocol(_))));

		smu.set(Setting::CurrentLimit(1.0)).unwrap();
		let m = smu.fetch_multiple(2, wait).unwrap();
		assert_eq!(m, vec![
			Measurement{ voltage: 5.0, current: 0.5, in_compliance: false },
			Measurement{ voltage: 4.9, current: 1.0, in_compliance: true },
		]);
	}

	#[test]
	fn close_destroys_the_link_once() {
		let mut script = Script::new();
		script.reply(&words(&[0]));
		let mut smu = script.open();

		smu.close().unwrap();
		assert!(smu.core.link().is_none());
		smu.close().unwrap();
	}

	#[test]
	fn identity_fields() {
		let id = parse_identity("Keysight Technologies,B2901A,MY51140001,3.4.2011.5100\n").unwrap();
		assert_eq!(id.manufacturer, "Keysight Technologies");
		assert_eq!(id.model, "B2901A");
		assert_eq!(id.serial_num, "MY51140001");
		assert_eq!(id.fw_version, "3.4.2011.5100");
		assert!(parse_identity("garbage").is_err());
	}

	#[test]
	fn system_error_queue_entries() {
		assert_eq!(parse_system_error("+0,\"No error\"\n").unwrap(), None);
		assert_eq!(parse_system_error("-222,\"Data out of range\"").unwrap(), Some((-222, "Data out of range".to_owned())));
		assert!(parse_system_error("nonsense").is_err());
	}

	#[test]
	fn fetch_array_is_paired_and_flags_compliance() {
		let m = parse_fetch_array("5.0,0.5,4.99,1.0\n", 1.0).unwrap();
		assert_eq!(m, vec![
			Measurement{ voltage: 5.0, current: 0.5, in_compliance: false },
			Measurement{ voltage: 4.99, current: 1.0, in_compliance: true },
		]);
		assert!(parse_fetch_array("5.0,0.5,4.9", 1.0).is_err());
		assert!(parse_fetch_array("5.0,abc", 1.0).is_err());
	}

	#[test]
	fn settings_map_to_scpi() {
		let s = ApertureTimeUnits::Seconds;
		assert_eq!(command_for(&Setting::VoltageLevel(5.0), s).unwrap().unwrap(), ":SOUR:VOLT 5");
		assert_eq!(command_for(&Setting::ApertureTime(0.00001), s).unwrap().unwrap(), ":SENS:CURR:APER 0.00001;:SENS:VOLT:APER 0.00001");
		assert_eq!(command_for(&Setting::ApertureTime(2.0), ApertureTimeUnits::PowerLineCycles).unwrap().unwrap(), ":SENS:CURR:NPLC 2;:SENS:VOLT:NPLC 2");
		assert_eq!(command_for(&Setting::MeasureRecordLength(200), s).unwrap().unwrap(), ":TRIG:ACQ:COUN 200");
		assert_eq!(command_for(&Setting::DigitalEdgeSourceTriggerInputTerminal("EXT2".into()), s).unwrap().unwrap(), ":TRIG:TRAN:SOUR EXT2");
		assert_eq!(command_for(&Setting::SourceTriggerType(TriggerType::DigitalEdge), s).unwrap(), None);
		assert!(command_for(&Setting::DigitalEdgeSourceTriggerInputTerminal("EXT2;*RST".into()), s).is_err());
		assert!(command_for(&Setting::MeasureRecordLengthIsFinite(false), s).is_err());
	}
}
