
// Error type shared by the transport, the session implementations and the acquisition controller

use std::io;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {

	// A setting is outside what the instrument supports, or timing parameters are inconsistent
	#[error("configuration error: {0}")]
	Configuration(String),

	// The source-complete event didn't arrive in time
	#[error("timed out after {timeout:?} waiting for {event}")]
	Timeout { event: String, timeout: Duration },

	// The trigger/fetch didn't complete in time
	#[error("acquisition timed out after {timeout:?}")]
	AcquisitionTimeout { timeout: Duration },

	#[error("cannot average an empty measurement record")]
	EmptyRecord,

	#[error("{operation} is not valid while the session is {state}")]
	InvalidState { operation: &'static str, state: String },

	#[error("I/O error: {0}")]
	Io(#[from] io::Error),

	#[error("RPC error: {0}")]
	Rpc(String),

	#[error("XDR error: {0}")]
	Xdr(String),

	// Reported by the instrument or by the VXI-11 server
	#[error("device error: {0}")]
	Device(String),

	// The instrument answered with something we can't interpret
	#[error("protocol error: {0}")]
	Protocol(String),

	#[error("unable to load configuration: {0}")]
	Config(#[from] Box<figment::Error>),
}

impl Error {

	pub fn configuration(msg:impl Into<String>) -> Self { Error::Configuration(msg.into()) }
	pub fn rpc(msg:impl Into<String>) -> Self { Error::Rpc(msg.into()) }
	pub fn xdr(msg:impl Into<String>) -> Self { Error::Xdr(msg.into()) }
	pub fn device(msg:impl Into<String>) -> Self { Error::Device(msg.into()) }
	pub fn protocol(msg:impl Into<String>) -> Self { Error::Protocol(msg.into()) }

	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout{ .. } | Error::AcquisitionTimeout{ .. })
	}

}

impl From<figment::Error> for Error {
	fn from(e:figment::Error) -> Self { Error::Config(Box::new(e)) }
}
