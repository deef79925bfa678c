
// External data representation, a protocol for serializing data to be sent over the network
pub mod xdr;

// Remote procedure call, a protocol build on top of XDR to provide something like C-style function calls over the network
pub mod rpc;

// A protocol using RPC that's meant to communicate with instruments like source-measure units and power supplies
pub mod vxi11;

// Instrument sessions: the capability trait the controller drives, plus the simulated and VXI-11 implementations
pub mod devices;

// Record length and averaging
pub mod measurement;

// Configure, prime, arm, then the fetch/print loop
pub mod acquisition;

pub mod config;
pub mod error;
pub mod logging;

pub use crate::acquisition::{run, AcquisitionController, SessionState};
pub use crate::config::AcquisitionConfig;
pub use crate::devices::{DcPowerSession, Measurement};
pub use crate::error::{Error, Result};
pub use crate::measurement::{average, record_length, AveragedReading};
