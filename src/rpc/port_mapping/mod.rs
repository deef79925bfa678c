
pub const PMAP_PROG:u32 = 100000;
pub const PMAP_VERS:u32 = 2;
pub const PMAP_PORT:u16 = 111;

pub const PMAPPROC_NULL:u32    = 0;     // (void) -> void
pub const PMAPPROC_GETPORT:u32 = 3;     // (mapping) -> unsigned int

use std::io::{Read, Write};
use std::net::TcpStream;

use tracing::debug;

use crate::error::{Error, Result};

use super::{IPPROTO_TCP, IPPROTO_UDP};
use super::xdr_pack;
use super::tcp_clients::TcpClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
	Tcp,
	Udp,
}

impl Protocol {
	pub fn to_u32(self) -> u32 { match self {
		Protocol::Tcp => IPPROTO_TCP,
		Protocol::Udp => IPPROTO_UDP,
	}}
}

#[derive(Debug, Clone)]
pub struct Mapping {
	pub program: u32,
	pub version: u32,
	pub protocol: Protocol,
	pub port: u32,				// XDR encodes ports as a full word
}

pub struct TcpPortMapperClient<S = TcpStream> {
	client: TcpClient<S>,
}

impl TcpPortMapperClient<TcpStream> {

	pub fn new(host:&str) -> Result<Self> {
		let client = TcpClient::connect((host, PMAP_PORT), PMAP_PROG, PMAP_VERS)?;
		Ok(Self{ client })
	}

}

impl<S: Read + Write> TcpPortMapperClient<S> {

	pub fn from_client(client:TcpClient<S>) -> Self { Self{ client } }

	// Asks the port mapper which port a program/version is listening on.  Zero means "not registered".
	pub fn get_port(&mut self, m:&Mapping) -> Result<u16> {
		self.client.start_call(PMAPPROC_GETPORT)?;
		xdr_pack::pack_mapping(&mut self.client.packer, m.program, m.version, m.protocol.to_u32(), m.port)?;
		self.client.do_call()?;

		let ans = self.client.unpacker.unpack_u32()?;
		if !self.client.unpacker.all_data_consumed() {
			return Err(Error::rpc("Data unexpectedly left over in unpacker after unpacking port"));
		}

		match u16::try_from(ans) {
			Ok(0) => Err(Error::rpc(format!("Program {:#x} version {} is not registered with the port mapper", m.program, m.version))),
			Ok(port) => {
				debug!(program = m.program, port, "port mapper lookup");
				Ok(port)
			},
			Err(_) => Err(Error::rpc(format!("Port mapper returned an invalid port {}", ans))),
		}
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::tcp_clients::tests::{framed_reply, ScriptedStream};

	fn mapping() -> Mapping {
		Mapping{ program: 0x0607af, version: 1, protocol: Protocol::Tcp, port: 0 }
	}

	#[test]
	fn get_port_returns_registered_port() {
		let stream = ScriptedStream::new(framed_reply(1, &[0, 0, 0x04, 0x00], 1));
		let mut pmap = TcpPortMapperClient::from_client(TcpClient::from_stream(stream, PMAP_PROG, PMAP_VERS));
		assert_eq!(pmap.get_port(&mapping()).unwrap(), 1024);
	}

	#[test]
	fn unregistered_program_is_an_error() {
		let stream = ScriptedStream::new(framed_reply(1, &[0, 0, 0, 0], 1));
		let mut pmap = TcpPortMapperClient::from_client(TcpClient::from_stream(stream, PMAP_PROG, PMAP_VERS));
		assert!(pmap.get_port(&mapping()).is_err());
	}
}
