
// Device core
pub const DEVICE_CORE_PROG:u32  = 0x0607af;
pub const DEVICE_CORE_VERS:u32  = 1;
pub const CREATE_LINK:u32       = 10;
pub const DEVICE_WRITE:u32      = 11;
pub const DEVICE_READ:u32       = 12;
pub const DESTROY_LINK:u32      = 23;

pub const CLIENT_ID:i32 = 3333;
pub const DEFAULT_LOCK_TIMEOUT_MS:u32 = 10000;
pub const DEFAULT_IO_TIMEOUT:Duration = Duration::from_secs(10);

pub const OPERATION_FLAGS_END_ONLY:i32 = 8;

// Reason bits in a device_read response
pub const REASON_REQCNT:i32 = 1;
pub const REASON_CHR:i32    = 2;
pub const REASON_END:i32    = 4;

// Device error codes (VXI-11 B.5.2)
pub const ERR_IO_TIMEOUT:i32 = 15;

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::rpc::port_mapping::{TcpPortMapperClient, Mapping, Protocol};
use crate::rpc::tcp_clients::{RpcStream, TcpClient};

pub mod xdr_pack;

// Extra slack on the socket beyond the I/O timeout we hand to the instrument, so that the
// instrument's own timeout error wins the race
const SOCKET_TIMEOUT_MARGIN:Duration = Duration::from_secs(2);

pub struct CoreClient<S = TcpStream> {
	client: TcpClient<S>,
	link: Option<Link>,
}

#[derive(Debug, Clone, Copy)]
pub struct Link {
	pub link_id: i32,
	pub abort_port: u16,
	pub max_recv_size: u32,
}

fn millis(d:Duration) -> u32 { u32::try_from(d.as_millis()).unwrap_or(u32::MAX) }

fn device_error(code:i32, timeout:Duration) -> Error {
	let msg = match code {
		1  => "Syntax error",
		3  => "Device not accessible",
		4  => "Invalid link identifier",
		5  => "Parameter error",
		6  => "Channel not established",
		8  => "Operation not supported",
		9  => "Out of resources",
		11 => "Device locked by another link",
		12 => "No lock held by this link",
		ERR_IO_TIMEOUT => return Error::Timeout{ event: "VXI-11 I/O".to_owned(), timeout },
		17 => "I/O error",
		21 => "Invalid address",
		23 => "Abort",
		29 => "Channel already established",
		_  => return Error::device(format!("Unknown VXI-11 error code {}", code)),
	};
	Error::device(msg)
}

impl CoreClient<TcpStream> {

	pub fn new(host:&str) -> Result<Self> {

		// Find the port to use for the core program
		let mut pmap_client = TcpPortMapperClient::new(host)?;

		let mapping = Mapping {
			program: DEVICE_CORE_PROG,
			version: DEVICE_CORE_VERS,
			protocol: Protocol::Tcp,
			port: 0,
		};

		let port = pmap_client.get_port(&mapping)?;
		debug!(host, port, "connecting to VXI-11 core channel");

		let client = TcpClient::connect((host, port), DEVICE_CORE_PROG, DEVICE_CORE_VERS)?;
		client.set_read_timeout(Some(DEFAULT_IO_TIMEOUT + SOCKET_TIMEOUT_MARGIN))?;

		Ok(Self::from_client(client))
	}

}

impl<S: RpcStream> CoreClient<S> {

	fn prepare_socket(&mut self, io_timeout:Duration) -> Result<()> {
		self.client.set_read_timeout(Some(io_timeout + SOCKET_TIMEOUT_MARGIN))
	}

	// Same as ask() but also stretches the socket timeout so long waits aren't cut short locally
	pub fn ask_with_timeout(&mut self, data:&[u8], io_timeout:Duration) -> Result<Vec<u8>> {
		self.prepare_socket(io_timeout)?;
		let ans = self.ask(data, io_timeout);
		self.prepare_socket(DEFAULT_IO_TIMEOUT)?;
		ans
	}

}

impl<S: Read + Write> CoreClient<S> {

	pub fn from_client(client:TcpClient<S>) -> Self { Self{ client, link: None } }

	pub fn link(&self) -> Option<Link> { self.link }

	pub fn client(&self) -> &TcpClient<S> { &self.client }

	fn link_id(&self) -> Result<i32> {
		self.link.map(|l| l.link_id).ok_or_else(|| Error::device("No link"))
	}

	pub fn create_link(&mut self, device:&str) -> Result<()> {
		if self.link.is_some() {
			return Err(Error::device("Already connected to a link"));
		}

		self.client.start_call(CREATE_LINK)?;
		xdr_pack::pack_create_link_parms(&mut self.client.packer, CLIENT_ID, false, DEFAULT_LOCK_TIMEOUT_MS, device)?;
		self.client.do_call()?;

		let error         = self.client.unpacker.unpack_i32()?;
		let link_id       = self.client.unpacker.unpack_i32()?;
		let abort_port    = self.client.unpacker.unpack_u32()?;
		let max_recv_size = self.client.unpacker.unpack_u32()?;

		if error != 0 {
			return Err(device_error(error, DEFAULT_IO_TIMEOUT));
		}

		let abort_port = u16::try_from(abort_port).map_err(|_| Error::rpc("Abort port out of range"))?;
		self.link = Some(Link{ link_id, abort_port, max_recv_size });
		debug!(device, link_id, max_recv_size, "created VXI-11 link");
		Ok(())
	}

	pub fn ask(&mut self, data:&[u8], io_timeout:Duration) -> Result<Vec<u8>> {
		self.write(data, io_timeout)?;
		self.read(io_timeout)
	}

	pub fn write(&mut self, data:&[u8], io_timeout:Duration) -> Result<()> {
		let link_id = self.link_id()?;
		trace!(cmd = %String::from_utf8_lossy(data), "device_write");

		self.client.start_call(DEVICE_WRITE)?;
		xdr_pack::pack_device_write_parms(&mut self.client.packer, link_id, millis(io_timeout), DEFAULT_LOCK_TIMEOUT_MS, OPERATION_FLAGS_END_ONLY, data)?;
		self.client.do_call()?;

		let error = self.client.unpacker.unpack_i32()?;
		let size  = self.client.unpacker.unpack_u32()?;

		if error != 0 {
			return Err(device_error(error, io_timeout));
		}
		if size as usize != data.len() {
			return Err(Error::device(format!("Instrument accepted {} of {} bytes", size, data.len())));
		}
		Ok(())
	}

	// Reads until the instrument flags END.  Long responses come back in several device_read calls.
	pub fn read(&mut self, io_timeout:Duration) -> Result<Vec<u8>> {
		let link_id = self.link_id()?;
		let mut ans:Vec<u8> = vec![];

		loop {
			self.client.start_call(DEVICE_READ)?;
			xdr_pack::pack_device_read_parms(&mut self.client.packer, link_id, u32::MAX, millis(io_timeout), DEFAULT_LOCK_TIMEOUT_MS, 0, 0)?;
			self.client.do_call()?;

			let error  = self.client.unpacker.unpack_i32()?;
			let reason = self.client.unpacker.unpack_i32()?;
			let data   = self.client.unpacker.unpack_variable_len_opaque()?;

			if error != 0 {
				return Err(device_error(error, io_timeout));
			}
			if reason & !(REASON_REQCNT | REASON_CHR | REASON_END) != 0 {
				return Err(Error::device(format!("Unexpected reason bits {:#x} in device_read response", reason)));
			}

			ans.extend_from_slice(&data);
			if reason & REASON_END != 0 { return Ok(ans); }
		}
	}

	pub fn destroy_link(&mut self) -> Result<()> {
		let link_id = self.link_id()?;

		self.client.start_call(DESTROY_LINK)?;
		xdr_pack::pack_device_link(&mut self.client.packer, link_id)?;
		self.client.do_call()?;

		// The link is gone from our side whatever the instrument says
		self.link = None;

		match self.client.unpacker.unpack_i32()? {
			0 => {
				debug!(link_id, "destroyed VXI-11 link");
				Ok(())
			},
			code => Err(device_error(code, DEFAULT_IO_TIMEOUT)),
		}
	}

}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::rpc::tcp_clients::tests::{framed_reply, ScriptedStream};
	use crate::xdr::Packer;

	fn words(ws:&[i32]) -> Vec<u8> {
		let mut p = Packer::new();
		for w in ws { p.pack_i32(*w).unwrap(); }
		p.as_bytes().to_vec()
	}

	fn read_resp(xid:u32, reason:i32, data:&[u8]) -> Vec<u8> {
		let mut p = Packer::new();
		p.pack_i32(0).unwrap();
		p.pack_i32(reason).unwrap();
		p.pack_variable_len_opaque(data).unwrap();
		framed_reply(xid, p.as_bytes(), 1)
	}

	fn linked_client(mut replies:Vec<u8>) -> CoreClient<ScriptedStream> {
		let mut input = framed_reply(1, &words(&[0, 7, 1025, 4096]), 1);
		input.append(&mut replies);
		let mut core = CoreClient::from_client(TcpClient::from_stream(ScriptedStream::new(input), DEVICE_CORE_PROG, DEVICE_CORE_VERS));
		core.create_link("inst0").unwrap();
		core
	}

	#[test]
	fn create_link_records_link_parameters() {
		let core = linked_client(vec![]);
		let link = core.link().unwrap();
		assert_eq!(link.link_id, 7);
		assert_eq!(link.abort_port, 1025);
		assert_eq!(link.max_recv_size, 4096);
	}

	#[test]
	fn read_concatenates_until_end() {
		let mut replies = framed_reply(2, &words(&[0, 6]), 1);
		replies.extend(read_resp(3, REASON_REQCNT, b"5.0,0.1,"));
		replies.extend(read_resp(4, REASON_END, b"5.0,0.1\n"));
		let mut core = linked_client(replies);

		let ans = core.ask(b":FETC:ARR?", DEFAULT_IO_TIMEOUT);
		// The write confirmed 6 bytes but we sent 10
		assert!(ans.is_err());

		let mut replies = framed_reply(2, &words(&[0, 10]), 1);
		replies.extend(read_resp(3, REASON_REQCNT, b"5.0,0.1,"));
		replies.extend(read_resp(4, REASON_END, b"5.0,0.1\n"));
		let mut core = linked_client(replies);
		assert_eq!(core.ask(b":FETC:ARR?", DEFAULT_IO_TIMEOUT).unwrap(), b"5.0,0.1,5.0,0.1\n");
	}

	#[test]
	fn io_timeout_maps_to_timeout_error() {
		let replies = framed_reply(2, &words(&[ERR_IO_TIMEOUT, 0]), 1);
		let mut core = linked_client(replies);
		let e = core.write(b"*OPC?", Duration::from_millis(250)).unwrap_err();
		assert!(e.is_timeout());
	}

	#[test]
	fn destroy_link_clears_link() {
		let mut core = linked_client(framed_reply(2, &words(&[0]), 1));
		core.destroy_link().unwrap();
		assert!(core.link().is_none());
		assert!(core.destroy_link().is_err());
	}

	#[test]
	fn create_link_errors_are_reported() {
		let input = framed_reply(1, &words(&[11, 0, 0, 0]), 1);
		let mut core = CoreClient::from_client(TcpClient::from_stream(ScriptedStream::new(input), DEVICE_CORE_PROG, DEVICE_CORE_VERS));
		let e = core.create_link("inst0").unwrap_err();
		assert_eq!(e.to_string(), "device error: Device locked by another link");
		assert!(core.link().is_none());
	}
}
