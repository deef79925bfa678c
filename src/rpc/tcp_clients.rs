
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt, ReadBytesExt};
use tracing::trace;

use crate::error::{Error, Result};
use crate::xdr;
use super::{xdr_pack, xdr_unpack, LAST_FRAGMENT};

// Largest reply we'll reassemble.  Long :FETC:ARR? responses are well below this.
pub const MAX_RECORD_SIZE:usize = 16 * 1024 * 1024;

// RPC over a byte stream using record marking.  Generic over the stream so the framing can be exercised
// without a socket.
pub struct TcpClient<S = TcpStream> {
	stream: S,
	pub prog: u32,
	pub vers: u32,
	pub lastxid: u32,
	pub packer: xdr::Packer,
	pub unpacker: xdr::Unpacker,
}

// A byte stream that can bound how long a read blocks
pub trait RpcStream: Read + Write {
	fn set_read_timeout(&self, timeout:Option<Duration>) -> io::Result<()>;
}

impl RpcStream for TcpStream {
	fn set_read_timeout(&self, timeout:Option<Duration>) -> io::Result<()> {
		TcpStream::set_read_timeout(self, timeout)
	}
}

impl TcpClient<TcpStream> {

	pub fn connect<A: ToSocketAddrs>(addr:A, prog:u32, vers:u32) -> Result<Self> {
		let stream = TcpStream::connect(addr)?;
		stream.set_nodelay(true)?;
		Ok(Self::from_stream(stream, prog, vers))
	}

}

impl<S: RpcStream> TcpClient<S> {

	// Upper bound on how long we'll block on the socket waiting for a reply
	pub fn set_read_timeout(&self, timeout:Option<Duration>) -> Result<()> {
		Ok(self.stream.set_read_timeout(timeout)?)
	}

}

impl<S: Read + Write> TcpClient<S> {

	pub fn from_stream(stream:S, prog:u32, vers:u32) -> Self {
		Self{ stream, prog, vers, lastxid: 0, packer: xdr::Packer::new(), unpacker: xdr::Unpacker::new() }
	}

	pub fn get_ref(&self) -> &S { &self.stream }

	pub fn into_stream(self) -> S { self.stream }

	// Bumps the xid and leaves a fresh call header in the packer; procedure arguments get packed after this
	pub fn start_call(&mut self, prc:u32) -> Result<()> {
		self.lastxid = self.lastxid.wrapping_add(1);
		self.packer.reset();
		xdr_pack::pack_callheader_no_auth(&mut self.packer, self.lastxid, self.prog, self.vers, prc)
	}

	// Sends whatever is in the packer and loads the matching reply into the unpacker, positioned just past
	// the reply header
	pub fn do_call(&mut self) -> Result<()> {
		let call = self.packer.as_bytes();
		if !call.is_empty() {
			let len = u32::try_from(call.len()).ok().filter(|n| *n < LAST_FRAGMENT)
				.ok_or_else(|| Error::rpc("Call too large for a single record fragment"))?;

			let mut send_bytes:Vec<u8> = Vec::with_capacity(call.len() + 4);
			send_bytes.write_u32::<BigEndian>(len | LAST_FRAGMENT)?;
			send_bytes.extend_from_slice(call);
			self.stream.write_all(&send_bytes)?;
			self.stream.flush()?;
			trace!(xid = self.lastxid, bytes = call.len(), "sent RPC call");
		}

		loop {
			let reply = self.read_record()?;
			self.unpacker.reset(&reply);

			// Only our own reply gets its header checked, a stale one may well be an error reply
			let xid = self.unpacker.unpack_u32()?;
			if xid == self.lastxid {
				xdr_unpack::unpack_reply_body(&mut self.unpacker)?;
				return Ok(());
			} else if xid < self.lastxid {
				// Stale reply to an earlier call that we already gave up on
				trace!(xid, expected = self.lastxid, "discarding stale RPC reply");
				continue;
			} else {
				return Err(Error::rpc(format!("Got a reply for xid {} but the last call was {}", xid, self.lastxid)));
			}
		}
	}

	fn read_record(&mut self) -> Result<Vec<u8>> {
		let mut record:Vec<u8> = vec![];

		let mut last = false;
		while !last {
			let header = self.stream.read_u32::<BigEndian>()?;
			last = (header & LAST_FRAGMENT) != 0;
			let n = (header & !LAST_FRAGMENT) as usize;

			let start = record.len();
			if start + n > MAX_RECORD_SIZE {
				return Err(Error::rpc(format!("Reply record of more than {} bytes", MAX_RECORD_SIZE)));
			}
			record.resize(start + n, 0);
			self.stream.read_exact(&mut record[start..])?;
		}

		Ok(record)
	}

}
