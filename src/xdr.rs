
use std::io::Cursor;

use byteorder::{BigEndian, WriteBytesExt, ReadBytesExt};

use crate::error::{Error, Result};

// Everything in XDR is aligned on four byte boundaries
const ALIGN:usize = 4;

#[derive(Default)]
pub struct Packer {
	buff: Vec<u8>
}

#[derive(Default)]
pub struct Unpacker {
	buff: Vec<u8>,
	pos: usize,
}

impl Packer {

	pub fn new() -> Self { Self::default() }

	pub fn reset(&mut self) { self.buff.clear(); }

	pub fn as_bytes(&self) -> &[u8] { &self.buff }

	// Packing methods that can only add multiples of four bytes, so if we started off with the correct
	// padding, we'll end up with the correct padding
	pub fn pack_u32(&mut self, x:u32) -> Result<()> { Ok(self.buff.write_u32::<BigEndian>(x)?) }
	pub fn pack_i32(&mut self, x:i32) -> Result<()> { Ok(self.buff.write_i32::<BigEndian>(x)?) }

	pub fn pack_bool(&mut self, b:bool) -> Result<()> { self.pack_i32(if b { 1 } else { 0 }) }

	pub fn pack_enum(&mut self, x:i32) -> Result<()> { self.pack_i32(x) }

	pub fn pack_variable_len_opaque(&mut self, data:&[u8]) -> Result<()> {
		let n = u32::try_from(data.len()).map_err(|_| Error::xdr("Opaque data too long for a u32 length"))?;
		self.pack_u32(n)?;
		self.buff.extend_from_slice(data);

		while self.buff.len() % ALIGN != 0 { self.buff.push(0); }
		Ok(())
	}

	pub fn pack_string(&mut self, s:&str) -> Result<()> {
		if !s.is_ascii() { return Err(Error::xdr("XDR strings must be ASCII")); }
		self.pack_variable_len_opaque(s.as_bytes())
	}

}

impl Unpacker {

	pub fn new() -> Self { Self::default() }

	pub fn reset(&mut self, data:&[u8]) {
		self.buff.clear();
		self.buff.extend_from_slice(data);
		self.pos = 0;
	}

	pub fn remaining(&self) -> &[u8] { &self.buff[self.pos..] }

	pub fn all_data_consumed(&self) -> bool { self.pos == self.buff.len() }

	pub fn skip(&mut self, n:usize) -> Result<()> {
		if n % ALIGN != 0 {
			return Err(Error::xdr("Only skip multiples of four bytes in order to maintain alignment"));
		}
		if self.pos + n > self.buff.len() {
			return Err(Error::xdr("Tried to skip past the end of the buffer"));
		}
		self.pos += n;
		Ok(())
	}

	pub fn unpack_u32(&mut self) -> Result<u32> {
		let ans = Cursor::new(self.remaining()).read_u32::<BigEndian>()
			.map_err(|_| Error::xdr("Not enough bytes left to unpack a u32"))?;
		self.pos += 4;
		Ok(ans)
	}

	pub fn unpack_i32(&mut self) -> Result<i32> {
		let ans = Cursor::new(self.remaining()).read_i32::<BigEndian>()
			.map_err(|_| Error::xdr("Not enough bytes left to unpack an i32"))?;
		self.pos += 4;
		Ok(ans)
	}

	// An enum is just an i32 with a restricted set of values.  We can't check that this value is in the restricted set at this
	// level because it depends on the application, so for our purposes here, an enum is the same as an i32
	pub fn unpack_enum(&mut self) -> Result<i32> { self.unpack_i32() }

	pub fn unpack_bool(&mut self) -> Result<bool> {
		match self.unpack_i32()? {
			0 => Ok(false),
			1 => Ok(true),
			x => Err(Error::xdr(format!("Expected 0 or 1 for a bool but got {}", x))),
		}
	}

	pub fn unpack_variable_len_opaque(&mut self) -> Result<Vec<u8>> {
		let n = self.unpack_u32()? as usize;
		if self.pos + n > self.buff.len() {
			return Err(Error::xdr(format!("Opaque length {} runs past the end of the buffer", n)));
		}
		let ans = self.buff[self.pos..self.pos + n].to_vec();
		self.pos += n;

		// Padding bytes may be missing at the very end of a malformed record; tolerate that
		let padded = (self.pos + ALIGN - 1) / ALIGN * ALIGN;
		self.pos = padded.min(self.buff.len());
		Ok(ans)
	}

}
