
use crate::error::{Error, Result};
use crate::xdr::Unpacker;
use crate::rpc::{REPLY, MSG_DENIED, RPC_MISMATCH, AUTH_ERROR, MSG_ACCEPTED, PROG_UNAVAIL, PROG_MISMATCH, PROC_UNAVAIL, GARBAGE_ARGS, SUCCESS};

#[derive(Debug, PartialEq)]
pub struct Auth {
	pub flavor: i32,
	pub body: Vec<u8>,
}

pub fn unpack_auth(unpacker:&mut Unpacker) -> Result<Auth> {
	let flavor = unpacker.unpack_enum()?;
	let body = unpacker.unpack_variable_len_opaque()?;
	Ok(Auth{ flavor, body })
}

// Decodes the rest of a reply header once the caller has read the xid.  Only an accepted, successful
// reply gets through, everything else is an error.
pub fn unpack_reply_body(unpacker:&mut Unpacker) -> Result<Auth> {
	if unpacker.unpack_enum()? != REPLY { return Err(Error::rpc("Expected REPLY message type")); }

	match unpacker.unpack_enum()? {
		MSG_DENIED => {
			return match unpacker.unpack_enum()? {
				RPC_MISMATCH => {
					let low = unpacker.unpack_u32()?;
					let high = unpacker.unpack_u32()?;
					Err(Error::rpc(format!("Message denied, server supports RPC versions {} to {}", low, high)))
				},
				AUTH_ERROR => {
					let stat = unpacker.unpack_u32()?;
					Err(Error::rpc(format!("Message denied due to auth error {}", stat)))
				},
				_ => Err(Error::rpc("Message denied for an unknown reason")),
			}
		},
		MSG_ACCEPTED => { },
		_ => return Err(Error::rpc("Neither MSG_DENIED nor MSG_ACCEPTED")),
	}

	let verf = unpack_auth(unpacker)?;

	match unpacker.unpack_enum()? {
		SUCCESS => Ok(verf),
		PROG_UNAVAIL  => Err(Error::rpc("Program unavailable")),
		PROG_MISMATCH => {
			let low = unpacker.unpack_u32()?;
			let high = unpacker.unpack_u32()?;
			Err(Error::rpc(format!("Program mismatch, server supports versions {} to {}", low, high)))
		},
		PROC_UNAVAIL => Err(Error::rpc("Procedure unavailable")),
		GARBAGE_ARGS  => Err(Error::rpc("Server could not decode the arguments")),
		_ => Err(Error::rpc("Call failed for an unknown reason")),
	}
}
