use std::fmt;
use std::io::{Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// The length in bytes of a serialized header.
pub const HEADER_LENGTH: i32 = 16;

/// Represents an opcode in the MongoDB Wire Protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    Reply = 1,
    Query = 2004,
    Message = 2013,
}

impl OpCode {
    /// Maps integer values to OpCodes
    ///
    /// # Arguments
    ///
    /// `i` - The integer to map.
    ///
    /// # Return value
    ///
    /// Returns the matching opcode, or `None` if the integer isn't a valid
    /// opcode.
    pub fn from_i32(i: i32) -> Option<OpCode> {
        match i {
            1 => Some(OpCode::Reply),
            2004 => Some(OpCode::Query),
            2013 => Some(OpCode::Message),
            _ => None,
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            OpCode::Reply => write!(fmt, "OP_REPLY"),
            OpCode::Query => write!(fmt, "OP_QUERY"),
            OpCode::Message => write!(fmt, "OP_MSG"),
        }
    }
}

/// Represents a header in the MongoDB Wire Protocol.
///
/// # Fields
///
/// `message_length` - The length of the entire message in bytes, header included.
/// `request_id` - Identifies the request being sent.
/// `response_to` - Identifies which request the message is a response to. This
///                 should be `0` in a request from the client.
/// `op_code`     - Identifies which type of message is being sent.
#[derive(Clone, Debug, PartialEq)]
pub struct Header {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl Header {
    /// Constructs a new Header for a request.
    ///
    /// # Arguments
    ///
    /// `message_length` - The length of the message in bytes.
    /// `request_id` - Identifier for the request.
    /// `op_code` - Identifies which type of message is being sent.
    pub fn new_request(message_length: i32, request_id: i32, op_code: OpCode) -> Header {
        Header {
            message_length,
            request_id,
            response_to: 0,
            op_code,
        }
    }

    /// Writes the serialized Header to a buffer.
    pub fn write<W: Write + ?Sized>(&self, buffer: &mut W) -> Result<()> {
        buffer.write_i32::<LittleEndian>(self.message_length)?;
        buffer.write_i32::<LittleEndian>(self.request_id)?;
        buffer.write_i32::<LittleEndian>(self.response_to)?;
        buffer.write_i32::<LittleEndian>(self.op_code as i32)?;
        Ok(())
    }

    /// Reads a serialized Header from a buffer.
    ///
    /// # Return value
    ///
    /// Returns the header, or an error if the opcode is unknown or the length can't
    /// possibly describe a message.
    pub fn read<R: Read + ?Sized>(buffer: &mut R) -> Result<Header> {
        let message_length = buffer.read_i32::<LittleEndian>()?;
        let request_id = buffer.read_i32::<LittleEndian>()?;
        let response_to = buffer.read_i32::<LittleEndian>()?;
        let op_code_i32 = buffer.read_i32::<LittleEndian>()?;

        let op_code = match OpCode::from_i32(op_code_i32) {
            Some(code) => code,
            None => {
                return Err(Error::invalid_response(format!(
                    "invalid header received: unknown opcode {}",
                    op_code_i32
                )))
            }
        };

        if message_length < HEADER_LENGTH {
            return Err(Error::invalid_response(format!(
                "invalid header received: message length {} is shorter than the header",
                message_length
            )));
        }

        Ok(Header {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }
}
