//! OP_MSG encoding and decoding.
use std::io::{Cursor, Read, Write};

use bson::{self, Bson, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::wire_protocol::flags::OpMsgFlags;
use crate::wire_protocol::header::{Header, OpCode, HEADER_LENGTH};

/// Upper bound on an incoming message, matching the server's default `maxMessageSizeBytes`.
pub const MAX_MESSAGE_SIZE_BYTES: i32 = 48_000_000;

const SECTION_BODY: u8 = 0;
const SECTION_DOCUMENT_SEQUENCE: u8 = 1;

/// A single OP_MSG exchanged with a server. Document sequences received from a server are
/// folded into the body under their identifier.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub header: Header,
    pub flags: OpMsgFlags,
    pub body: Document,
}

impl Message {
    /// Builds a request carrying `command` as its only section.
    pub fn with_command(request_id: i32, command: Document) -> Message {
        Message {
            header: Header::new_request(0, request_id, OpCode::Message),
            flags: OpMsgFlags::empty(),
            body: command,
        }
    }

    /// Serializes the message, computing its length.
    pub fn write<W: Write + ?Sized>(&self, buffer: &mut W) -> Result<()> {
        let mut body = Vec::new();
        bson::encode_document(&mut body, &self.body)?;

        let length = HEADER_LENGTH as usize + 4 + 1 + body.len();
        if length > MAX_MESSAGE_SIZE_BYTES as usize {
            return Err(Error::invalid_argument(format!(
                "message of {} bytes exceeds the maximum message size",
                length
            )));
        }

        let header = Header::new_request(length as i32, self.header.request_id, OpCode::Message);
        header.write(buffer)?;
        buffer.write_u32::<LittleEndian>(self.flags.bits())?;
        buffer.write_u8(SECTION_BODY)?;
        buffer.write_all(&body)?;
        buffer.flush()?;
        Ok(())
    }

    /// Reads a message, rejecting anything that isn't a well-formed OP_MSG.
    pub fn read<R: Read + ?Sized>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;

        if header.op_code != OpCode::Message {
            return Err(Error::invalid_response(format!(
                "expected an OP_MSG reply but received {}",
                header.op_code
            )));
        }
        if header.message_length > MAX_MESSAGE_SIZE_BYTES {
            return Err(Error::invalid_response(format!(
                "reply of {} bytes exceeds the maximum message size",
                header.message_length
            )));
        }

        let mut remaining = vec![0u8; (header.message_length - HEADER_LENGTH) as usize];
        buffer.read_exact(&mut remaining)?;
        let end = remaining.len() as u64;
        let mut reader = Cursor::new(remaining);

        let bits = reader.read_u32::<LittleEndian>()?;
        if OpMsgFlags::has_unknown_required_bits(bits) {
            return Err(Error::invalid_response(format!(
                "reply has unsupported required flag bits {:#x}",
                bits
            )));
        }
        let flags = OpMsgFlags::from_bits_truncate(bits);
        let sections_end = if flags.contains(OpMsgFlags::CHECKSUM_PRESENT) {
            end.saturating_sub(4)
        } else {
            end
        };

        let mut body = None;
        let mut sequences = Vec::new();

        while reader.position() < sections_end {
            match reader.read_u8()? {
                SECTION_BODY => {
                    if body.is_some() {
                        return Err(Error::invalid_response("reply has more than one body section"));
                    }
                    body = Some(bson::decode_document(&mut reader)?);
                }
                SECTION_DOCUMENT_SEQUENCE => {
                    let start = reader.position();
                    let size = reader.read_i32::<LittleEndian>()?;
                    // The size counts itself, and the section has to fit in the message.
                    let section_end = match start.checked_add(size as u64) {
                        Some(section_end) if size >= 4 && section_end <= sections_end => {
                            section_end
                        }
                        _ => {
                            return Err(Error::invalid_response(format!(
                                "reply has a document sequence of invalid size {}",
                                size
                            )))
                        }
                    };
                    let identifier = read_cstring(&mut reader)?;
                    let mut documents = Vec::new();
                    while reader.position() < section_end {
                        documents.push(Bson::Document(bson::decode_document(&mut reader)?));
                    }
                    if reader.position() != section_end {
                        return Err(Error::invalid_response(
                            "reply has a document sequence that overruns its size",
                        ));
                    }
                    sequences.push((identifier, documents));
                }
                other => {
                    return Err(Error::invalid_response(format!(
                        "reply has unknown section kind {}",
                        other
                    )))
                }
            }
        }

        let mut body = body.ok_or_else(|| Error::invalid_response("reply has no body section"))?;
        for (identifier, documents) in sequences {
            body.insert(identifier, Bson::Array(documents));
        }

        Ok(Message {
            header,
            flags,
            body,
        })
    }
}

fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        match reader.read_u8()? {
            0 => break,
            byte => bytes.push(byte),
        }
    }
    String::from_utf8(bytes)
        .map_err(|_| Error::invalid_response("document sequence identifier is not valid UTF-8"))
}
