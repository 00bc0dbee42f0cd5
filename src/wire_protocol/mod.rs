//! The subset of the MongoDB wire protocol needed to run commands: OP_MSG framing.
pub mod flags;
pub mod header;
pub mod operations;

pub use self::operations::Message;
