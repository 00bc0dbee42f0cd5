//! Commands the executor can run against a selected server.
//!
//! An operation builds its command document from the description of the connection it will be
//! sent on, and interprets the reply. Retry decisions live in the executor; operations only
//! declare whether they are retryable reads or writes.
mod find;
mod insert;
mod run_command;

use bson::Document;

use crate::common::ServerSelector;
use crate::connection::StreamDescription;
use crate::error::Result;

pub use self::find::Find;
pub use self::insert::{Insert, InsertBatchResult, InsertManyResult};
pub use self::run_command::RunCommand;

/// Whether an operation may be attempted a second time after a retryable failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Retryability {
    Read,
    Write,
    None,
}

/// A command executed by `Cluster::execute`.
pub trait Operation {
    /// The result of a successful execution.
    type Output;

    /// The command name, used in error messages and logs.
    const NAME: &'static str;

    /// Builds the command to send over a connection with the given description.
    fn build(&mut self, description: &StreamDescription) -> Result<Document>;

    /// Interprets a successful reply. Replies with `ok: 0` never reach this method.
    fn handle_response(
        &self,
        response: Document,
        description: &StreamDescription,
    ) -> Result<Self::Output>;

    /// Which servers the operation may run on.
    fn selector(&self) -> ServerSelector {
        ServerSelector::Writable
    }

    fn retryability(&self) -> Retryability {
        Retryability::None
    }

    /// Called once before the operation is attempted a second time.
    fn update_for_retry(&mut self) {}
}

// Appends `$db` to a command, as OP_MSG requires.
fn with_db(mut command: Document, db: &str) -> Document {
    command.insert("$db", db.to_string());
    command
}
