use bson::Document;

use crate::common::ServerSelector;
use crate::connection::StreamDescription;
use crate::error::{Error, Result};

use super::{with_db, Operation};

/// Runs an arbitrary command. Never retried.
#[derive(Clone, Debug)]
pub struct RunCommand {
    db: String,
    command: Document,
    selector: Option<ServerSelector>,
}

impl RunCommand {
    pub fn new(db: &str, command: Document) -> Result<RunCommand> {
        if command.is_empty() {
            return Err(Error::invalid_argument("a command must have at least one field"));
        }
        Ok(RunCommand {
            db: db.to_string(),
            command,
            selector: None,
        })
    }

    /// Runs the command on servers matching `selector` instead of the primary.
    pub fn with_selector(mut self, selector: ServerSelector) -> RunCommand {
        self.selector = Some(selector);
        self
    }
}

impl Operation for RunCommand {
    type Output = Document;

    const NAME: &'static str = "runCommand";

    fn build(&mut self, _description: &StreamDescription) -> Result<Document> {
        Ok(with_db(self.command.clone(), &self.db))
    }

    fn handle_response(&self, response: Document, _description: &StreamDescription) -> Result<Document> {
        Ok(response)
    }

    fn selector(&self) -> ServerSelector {
        self.selector.clone().unwrap_or(ServerSelector::Writable)
    }
}
