use std::cmp;
use std::collections::BTreeMap;

use bson::oid::ObjectId;
use bson::{bson, doc, Bson, Document};

use crate::connection::StreamDescription;
use crate::error::{Error, ErrorKind, Result, WriteFailure};

use super::{with_db, Operation, Retryability};

/// Inserts documents in batches no larger than the server's `maxWriteBatchSize`.
///
/// Each call to `Cluster::execute` sends one batch starting at the current offset; the caller
/// advances past it once the batch succeeds. Documents missing an `_id` get one when the
/// operation is created, so a retried batch inserts the same documents.
#[derive(Clone, Debug)]
pub struct Insert {
    db: String,
    collection: String,
    documents: Vec<Document>,
    ordered: bool,
    max_batch_size: Option<u32>,
    offset: usize,
    batch_len: usize,
}

/// The outcome of one batch.
#[derive(Clone, Debug, PartialEq)]
pub struct InsertBatchResult {
    /// Documents the server reports as inserted.
    pub inserted_count: i64,
    /// Documents sent in the batch.
    pub batch_len: usize,
}

/// The outcome of a whole `insert_many`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InsertManyResult {
    pub inserted_count: i64,
    /// The `_id` of each document, keyed by its index in the input.
    pub inserted_ids: BTreeMap<usize, Bson>,
    /// How many commands were sent, not counting retries.
    pub batches: usize,
}

impl Insert {
    pub fn new(db: &str, collection: &str, documents: Vec<Document>, ordered: bool) -> Result<Insert> {
        if documents.is_empty() {
            return Err(Error::invalid_argument("no documents to insert"));
        }

        let mut with_ids = Vec::with_capacity(documents.len());
        for mut document in documents {
            if !document.contains_key("_id") {
                let id = ObjectId::new()
                    .map_err(|e| Error::internal(format!("failed to generate _id: {}", e)))?;
                document.insert("_id", id);
            }
            with_ids.push(document);
        }

        Ok(Insert {
            db: db.to_string(),
            collection: collection.to_string(),
            documents: with_ids,
            ordered,
            max_batch_size: None,
            offset: 0,
            batch_len: 0,
        })
    }

    /// Caps batches below what the server advertises.
    pub fn with_max_batch_size(mut self, max_batch_size: Option<u32>) -> Insert {
        self.max_batch_size = max_batch_size;
        self
    }

    /// Whether every batch has been sent.
    pub fn is_finished(&self) -> bool {
        self.offset >= self.documents.len()
    }

    /// Moves past a batch that succeeded.
    pub fn advance(&mut self, batch_len: usize) {
        self.offset = cmp::min(self.offset + batch_len, self.documents.len());
    }

    pub fn inserted_ids(&self) -> BTreeMap<usize, Bson> {
        self.documents
            .iter()
            .enumerate()
            .filter_map(|(i, document)| document.get("_id").map(|id| (i, id.clone())))
            .collect()
    }

    fn batch_limit(&self, description: &StreamDescription) -> usize {
        let server_limit = cmp::max(description.max_write_batch_size, 1) as usize;
        match self.max_batch_size {
            Some(limit) => cmp::min(limit as usize, server_limit),
            None => server_limit,
        }
    }
}

impl Operation for Insert {
    type Output = InsertBatchResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, description: &StreamDescription) -> Result<Document> {
        if self.is_finished() {
            return Err(Error::internal("every insert batch has already been sent"));
        }

        let end = cmp::min(self.offset + self.batch_limit(description), self.documents.len());
        self.batch_len = end - self.offset;

        let batch: Vec<Bson> = self.documents[self.offset..end]
            .iter()
            .cloned()
            .map(Bson::Document)
            .collect();

        let command = doc! {
            "insert": self.collection.clone(),
            "documents": batch,
            "ordered": self.ordered,
        };
        Ok(with_db(command, &self.db))
    }

    fn handle_response(
        &self,
        response: Document,
        _description: &StreamDescription,
    ) -> Result<InsertBatchResult> {
        if let Ok(write_errors) = response.get_array("writeErrors") {
            if let Some(&Bson::Document(ref first)) = write_errors.first() {
                let failure = WriteFailure {
                    index: first.get_i32("index").unwrap_or(0) + self.offset as i32,
                    code: first.get_i32("code").unwrap_or(0),
                    message: first.get_str("errmsg").unwrap_or_default().to_string(),
                };
                return Err(Error::from(ErrorKind::Write(failure)));
            }
        }

        let inserted_count = match response.get("n") {
            Some(&Bson::I32(n)) => i64::from(n),
            Some(&Bson::I64(n)) => n,
            _ => self.batch_len as i64,
        };

        Ok(InsertBatchResult {
            inserted_count,
            batch_len: self.batch_len,
        })
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}
