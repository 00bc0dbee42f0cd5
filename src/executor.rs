//! Runs operations against the cluster, retrying retryable failures once.
use bson::{Bson, Document};
use log::debug;

use crate::cluster::{Cluster, HandshakePhase};
use crate::connstring::Address;
use crate::error::{Error, Result, NO_WRITES_PERFORMED, RETRYABLE_WRITE_ERROR};
use crate::operation::{Insert, InsertManyResult, Operation, Retryability};
use crate::pool::PooledConnection;
use crate::topology::server::Server;

// The first failed attempt of an operation that is going to be retried.
struct FirstAttempt {
    error: Error,
    address: Address,
}

impl Cluster {
    /// Executes an operation, retrying it once on a retryable error if the options and the
    /// selected server allow it.
    ///
    /// Writes are retried when the error carries the `RetryableWriteError` label (attached here
    /// for network errors, cleared pools and, on servers older than wire version 9, retryable
    /// codes). Reads are retried on network errors, cleared pools and retryable codes. If the
    /// retry fails with `NoWritesPerformed`, the first error is returned instead; any other
    /// failure of the retry is returned as it is. A retry that finds its pool cleared at
    /// checkout selects a server once more before giving up, and a retry that lands on a
    /// connection without retryable write support returns the first error.
    pub fn execute<T: Operation>(&self, operation: &mut T) -> Result<T::Output> {
        let requested = self.retryability_for(operation.retryability());
        let selector = operation.selector();
        let mut first_attempt: Option<FirstAttempt> = None;
        let mut txn_number: Option<i64> = None;
        // A retry whose checkout hits a cleared pool selects again, once, without spending the
        // retry itself.
        let mut cleared_on_retry = false;

        loop {
            let deprioritized: Vec<Address> = first_attempt
                .iter()
                .map(|attempt| attempt.address.clone())
                .collect();

            let server = match self.select_server_with_deprioritized(&selector, &deprioritized) {
                Ok(server) => server,
                Err(err) => {
                    return Err(match first_attempt {
                        Some(attempt) => attempt.error,
                        None => err.with_operation(T::NAME),
                    })
                }
            };

            let mut connection = match self.check_out(&server) {
                Ok(connection) => connection,
                Err(err) => {
                    let mut err = err.with_operation(T::NAME);
                    if let Some(attempt) = first_attempt {
                        if err.is_pool_cleared() && !cleared_on_retry {
                            debug!("{} found a cleared pool on retry, selecting again", T::NAME);
                            cleared_on_retry = true;
                            first_attempt = Some(attempt);
                            continue;
                        }
                        return Err(attempt.error);
                    }
                    if requested == Retryability::Write && is_checkout_retryable(&err, true) {
                        err.add_label(RETRYABLE_WRITE_ERROR);
                    }
                    if is_retryable(&err, requested) {
                        debug!("retrying {} after checkout failure: {}", T::NAME, err);
                        first_attempt = Some(FirstAttempt {
                            error: err,
                            address: server.address().clone(),
                        });
                        operation.update_for_retry();
                        continue;
                    }
                    return Err(err);
                }
            };

            let retryability = match self.connection_retryability(requested, &connection) {
                Ok(retryability) => retryability,
                Err(err) => return Err(err.with_operation(T::NAME)),
            };

            if let Some(attempt) = first_attempt.take() {
                if retryability == Retryability::None {
                    return Err(attempt.error);
                }
                first_attempt = Some(attempt);
            }

            if retryability == Retryability::Write && txn_number.is_none() {
                txn_number = Some(self.next_txn_number());
            }

            match self.execute_on_connection(operation, &server, &mut connection, retryability, txn_number) {
                Ok(output) => return Ok(output),
                Err(err) => {
                    drop(connection);

                    if let Some(attempt) = first_attempt {
                        if err.contains_label(NO_WRITES_PERFORMED) {
                            return Err(attempt.error);
                        }
                        return Err(err);
                    }

                    if is_retryable(&err, retryability) {
                        debug!("retrying {} after error: {}", T::NAME, err);
                        first_attempt = Some(FirstAttempt {
                            error: err,
                            address: server.address().clone(),
                        });
                        operation.update_for_retry();
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    /// Inserts documents, splitting them into batches no larger than the server's (or the
    /// configured) max write batch size. Each batch is retried on its own, so a failure in a
    /// later batch never resends an earlier one.
    pub fn insert_many(
        &self,
        db: &str,
        collection: &str,
        documents: Vec<Document>,
        ordered: bool,
    ) -> Result<InsertManyResult> {
        let mut insert = Insert::new(db, collection, documents, ordered)?
            .with_max_batch_size(self.options().max_write_batch_size);

        let mut result = InsertManyResult {
            inserted_ids: insert.inserted_ids(),
            ..Default::default()
        };

        while !insert.is_finished() {
            let batch = self.execute(&mut insert)?;
            result.inserted_count += batch.inserted_count;
            result.batches += 1;
            insert.advance(batch.batch_len);
        }

        Ok(result)
    }

    /// Inserts a single document, returning its `_id`.
    pub fn insert_one(&self, db: &str, collection: &str, document: Document) -> Result<Bson> {
        let result = self.insert_many(db, collection, vec![document], true)?;
        result
            .inserted_ids
            .get(&0)
            .cloned()
            .ok_or_else(|| Error::internal("inserted document has no _id"))
    }

    fn retryability_for(&self, retryability: Retryability) -> Retryability {
        match retryability {
            Retryability::Write if self.options().retry_writes => Retryability::Write,
            Retryability::Read if self.options().retry_reads => Retryability::Read,
            _ => Retryability::None,
        }
    }

    // Writes are only retryable on servers that support sessions.
    fn connection_retryability(
        &self,
        requested: Retryability,
        connection: &PooledConnection,
    ) -> Result<Retryability> {
        if requested != Retryability::Write {
            return Ok(requested);
        }

        if connection.stream_description()?.supports_retryable_writes() {
            Ok(Retryability::Write)
        } else {
            Ok(Retryability::None)
        }
    }

    fn execute_on_connection<T: Operation>(
        &self,
        operation: &mut T,
        server: &Server,
        connection: &mut PooledConnection,
        retryability: Retryability,
        txn_number: Option<i64>,
    ) -> Result<T::Output> {
        let description = connection.stream_description()?.clone();
        let mut command = operation.build(&description)?;

        if let (Retryability::Write, Some(txn_number)) = (retryability, txn_number) {
            command.insert("lsid", self.session_id().clone());
            command.insert("txnNumber", txn_number);
        }

        let reply = match connection.send_command(command) {
            Ok(reply) => reply,
            Err(err) => {
                let mut err = err.with_operation(T::NAME);
                if retryability == Retryability::Write
                    && err.should_add_retryable_write_label(description.max_wire_version)
                {
                    err.add_label(RETRYABLE_WRITE_ERROR);
                }

                self.handle_application_error(
                    server.address(),
                    &err,
                    HandshakePhase::AfterCompletion {
                        generation: connection.generation(),
                        max_wire_version: description.max_wire_version,
                        service_id: connection.service_id().cloned(),
                    },
                );
                return Err(err);
            }
        };

        operation
            .handle_response(reply, &description)
            .map_err(|err| err.with_operation(T::NAME).with_address(server.address()))
    }
}

fn is_checkout_retryable(err: &Error, write: bool) -> bool {
    err.is_network_error() || err.is_pool_cleared() || (write && err.is_checkout_timeout())
}

fn is_retryable(err: &Error, retryability: Retryability) -> bool {
    match retryability {
        Retryability::Write => err.is_write_retryable(),
        Retryability::Read => err.is_read_retryable(),
        Retryability::None => false,
    }
}
