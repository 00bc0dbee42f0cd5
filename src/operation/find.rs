use bson::{bson, doc, Bson, Document};

use crate::common::{ReadPreference, ServerSelector};
use crate::connection::StreamDescription;
use crate::error::{Error, Result};

use super::{with_db, Operation, Retryability};

/// A `find` returning the documents of the first batch.
#[derive(Clone, Debug)]
pub struct Find {
    db: String,
    collection: String,
    filter: Document,
    limit: Option<i64>,
    read_preference: Option<ReadPreference>,
}

impl Find {
    pub fn new(db: &str, collection: &str, filter: Document) -> Find {
        Find {
            db: db.to_string(),
            collection: collection.to_string(),
            filter,
            limit: None,
            read_preference: None,
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Find {
        self.limit = Some(limit);
        self
    }

    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Find {
        self.read_preference = Some(read_preference);
        self
    }
}

impl Operation for Find {
    type Output = Vec<Document>;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Document> {
        let mut command = doc! {
            "find": self.collection.clone(),
            "filter": self.filter.clone(),
        };
        if let Some(limit) = self.limit {
            command.insert("limit", limit);
            command.insert("singleBatch", true);
        }
        Ok(with_db(command, &self.db))
    }

    fn handle_response(
        &self,
        response: Document,
        description: &StreamDescription,
    ) -> Result<Vec<Document>> {
        let batch = response
            .get_document("cursor")
            .and_then(|cursor| cursor.get_array("firstBatch"))
            .map_err(|_| {
                Error::invalid_response(format!(
                    "find reply from {} has no cursor.firstBatch",
                    description.address
                ))
            })?;

        Ok(batch
            .iter()
            .filter_map(|doc| match *doc {
                Bson::Document(ref doc) => Some(doc.clone()),
                _ => None,
            })
            .collect())
    }

    fn selector(&self) -> ServerSelector {
        match self.read_preference {
            Some(ref read_preference) => ServerSelector::Read(read_preference.clone()),
            None => ServerSelector::primary(),
        }
    }

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}
