//! MongoDB explain client
//!
//! Thin async wrapper around the driver for the handful of admin commands
//! the profiler issues: explain, collStats, listIndexes, ping.

use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::{Database, IndexModel};

/// Explain verbosity accepted by the server.
pub const VERBOSITY_QUERY_PLANNER: &str = "queryPlanner";
pub const VERBOSITY_EXECUTION_STATS: &str = "executionStats";

/// Wraps a database handle for explain-style commands.
#[derive(Clone)]
pub struct MongoExplainClient {
    db: Database,
}

impl MongoExplainClient {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database_name(&self) -> &str {
        self.db.name()
    }

    /// Round-trip check against the server.
    pub async fn ping(&self) -> mongodb::error::Result<()> {
        self.db.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    /// Explain a `find` command.
    ///
    /// Some server versions and proxies reject the `verbosity` field; that
    /// specific rejection is retried once without it, which yields
    /// queryPlanner-level output. Any other failure surfaces as-is.
    pub async fn explain_find(
        &self,
        collection: &str,
        filter: Document,
        verbosity: &str,
    ) -> mongodb::error::Result<Document> {
        let mut find_cmd = doc! { "find": collection };
        if !filter.is_empty() {
            find_cmd.insert("filter", filter);
        }
        self.run_explain(find_cmd, verbosity).await
    }

    /// Explain an `aggregate` command.
    pub async fn explain_aggregate(
        &self,
        collection: &str,
        pipeline: Vec<Document>,
        verbosity: &str,
    ) -> mongodb::error::Result<Document> {
        let aggregate_cmd = doc! {
            "aggregate": collection,
            "pipeline": pipeline,
            "cursor": {},
        };
        self.run_explain(aggregate_cmd, verbosity).await
    }

    async fn run_explain(
        &self,
        inner: Document,
        verbosity: &str,
    ) -> mongodb::error::Result<Document> {
        let command = doc! { "explain": inner.clone(), "verbosity": verbosity };
        match self.db.run_command(command).await {
            Err(err) if rejects_verbosity(&err) => {
                tracing::warn!(
                    error = %err,
                    verbosity,
                    "server rejected the verbosity field, retrying without it"
                );
                self.db.run_command(doc! { "explain": inner }).await
            }
            other => other,
        }
    }

    /// `collStats` for one collection.
    pub async fn coll_stats(&self, collection: &str) -> mongodb::error::Result<Document> {
        self.db.run_command(doc! { "collStats": collection }).await
    }

    /// All indexes of a collection.
    pub async fn list_indexes(&self, collection: &str) -> mongodb::error::Result<Vec<IndexModel>> {
        let coll = self.db.collection::<Document>(collection);
        let cursor = coll.list_indexes().await?;
        cursor.try_collect().await
    }

    /// Raw collection handle, used by the persistent store.
    pub fn collection(&self, name: &str) -> mongodb::Collection<Document> {
        self.db.collection(name)
    }
}

/// Whether the server rejected the `verbosity` field itself. Older servers
/// answer FailedToParse (9), newer ones IDLUnknownField (40415).
fn rejects_verbosity(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        mongodb::error::ErrorKind::Command(command_err) => {
            is_verbosity_rejection(command_err.code, &command_err.message)
        }
        _ => false,
    }
}

fn is_verbosity_rejection(code: i32, message: &str) -> bool {
    (code == 9 || code == 40415) && message.contains("verbosity")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_rejection_codes() {
        assert!(is_verbosity_rejection(9, "unrecognized field 'verbosity'"));
        assert!(is_verbosity_rejection(
            40415,
            "BSON field 'explain.verbosity' is an unknown field"
        ));
    }

    #[test]
    fn test_other_command_failures_do_not_retry() {
        // Invalid verbosity value, not an unsupported field.
        assert!(!is_verbosity_rejection(2, "verbosity string must be one of ..."));
        // Unknown-field rejection of something other than verbosity.
        assert!(!is_verbosity_rejection(9, "unrecognized field 'cursor'"));
        assert!(!is_verbosity_rejection(13, "not authorized on admin"));
    }
}
