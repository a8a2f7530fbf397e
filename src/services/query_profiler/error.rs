//! Profiler errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfilerError {
    /// The stored query shape cannot be replayed against the server.
    /// Carries an explanation the API surfaces verbatim.
    #[error("{0}")]
    BrokenQueryShape(String),

    /// The profiler was built without a database handle; explain and
    /// collection stats need a live connection.
    #[error("no database connection is configured")]
    NoDatabase,

    #[error("database error: {0}")]
    Database(#[from] mongodb::error::Error),
}

impl ProfilerError {
    /// A shape that predates length-preserving array normalization. The
    /// placeholder destroys arity, so the shape cannot be explained.
    pub fn legacy_shape() -> Self {
        Self::BrokenQueryShape(
            "query shape contains a legacy '<N items>' array placeholder and cannot be \
             replayed; re-record the query to capture a length-preserving shape"
                .to_string(),
        )
    }
}
