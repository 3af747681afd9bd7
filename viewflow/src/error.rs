//! The recoverable half of the error taxonomy.
//!
//! Constructive-time failures (connecting a source, building a graph)
//! surface as `Result`s. Logic violations inside a running graph are
//! programmer errors and panic with descriptive messages instead; they are
//! not recoverable and are never retried.

use thiserror::Error;

/// The planner handed the engine a plan it cannot run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlannerError {
    /// Orderings must include every primary-key column so that streams have
    /// a deterministic total order.
    #[error(
        "ordering for table {table:?} must include primary key column {column:?}; \
         identifiers that mix case must be quoted in PostgreSQL"
    )]
    OrderingMissingPrimaryKey { table: String, column: String },

    #[error("query requires {required} flipped joins but at most {max} are allowed")]
    MaxFlippableJoins { required: usize, max: usize },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnsupportedFeatureError {
    /// The server path accepts NOT EXISTS; client-side emulation is
    /// deliberately not attempted.
    #[error("NOT EXISTS is not supported in client queries; run the condition on the server")]
    NotExistsOnClient,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BuildError {
    #[error(transparent)]
    Planner(#[from] PlannerError),

    #[error(transparent)]
    Unsupported(#[from] UnsupportedFeatureError),

    #[error("unknown table {0:?}")]
    UnknownTable(String),
}
