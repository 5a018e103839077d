//! Stratum Repository - Collections over the Tiered Pipeline
//!
//! Application-facing API. A [`Pipeline`] opens named collections as
//! [`DocumentRepository`] (schema-less [`Document`](stratum_core::Document)s)
//! or [`ObjectRepository`] (serde types). Every repository call runs under
//! the collection's read/write lock and fails fast once the repository is
//! closed or dropped.
//!
//! Queries go through [`FindOptions`]: filter, stable multi-key sort, then
//! skip/limit, yielding a forward-only [`Cursor`].

mod find;
mod pipeline;
mod repository;

pub use find::{Cursor, FindOptions};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use repository::{from_document, to_document, DocumentRepository, ObjectRepository, RepositoryState};

// Re-export the types every caller needs alongside a repository.
pub use stratum_core::{
    Condition, Document, EntityId, QueryStrategy, RepositoryOptions, SortOrder, StratumError,
    StratumResult,
};
