//! Devflow Core Library
//!
//! A plugin task-execution and data-collection framework for DevOps telemetry.
//! Plugins describe their work as ordered subtasks; the framework provides the
//! building blocks those subtasks are made of:
//!
//! - collecting paginated REST responses into raw tables under a rate limit,
//! - extracting raw JSON into typed tool-layer rows,
//! - converting tool-layer rows into tool-agnostic domain rows,
//! - running the subtasks of a task in order with status bookkeeping.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`api`] - HTTP client, rate limiter, retry policy, bounded worker pool, pagination helpers
//! - [`collector`] - API collector writing `_raw_*` tables
//! - [`extractor`] - raw rows to tool-layer records
//! - [`converter`] - tool-layer rows to domain-layer records
//! - [`batch`] - batched, idempotent upserts of records
//! - [`subtask`] - subtask metadata, run context and the task runner
//! - [`state`] - incremental-collection state and high-water marks
//! - [`db`] - database pool, query builder, transactions and table locks
//! - [`config`] - engine configuration and typed task options
//! - [`models`] - raw rows, provenance, records and domain ids
//! - [`error`] - error taxonomy

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod batch;
pub mod collector;
pub mod config;
pub mod converter;
pub mod db;
pub mod error;
pub mod extractor;
pub mod models;
pub mod state;
pub mod subtask;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use api::{
    ApiClient, ApiRateLimiter, ApiRequest, ApiResponse, AsyncApiClient, FailureType, RetryDecision,
    RetryPolicy, classify_error,
};
pub use batch::{BatchSave, BatchSaveDivider, TransformSummary};
pub use collector::{ApiCollector, ApiCollectorArgs, CollectSummary, ParsedPage, RawDataSubTaskArgs};
pub use config::{EngineConfig, TaskOptions};
pub use converter::{DataConverter, DataConverterArgs};
pub use db::{Database, DbError, LockTable, SelectQuery, TxHelper, with_transaction};
pub use error::{ErrorKind, EtlError};
pub use extractor::{ApiExtractor, ApiExtractorArgs};
pub use models::{DomainIdGenerator, RawData, RawDataOrigin, Record};
pub use state::{StateOptions, SubtaskStateManager, resolve_since};
pub use subtask::{
    PluginTask, RunContext, SubTaskContext, SubTaskMeta, TaskReport, TaskRunner, TaskStatus,
};
