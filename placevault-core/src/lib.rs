//! # Placevault Core
//!
//! Continuous archiving pipeline for a high-churn collaborative canvas
//! exposed through a live push feed.
//!
//! ## Overview
//!
//! Frames flow through the pipeline in this order:
//!
//! - **Feed**: one websocket subscription per announced partition plus one
//!   for configuration ([`feed`]), each frame appended to a capped
//!   [`event_log`] with live fanout
//! - **Dispatch**: frames are decoded into configuration updates and
//!   snapshot pointers; pointers become download jobs ([`dispatch`])
//! - **Jobs**: a priority-ordered, retrying task scheduler with a per-kind
//!   policy table ([`jobs`])
//! - **Download**: lease-guarded fetch, blob upload and conflict-free
//!   snapshot record ([`download`], [`lease`], [`blob`])
//! - **Diff**: changed-pixel detection against a transparent baseline
//!   ([`diff`])
//! - **Resolve**: fixed-arity batch lookup of tile authorship ([`resolve`])
//! - **Persist**: conflict-free pixel history inserts ([`persist`])
//!
//! [`runtime::ArchiverRuntime`] wires every stage from an explicit
//! [`context::ArchiveContext`].

#![allow(missing_docs)]

pub mod backoff;
pub mod blob;
pub mod connection;
pub mod context;
pub mod diff;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod event_log;
pub mod feed;
pub mod jobs;
pub mod lease;
pub mod persist;
pub mod pipeline;
pub mod resolve;
pub mod runtime;
pub mod types;

/// Schema for the snapshot, pixel history and job tables.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use context::{ArchiveContext, ArchivePorts, ArchiverConfig};
pub use error::{ArchiveError, ErrorClass, Result};
pub use runtime::ArchiverRuntime;
