//! retab-ls: workspace indexing core for the retab language server
//!
//! This crate keeps an always-consistent in-memory model of a workspace of
//! interdependent configuration files (`.retab`, `.hcl`, `.tf`, `.tfvars`)
//! and re-derives it incrementally as editors open, change and close them.
//!
//! # Overview
//!
//! - **Documents**: versioned text buffers for files open in the editor
//! - **Jobs**: a dependency-aware asynchronous scheduler with wait/cancel semantics
//! - **Walker**: workspace discovery that schedules indexing for files on disk
//! - **Indexer**: the policy mapping document changes to job pipelines
//!
//! # Architecture
//!
//! - [`handle`]: normalized directory and document identities
//! - [`document`]: the [`document::DocumentStore`] and incremental edit application
//! - [`job`]: the [`job::JobStore`] scheduler
//! - [`walker`]: directory traversal and its visitor sinks
//! - [`indexer`]: job pipelines and indexed module snapshots
//! - [`state`]: the per-session [`state::StateStore`] handed to every handler
//! - [`server`]: tower-lsp notification handlers driving the above
//!
//! # Usage
//!
//! ```ignore
//! use retab_ls::config::Settings;
//! use retab_ls::state::StateStore;
//!
//! let state = StateStore::new(&Settings::default())?;
//! let ids = state.indexer.document_changed(&token, handle.dir())?;
//! state.jobs.wait_for_jobs(&token, &ids).await?;
//! ```

// Core stores
pub mod document;
pub mod handle;
pub mod job;

// Indexing
pub mod indexer;
pub mod walker;

// Session wiring
pub mod config;
pub mod server;
pub mod state;

// Test utilities (only available in test builds)
#[cfg(test)]
pub mod test_utils;
