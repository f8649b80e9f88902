//! Caseline: legal case intake and management service.
//!
//! Clients submit cases; agents and admins triage, message, annotate, and
//! resolve them, with file attachments and post-resolution feedback. The
//! service owns authentication, relational storage, object storage, the
//! per-case live feed, and the AI triage client.

pub mod assign;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod gateway;
pub mod live;
pub mod storage;
