//! Video emotion analysis pipeline.
//!
//! This library backs two binaries: the `vidmood` ingestion API, which
//! accepts video uploads and tracks analysis jobs in a PostgreSQL registry,
//! and the `processor` service, which decodes dispatched videos, classifies
//! per-frame emotions through an external inference service, and stores the
//! resulting emotion timelines.

pub mod app_state;
pub mod config;
pub mod db;
pub mod models;
pub mod routes;
pub mod services;
