//! Host control library for the PiSpec LED-pulse photometer.
//!
//! The instrument runs hardware-timed measurement "traces" and speaks a
//! semicolon-delimited text protocol over USB serial. This crate owns the
//! two halves of the host side: the device link (framing, timeout-bounded
//! reads, reconnection) and the experiment engine (a sequential action-list
//! interpreter that paces traces in real time).
//!
//! GUI, CSV export, and upload live in separate tools; they consume the
//! [`trace::TraceRecord`]s this crate produces.

pub mod adapters;
pub mod config;
pub mod data;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod link;
pub mod parameter;
pub mod protocol;
pub mod session;
pub mod trace;
pub mod watchdog;

pub use error::{AppResult, PispecError};
