//! Context engine - orchestrates sessions, scoring, compression, and the
//! long-term memory store behind one entry point.

pub mod manager;

pub use manager::{CompressionReport, CompressionTarget, ContextManager, SessionState};
