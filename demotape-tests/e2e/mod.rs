//! End-to-end tests for Demotape
//!
//! These tests drive complete workflows through the HTTP router: viewer
//! headers in, streamed bytes and JSON out.

mod streaming_workflow;
