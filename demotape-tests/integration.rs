//! Integration tests for Demotape
//!
//! These tests drive the core components together against temporary
//! directories: streaming controller, demo generator, format processor and
//! the in-memory catalog and metadata collaborators.

#[path = "integration/fixtures.rs"]
mod fixtures;

#[path = "integration/demo_pipeline.rs"]
mod demo_pipeline;
#[path = "integration/format_bundles.rs"]
mod format_bundles;
#[path = "integration/purchase_gate.rs"]
mod purchase_gate;
#[path = "integration/range_validation.rs"]
mod range_validation;
