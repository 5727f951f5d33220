//! Integration test suite for swarm.
//!
//! These tests drive full scheduling runs through the public API with the
//! simulated executor, so no agent binary or API key is needed.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Plan loading, demo scenarios and end-to-end runs
//! - `parallel_tasks`: Concurrency limits and resource conflicts
//! - `recovery`: Retries, budget exhaustion, stalls and shutdown

mod fixtures;

mod parallel_tasks;
mod recovery;
mod workflow_e2e;
