//! # wds-core
//!
//! Core types, ID prefixes, and error types for the experiment datastore.
//!
//! This crate provides the foundational types shared across all datastore crates:
//! - Entity structs for experiments, target groups, participant sessions, and data points
//! - Lifecycle enums with state machine transitions
//! - ID prefix constants
//! - Cross-cutting error types
//! - Result codes and response types returned to the request layer

pub mod entities;
pub mod enums;
pub mod errors;
pub mod ids;
pub mod responses;
