//! Storage orchestration operator: consistent multi-volume snapshot groups
//! and application-level restores, driven by two stage-based reconcilers
//! over custom resources.
//!
//! Volume drivers, rule execution, object-store access and manifest
//! collection are pluggable collaborators; this crate owns the workflow
//! state machines and the durable status they maintain.

pub mod collector;
pub mod controller;
pub mod crd;
pub mod drivers;
pub mod error;
pub mod objectstore;
pub mod rules;

pub use error::{Error, Result};
