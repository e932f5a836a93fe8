//! The two reconcilers and their shared plumbing.

pub mod application_restore;
pub mod group_snapshot;
pub mod helpers;
pub mod restore_resources;
pub mod snapshot_objects;
