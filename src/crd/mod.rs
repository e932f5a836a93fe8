pub mod application_backup;
pub mod application_restore;
pub mod backup_location;
pub mod group_volume_snapshot;
pub mod rule;
pub mod shared;
pub mod snapshot;
