pub mod maintenance;
pub mod switch;

pub use maintenance::{BackupRelation, CleanupReport, ROLLED_BACK_SUFFIX, SkippedBackup};
pub use switch::{
    CutoverEngine, SwitchOperation, SwitchReport, SwitchStatus, backup_name,
    parse_backup_timestamp,
};
