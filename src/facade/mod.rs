pub mod migrator;

pub use migrator::{
    JobProgress, MigrationRequest, Migrator, PartnerScript, PurgeReport, ReadinessCheck,
    ReadinessReport, StatusReport,
};
