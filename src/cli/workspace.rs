use anyhow::{Context, Result};
use live_migrate::{
    InMemoryReplicationHub, InMemoryStateStore, InMemoryStorage, Migrator, MigratorConfig,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

const CONFIG_FILE: &str = "config.json";
const STORAGE_FILE: &str = "storage.json";
const STATE_FILE: &str = "state.json";
const AUDIT_FILE: &str = "audit.journal";

/// Local-mode site: storage and orchestrator state live as files in one directory.
pub struct Workspace {
    dir: PathBuf,
    storage: Arc<InMemoryStorage>,
    store: Arc<InMemoryStateStore>,
    pub migrator: Migrator,
}

impl Workspace {
    pub async fn open(dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create state directory '{}'", dir.display()))?;

        let config = match config_path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(dir.join(CONFIG_FILE)).filter(|p| p.exists()),
        };
        let config = match config {
            Some(path) => MigratorConfig::from_json_file(&path)
                .with_context(|| format!("Failed to load config '{}'", path.display()))?,
            None => MigratorConfig::default(),
        };

        let storage = Arc::new(InMemoryStorage::new());
        let storage_path = dir.join(STORAGE_FILE);
        if storage_path.exists() {
            storage
                .load_snapshot(&storage_path)
                .await
                .with_context(|| format!("Failed to load '{}'", storage_path.display()))?;
        }

        let store = Arc::new(
            InMemoryStateStore::new()
                .with_audit_journal(&dir.join(AUDIT_FILE))
                .context("Failed to open audit journal")?,
        );
        let state_path = dir.join(STATE_FILE);
        if state_path.exists() {
            store
                .load_snapshot(&state_path)
                .await
                .with_context(|| format!("Failed to load '{}'", state_path.display()))?;
        }

        let hub = InMemoryReplicationHub::new();
        let endpoint = hub
            .register_site(&config.site_name, &config.subscriptions)
            .await
            .context("Failed to register local replication endpoint")?;

        info!(site = %config.site_name, dir = %dir.display(), "workspace opened");
        let migrator = Migrator::with_store(config, storage.clone(), store.clone(), Arc::new(endpoint))
            .context("Invalid configuration")?;
        Ok(Self {
            dir: dir.to_path_buf(),
            storage,
            store,
            migrator,
        })
    }

    pub async fn save(&self) -> Result<()> {
        let storage_path = self.dir.join(STORAGE_FILE);
        self.storage
            .save_snapshot(&storage_path)
            .await
            .with_context(|| format!("Failed to write '{}'", storage_path.display()))?;
        let state_path = self.dir.join(STATE_FILE);
        self.store
            .save_snapshot(&state_path)
            .await
            .with_context(|| format!("Failed to write '{}'", state_path.display()))?;
        Ok(())
    }
}
