use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use backlog_core::{Clock, QueueConfig};
use tracing::{debug, info};

use crate::db::TableNames;
use crate::driver::{FileDriver, StorageDriver, TableDriver};
use crate::error::{QueueError, Result};

/// Resolves backend names to shared driver instances.
///
/// Each name is constructed on first use and cached, so every dispatcher and
/// runner holding the same registry talks to the same store.
pub struct DriverRegistry {
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    drivers: Mutex<HashMap<String, Arc<dyn StorageDriver>>>,
}

impl DriverRegistry {
    pub fn new(config: QueueConfig, clock: Arc<dyn Clock>) -> Self {
        info!(default_driver = %config.driver, max_job = config.max_job, "driver registry created");
        Self {
            config,
            clock,
            drivers: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The driver named in configuration.
    pub fn default_driver(&self) -> Result<Arc<dyn StorageDriver>> {
        self.driver(&self.config.driver)
    }

    /// Look up (or build) the driver called `name`.
    ///
    /// Known names: `file`, and `database` (alias `sqlite`).
    pub fn driver(&self, name: &str) -> Result<Arc<dyn StorageDriver>> {
        let key = name.trim().to_ascii_lowercase();
        let mut drivers = self.drivers.lock().unwrap();
        if let Some(driver) = drivers.get(&key) {
            return Ok(Arc::clone(driver));
        }

        let driver: Arc<dyn StorageDriver> = match key.as_str() {
            "file" => Arc::new(FileDriver::open(&self.config.file.path, Arc::clone(&self.clock))?),
            "database" | "sqlite" => Arc::new(TableDriver::open(
                &self.config.database.path,
                TableNames::from_config(&self.config.database)?,
                Arc::clone(&self.clock),
            )?),
            _ => {
                return Err(QueueError::UnknownDriver {
                    name: name.to_string(),
                })
            }
        };
        debug!(driver = %key, "driver constructed");
        drivers.insert(key, Arc::clone(&driver));
        Ok(driver)
    }

    /// Install a pre-built driver under `name`, replacing any cached one.
    pub fn insert(&self, name: &str, driver: Arc<dyn StorageDriver>) {
        let key = name.trim().to_ascii_lowercase();
        self.drivers.lock().unwrap().insert(key, driver);
    }

    /// Drop every cached driver; the next lookup rebuilds from configuration.
    pub fn reset(&self) {
        self.drivers.lock().unwrap().clear();
        debug!("driver cache cleared");
    }
}
