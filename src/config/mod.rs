pub mod printer_config;
pub mod printer_id;

use anyhow::{anyhow, bail, ensure, Context, Result};
use tracing::{debug, error, info, trace, warn};

use dashmap::{mapref::entry::Entry, DashMap};
use serde::{Deserialize, Serialize};
use std::{path::Path, sync::Arc, time::Duration};
use tokio::sync::RwLock;

use crate::config::{printer_config::PrinterConfigBambu, printer_id::PrinterId};

pub const DEFAULT_CONFIG_PATH: &str = "printers.toml";
pub const CONFIG_PATH_ENV: &str = "BATCH_PRINTER_CONFIG";

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 5;
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 100 * 1024 * 1024;

/// On-disk layout of `printers.toml`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size: u64,
    #[serde(default)]
    pub printers: Vec<PrinterConfigBambu>,
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

fn default_max_upload_size() -> u64 {
    DEFAULT_MAX_UPLOAD_SIZE
}

impl Default for ConfigFile {
    fn default() -> Self {
        Self {
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            printers: vec![],
        }
    }
}

#[derive(Clone)]
pub struct AppConfig {
    refresh_interval: Duration,
    max_upload_size: u64,
    printers: Arc<DashMap<PrinterId, Arc<RwLock<PrinterConfigBambu>>>>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::empty()
    }
}

/// getters
impl AppConfig {
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    pub fn max_upload_size(&self) -> u64 {
        self.max_upload_size
    }
}

/// load
impl AppConfig {
    pub fn empty() -> Self {
        Self {
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            printers: Arc::new(DashMap::new()),
        }
    }

    pub fn from_config_file(file: ConfigFile) -> Result<Self> {
        ensure!(
            file.refresh_interval_secs > 0,
            "refresh_interval_secs must be positive"
        );
        let out = Self {
            refresh_interval: Duration::from_secs(file.refresh_interval_secs),
            max_upload_size: file.max_upload_size,
            printers: Arc::new(DashMap::new()),
        };
        for printer in file.printers {
            out.add_printer(printer)?;
        }
        Ok(out)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        debug!(
            "loaded {} printers from {}",
            file.printers.len(),
            path.display()
        );
        Self::from_config_file(file)
    }

    /// Adds the printer described by `BAMBU_IP`, `BAMBU_ACCESS_CODE`,
    /// `BAMBU_IDENT` and (optionally) `BAMBU_ID`, if those are set.
    pub fn add_printer_from_env(&self) -> Result<Option<PrinterId>> {
        let (Ok(host), Ok(access_code), Ok(serial)) = (
            std::env::var("BAMBU_IP"),
            std::env::var("BAMBU_ACCESS_CODE"),
            std::env::var("BAMBU_IDENT"),
        ) else {
            return Ok(None);
        };
        let id: PrinterId = std::env::var("BAMBU_ID")
            .map(PrinterId::from)
            .unwrap_or_else(|_| PrinterId::from_id(&serial));
        let name = std::env::var("BAMBU_NAME").unwrap_or_else(|_| serial.clone());

        let printer = PrinterConfigBambu::from_id(serial, name, host, access_code, id.clone());
        self.add_printer(printer)?;
        Ok(Some(id))
    }
}

impl AppConfig {
    pub fn add_printer(&self, printer: PrinterConfigBambu) -> Result<()> {
        if printer.host.is_empty() {
            bail!("printer {} is missing a host", printer.name);
        }
        match self.printers.entry(printer.id.clone()) {
            Entry::Occupied(_) => bail!("printer already exists: {}", printer.id),
            Entry::Vacant(v) => {
                v.insert(Arc::new(RwLock::new(printer)));
            }
        }
        Ok(())
    }

    pub fn printer_ids(&self) -> Vec<PrinterId> {
        let mut ids: Vec<PrinterId> = self.printers.iter().map(|v| v.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn get_printer(&self, id: &PrinterId) -> Option<Arc<RwLock<PrinterConfigBambu>>> {
        self.printers.get(id).map(|v| v.value().clone())
    }

    pub fn len(&self) -> usize {
        self.printers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.printers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CONFIG: &str = r#"
refresh_interval_secs = 2

[[printers]]
id = "p1s-01"
serial = "01P00A000000001"
name = "P1S 01"
host = "192.168.1.50"
access_code = "12345678"

[[printers]]
serial = "01P00A000000002"
name = "P1S 02"
host = "192.168.1.51"
access_code = "87654321"
"#;

    #[test]
    fn load_from_file_reads_printers_and_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();

        let config = AppConfig::load_from_file(file.path()).unwrap();

        assert_eq!(config.len(), 2);
        assert_eq!(config.refresh_interval(), Duration::from_secs(2));
        assert_eq!(config.max_upload_size(), DEFAULT_MAX_UPLOAD_SIZE);

        let p1 = config.get_printer(&PrinterId::from_id("p1s-01")).unwrap();
        let p1 = p1.blocking_read();
        assert_eq!(p1.name, "P1S 01");
        assert_eq!(p1.topic_device_report(), "device/01P00A000000001/report");
    }

    #[test]
    fn duplicate_printer_is_rejected() {
        let config = AppConfig::empty();
        let id = PrinterId::from_id("dup");
        let printer = PrinterConfigBambu::from_id(
            "serial".to_string(),
            "name".to_string(),
            "10.0.0.2".to_string(),
            "code".to_string(),
            id.clone(),
        );
        config.add_printer(printer.clone()).unwrap();
        assert!(config.add_printer(printer).is_err());
        assert_eq!(config.printer_ids(), vec![id]);
    }

    #[test]
    fn zero_refresh_interval_is_rejected() {
        let file = ConfigFile {
            refresh_interval_secs: 0,
            ..Default::default()
        };
        assert!(AppConfig::from_config_file(file).is_err());
    }
}
