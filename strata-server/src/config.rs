use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde_derive::{Deserialize, Serialize};

/// Conventional directory for instance options files.
const DEFAULT_CONFIG_DIR: &str = "config";

pub const DEFAULT_SQL_LISTEN_ADDR: &str = "127.0.0.1:50000";
pub const DEFAULT_REST_LISTEN_ADDR: &str = "127.0.0.1:50080";
const DEFAULT_MASTER_CIPHER_ID: &str = "aes128";
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_REST_MAX_ROWS: usize = 10_000;
const DEFAULT_REST_MAX_PAYLOAD: usize = 1024 * 1024;

/// Instance options file, JSON. All further configuration of the server is
/// read from here; the command line only locates the file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// Instance name.
    pub instance: String,

    /// Instance data directory.
    pub data_dir: PathBuf,

    /// SQL listener address, `host:port`.
    pub sql_listen_addr: Option<String>,

    /// REST listener address, `host:port`.
    pub rest_listen_addr: Option<String>,

    /// Executor pool size. Defaults to the CPU count.
    pub worker_threads: Option<usize>,

    /// Master cipher id, default 'aes128'.
    pub master_cipher_id: Option<String>,

    /// File holding the raw master cipher key bytes.
    pub master_key_file: PathBuf,

    /// Hex form of the superuser's initial Ed25519 public key.
    pub superuser_initial_access_key: String,

    /// Block data area size override, bytes.
    pub data_area_size: Option<u32>,

    /// Log directory; default '<data_dir>/log'.
    pub log_dir: Option<PathBuf>,

    /// Log level, default 'info'.
    pub log_level: Option<String>,

    /// Row-count cap for REST POST payloads.
    pub rest_max_rows: Option<usize>,

    /// Byte-size cap for REST POST/PATCH payloads.
    pub rest_max_payload: Option<usize>,
}

impl InstanceConfig {
    /// Loads the options file for `--instance <name>` from the conventional
    /// location.
    pub fn load_for_instance(name: &str) -> Result<InstanceConfig> {
        let path = PathBuf::from(DEFAULT_CONFIG_DIR).join(format!("{}.json", name));
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<InstanceConfig> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("cannot read instance options file {}", path.display()))?;
        let config: InstanceConfig = serde_json::from_str(&text)
            .with_context(|| format!("invalid instance options file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.instance.is_empty() {
            return Err(anyhow!("instance name must not be empty"));
        }
        if self.superuser_initial_access_key.trim().is_empty() {
            return Err(anyhow!("superuser_initial_access_key must be configured"));
        }
        if let Some(0) = self.worker_threads {
            return Err(anyhow!("worker_threads must be nonzero"));
        }
        if let Some(0) = self.rest_max_rows {
            return Err(anyhow!("rest_max_rows must be nonzero"));
        }
        Ok(())
    }

    pub fn sql_listen_addr(&self) -> &str {
        self.sql_listen_addr.as_deref().unwrap_or(DEFAULT_SQL_LISTEN_ADDR)
    }

    pub fn rest_listen_addr(&self) -> &str {
        self.rest_listen_addr.as_deref().unwrap_or(DEFAULT_REST_LISTEN_ADDR)
    }

    pub fn worker_threads(&self) -> usize {
        self.worker_threads.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn master_cipher_id(&self) -> &str {
        self.master_cipher_id.as_deref().unwrap_or(DEFAULT_MASTER_CIPHER_ID)
    }

    /// Reads the raw master key bytes.
    pub fn read_master_key(&self) -> Result<Vec<u8>> {
        fs::read(&self.master_key_file).with_context(|| {
            format!("cannot read master key file {}", self.master_key_file.display())
        })
    }

    pub fn data_area_size(&self) -> u32 {
        self.data_area_size.unwrap_or(strata::storage::DEFAULT_DATA_AREA_SIZE)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| self.data_dir.join("log"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }

    pub fn rest_max_rows(&self) -> usize {
        self.rest_max_rows.unwrap_or(DEFAULT_REST_MAX_ROWS)
    }

    pub fn rest_max_payload(&self) -> usize {
        self.rest_max_payload.unwrap_or(DEFAULT_REST_MAX_PAYLOAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_and_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t1.json");
        fs::write(
            &path,
            r#"{
                "instance": "t1",
                "data_dir": "/tmp/strata-t1",
                "master_key_file": "/tmp/strata-t1.key",
                "superuser_initial_access_key": "ab"
            }"#,
        )
        .unwrap();
        let config = InstanceConfig::load(&path).unwrap();
        assert_eq!(config.instance, "t1");
        assert_eq!(config.sql_listen_addr(), DEFAULT_SQL_LISTEN_ADDR);
        assert_eq!(config.master_cipher_id(), "aes128");
        assert!(config.worker_threads() >= 1);
        assert_eq!(config.rest_max_rows(), DEFAULT_REST_MAX_ROWS);
        assert_eq!(config.log_dir(), PathBuf::from("/tmp/strata-t1/log"));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "instance": "" }"#).unwrap();
        assert!(InstanceConfig::load(&path).is_err());

        fs::write(
            &path,
            r#"{
                "instance": "x",
                "data_dir": "/tmp/x",
                "master_key_file": "/tmp/x.key",
                "superuser_initial_access_key": "ab",
                "worker_threads": 0
            }"#,
        )
        .unwrap();
        assert!(InstanceConfig::load(&path).is_err());
    }
}
