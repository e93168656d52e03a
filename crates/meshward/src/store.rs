use crate::{config::MeshwardConfig, paths::MeshwardPaths};
use eyre::Context as _;
use std::{fs, path::PathBuf};

#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(paths: &MeshwardPaths) -> Self {
        Self {
            path: paths.config_path(),
        }
    }

    pub fn load_or_init_default(&self) -> eyre::Result<MeshwardConfig> {
        if !self.path.exists() {
            let cfg = MeshwardConfig::default();
            self.save(&cfg)?;
            return Ok(cfg);
        }

        let s = fs::read_to_string(&self.path).context("read config.toml")?;
        let cfg: MeshwardConfig = toml::from_str(&s).context("parse config.toml")?;
        Ok(cfg)
    }

    pub fn save(&self, cfg: &MeshwardConfig) -> eyre::Result<()> {
        if let Some(parent) = self.path.parent() {
            crate::fsutil::ensure_private_dir(parent)?;
        }
        let s = toml::to_string_pretty(cfg).context("serialize config.toml")?;
        crate::fsutil::write_string_atomic_restrictive(
            &self.path,
            &s,
            crate::fsutil::MODE_FILE_PRIVATE,
        )
        .context("write config.toml")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_init_creates_default_on_first_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MeshwardPaths {
            config_dir: dir.path().join("config"),
            data_dir: dir.path().join("data"),
            log_file: dir.path().join("data/log.jsonl"),
        };
        let store = ConfigStore::new(&paths);
        assert!(!paths.config_path().exists());
        let cfg = store.load_or_init_default().unwrap();
        assert!(paths.config_path().exists());
        assert_eq!(cfg.probation_limit, MeshwardConfig::default().probation_limit);

        let mut cfg2 = store.load_or_init_default().unwrap();
        cfg2.probation_limit = 99;
        store.save(&cfg2).unwrap();
        let reloaded = store.load_or_init_default().unwrap();
        assert_eq!(reloaded.probation_limit, 99);
    }
}
