use base64::Engine as _;
use directories::ProjectDirs;
use eyre::{Context as _, ContextCompat as _};
use rand::Rng as _;
use std::path::PathBuf;
use std::{fs::OpenOptions, io::Write as _};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt as _;

#[derive(Debug, Clone)]
pub struct MeshwardPaths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
}

impl MeshwardPaths {
    pub fn discover() -> eyre::Result<Self> {
        // Test/CI override knobs.
        if let (Ok(data_dir), Ok(config_dir)) = (
            std::env::var("MESHWARD_DATA_DIR"),
            std::env::var("MESHWARD_CONFIG_DIR"),
        ) {
            let data_dir = PathBuf::from(data_dir);
            let config_dir = PathBuf::from(config_dir);
            let log_file = data_dir.join("meshward.log.jsonl");
            return Ok(Self {
                config_dir,
                data_dir,
                log_file,
            });
        }

        // Default locations:
        // macOS: ~/Library/Application Support/meshward
        // Linux: ~/.config/meshward
        // Windows: %APPDATA%\\meshward
        let proj =
            ProjectDirs::from("", "", "meshward").context("failed to resolve project dirs")?;
        let config_dir = proj.config_dir().to_path_buf();
        let data_dir = proj.data_dir().to_path_buf();

        let log_file = data_dir.join("meshward.log.jsonl");

        Ok(Self {
            config_dir,
            data_dir,
            log_file,
        })
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }

    pub fn allowlist_path(&self) -> PathBuf {
        self.data_dir.join("allowlist.txt")
    }

    pub fn vault_path(&self) -> PathBuf {
        self.config_dir.join("vault.json")
    }

    pub fn admin_socket_path(&self) -> PathBuf {
        self.data_dir.join("admin.sock")
    }

    /// Admin socket path, honoring `config.admin_socket_path` when the
    /// operator has set an override; falls back to [`Self::admin_socket_path`]
    /// otherwise.
    pub fn resolved_admin_socket_path(&self, config: &crate::config::MeshwardConfig) -> PathBuf {
        config
            .admin_socket_path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.admin_socket_path())
    }

    /// One-time secret cookie used to authenticate admin API requests (spec
    /// §4.12). Written fresh at every relay startup.
    pub fn admin_cookie_path(&self) -> PathBuf {
        self.config_dir.join("admin_cookie.txt")
    }

    pub fn ensure_private_dirs(&self) -> eyre::Result<()> {
        crate::fsutil::ensure_private_dir(&self.config_dir)?;
        crate::fsutil::ensure_private_dir(&self.data_dir)?;
        Ok(())
    }

    /// Writes a fresh random cookie, replacing any previous one.
    ///
    /// Crash-robust by construction: we never create an empty visible final
    /// file. Instead we write a temp file and hard-link it into place (which
    /// fails if the destination exists), removing the previous cookie first.
    pub fn write_admin_cookie(&self) -> eyre::Result<String> {
        self.ensure_private_dirs()?;
        let p = self.admin_cookie_path();
        drop(std::fs::remove_file(&p));

        let mut bytes = [0_u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        let cookie = base64::engine::general_purpose::STANDARD.encode(bytes);

        let parent = p
            .parent()
            .ok_or_else(|| eyre::eyre!("missing parent for {}", p.display()))?;
        let suffix = {
            let mut rand_bytes = [0_u8; 8];
            rand::rng().fill_bytes(&mut rand_bytes);
            hex::encode(rand_bytes)
        };
        let tmp = parent.join(format!(
            ".{}.tmp.{}",
            p.file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("admin_cookie.txt"),
            suffix
        ));

        let mut oo = OpenOptions::new();
        oo.create_new(true).write(true).truncate(false);
        #[cfg(unix)]
        {
            oo.mode(crate::fsutil::MODE_FILE_PRIVATE);
        }
        let mut f = oo
            .open(&tmp)
            .with_context(|| format!("open temp {}", tmp.display()))?;
        f.write_all(format!("{cookie}\n").as_bytes())
            .with_context(|| format!("write {}", tmp.display()))?;
        f.flush()
            .with_context(|| format!("flush {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("fsync {}", tmp.display()))?;
        drop(f);

        match std::fs::hard_link(&tmp, &p) {
            Ok(()) => {
                drop(std::fs::remove_file(&tmp));
                Ok(cookie)
            }
            Err(e) => {
                drop(std::fs::remove_file(&tmp));
                Err(eyre::Report::new(e).wrap_err(format!(
                    "hard_link {} -> {}",
                    tmp.display(),
                    p.display()
                )))
            }
        }
    }

    pub fn read_admin_cookie(&self) -> eyre::Result<String> {
        let p = self.admin_cookie_path();
        let md = std::fs::symlink_metadata(&p).with_context(|| format!("stat {}", p.display()))?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to read symlink: {}", p.display());
        }
        let s = std::fs::read_to_string(&p).with_context(|| format!("read {}", p.display()))?;
        Ok(s.trim().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discover_honors_env_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        let config = dir.path().join("config");
        std::env::set_var("MESHWARD_DATA_DIR", &data);
        std::env::set_var("MESHWARD_CONFIG_DIR", &config);

        let paths = MeshwardPaths::discover().unwrap();
        assert_eq!(paths.data_dir, data);
        assert_eq!(paths.config_dir, config);

        std::env::remove_var("MESHWARD_DATA_DIR");
        std::env::remove_var("MESHWARD_CONFIG_DIR");
    }

    #[test]
    fn admin_cookie_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let paths = MeshwardPaths {
            config_dir: dir.path().join("config"),
            data_dir: dir.path().join("data"),
            log_file: dir.path().join("data/log.jsonl"),
        };
        let written = paths.write_admin_cookie().unwrap();
        let read = paths.read_admin_cookie().unwrap();
        assert_eq!(written, read);

        // Writing again replaces the cookie.
        let second = paths.write_admin_cookie().unwrap();
        assert_ne!(written, second);
        assert_eq!(paths.read_admin_cookie().unwrap(), second);
    }
}
