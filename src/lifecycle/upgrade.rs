use std::path::{Path, PathBuf};

use tokio::fs;

use crate::control::UpgradeScripts;
use crate::error::{AgentError, Result};

const BACKUP_PREFIX: &str = "backup.";

/// Compares and replaces the run scripts a watcher starts the agent with.
#[derive(Debug, Clone)]
pub struct UpgradeManager {
    scripts_dir: PathBuf,
    current_version: String,
}

impl UpgradeManager {
    pub fn new(scripts_dir: impl Into<PathBuf>, current_version: impl Into<String>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            current_version: current_version.into(),
        }
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    fn backup_dir(&self, version: &str) -> PathBuf {
        self.scripts_dir.join(format!("{}{}", BACKUP_PREFIX, version))
    }

    /// True when the remote version differs or any remote script differs from the local copy.
    pub async fn needs_upgrade(&self, remote: &UpgradeScripts) -> Result<bool> {
        if remote.version != self.current_version {
            return Ok(true);
        }
        for (name, contents) in &remote.scripts {
            let path = self.scripts_dir.join(checked_name(name)?);
            match fs::read_to_string(&path).await {
                Ok(local) if &local == contents => {}
                Ok(_) => return Ok(true),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(false)
    }

    /// Back up the current scripts into `backup.<current-version>/` and write the new ones.
    pub async fn replace_scripts(&self, remote: &UpgradeScripts) -> Result<()> {
        let backup = self.backup_dir(&self.current_version);
        fs::create_dir_all(&backup).await?;

        for (name, contents) in &remote.scripts {
            let name = checked_name(name)?;
            let path = self.scripts_dir.join(name);
            if fs::try_exists(&path).await? {
                fs::copy(&path, backup.join(name)).await?;
            }
            let tmp = self.scripts_dir.join(format!(".{}.tmp", name));
            fs::write(&tmp, contents).await?;
            make_executable(&tmp).await?;
            fs::rename(&tmp, &path).await?;
        }

        tracing::info!(
            from = %self.current_version,
            to = %remote.version,
            scripts = remote.scripts.len(),
            "Run scripts replaced"
        );
        Ok(())
    }

    /// Remove every `backup.*` directory except the current version's.
    pub async fn cleanup_backups(&self) -> Result<usize> {
        let keep = self.backup_dir(&self.current_version);
        let mut removed = 0;
        let mut entries = match fs::read_dir(&self.scripts_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let is_backup = entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(BACKUP_PREFIX));
            if is_backup && entry.file_type().await?.is_dir() && entry.path() != keep {
                fs::remove_dir_all(entry.path()).await?;
                removed += 1;
            }
        }
        if removed > 0 {
            tracing::info!(removed, "Removed stale script backups");
        }
        Ok(removed)
    }
}

fn checked_name(name: &str) -> Result<&str> {
    let plain = Path::new(name)
        .file_name()
        .is_some_and(|file| file == name);
    if !plain || name.starts_with('.') {
        return Err(AgentError::Internal(format!(
            "refusing upgrade script with path-like name {:?}",
            name
        )));
    }
    Ok(name)
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scripts(version: &str, start: &str) -> UpgradeScripts {
        UpgradeScripts {
            version: version.into(),
            scripts: BTreeMap::from([("start.sh".to_string(), start.to_string())]),
        }
    }

    #[tokio::test]
    async fn test_needs_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("start.sh"), "run v1").unwrap();
        let manager = UpgradeManager::new(dir.path(), "1.0.0");

        assert!(!manager.needs_upgrade(&scripts("1.0.0", "run v1")).await.unwrap());
        assert!(manager.needs_upgrade(&scripts("1.0.0", "run v1b")).await.unwrap());
        assert!(manager.needs_upgrade(&scripts("1.1.0", "run v1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_replace_scripts_backs_up_and_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("start.sh"), "run v1").unwrap();
        let manager = UpgradeManager::new(dir.path(), "1.0.0");

        manager
            .replace_scripts(&scripts("1.1.0", "run v2"))
            .await
            .unwrap();

        let replaced = dir.path().join("start.sh");
        assert_eq!(std::fs::read_to_string(&replaced).unwrap(), "run v2");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("backup.1.0.0/start.sh")).unwrap(),
            "run v1"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&replaced).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn test_cleanup_keeps_current_backup() {
        let dir = tempfile::tempdir().unwrap();
        for version in ["0.9.0", "1.0.0", "0.8.0"] {
            std::fs::create_dir(dir.path().join(format!("backup.{}", version))).unwrap();
        }
        let manager = UpgradeManager::new(dir.path(), "1.0.0");

        assert_eq!(manager.cleanup_backups().await.unwrap(), 2);
        assert!(dir.path().join("backup.1.0.0").exists());
        assert!(!dir.path().join("backup.0.9.0").exists());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = UpgradeManager::new(dir.path(), "1.0.0");
        let evil = UpgradeScripts {
            version: "2.0.0".into(),
            scripts: BTreeMap::from([("../evil.sh".to_string(), "rm -rf /".to_string())]),
        };
        assert!(manager.replace_scripts(&evil).await.is_err());
    }
}
