use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::OrchestratorError;
use crate::{log_info, log_warn};

const TASK_EXECUTOR_DIR: &str = ".claudiomiro/task-executor";
const LEGACY_DIR: &str = ".claudiomiro";
const CONFIG_FILE: &str = "multi-repo.json";

/// Two-repo layout mode.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepoMode {
    Monorepo,
    Separate,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Repositories {
    pub backend: Option<PathBuf>,
    pub frontend: Option<PathBuf>,
}

/// The result of the git-configuration probe run against a candidate
/// `--backend`/`--frontend` pair.
#[derive(Clone, Debug, PartialEq)]
pub struct RepoDetection {
    pub mode: RepoMode,
    pub git_roots: Vec<PathBuf>,
}

/// Persisted two-repo mapping.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MultiRepoConfig {
    pub enabled: bool,
    pub mode: RepoMode,
    pub repositories: Repositories,
    #[serde(rename = "gitRoots")]
    pub git_roots: Vec<PathBuf>,
}

/// Build a config for an enabled two-repo run and persist it at all three
/// well-known locations (workspace root, backend root, frontend root) so a
/// later `--continue` from either repo can restore it.
pub fn set_multi_repo(
    workspace_root: &Path,
    backend: &Path,
    frontend: &Path,
    detect: &RepoDetection,
) -> Result<MultiRepoConfig, OrchestratorError> {
    let config = MultiRepoConfig {
        enabled: true,
        mode: detect.mode,
        repositories: Repositories {
            backend: Some(backend.to_path_buf()),
            frontend: Some(frontend.to_path_buf()),
        },
        git_roots: detect.git_roots.clone(),
    };

    for root in [workspace_root, backend, frontend] {
        write_config_atomic(&task_executor_path(root), &config)?;
    }

    Ok(config)
}

/// Restore-on-continue procedure: look for the primary location,
/// then the legacy location (migrating it by copy if found), else conclude
/// single-repo. Invalid JSON or `enabled=false` both degrade to single-repo
/// with a warning/no-op respectively — never an error.
pub fn restore_on_continue(workspace_root: &Path) -> Option<MultiRepoConfig> {
    let primary = task_executor_path(workspace_root);
    if primary.exists() {
        return load_enabled_config(&primary);
    }

    let legacy = legacy_path(workspace_root);
    if !legacy.exists() {
        return None;
    }

    let config = load_enabled_config(&legacy)?;
    if let Err(e) = write_config_atomic(&primary, &config) {
        log_warn!(
            "Failed to migrate legacy multi-repo.json to {}: {}",
            primary.display(),
            e
        );
    } else {
        log_info!(
            "Migrated legacy multi-repo.json ({}) to {}",
            legacy.display(),
            primary.display()
        );
    }

    log_info!("Restored multi-repo mode: {:?}", config.mode);
    Some(config)
}

fn load_enabled_config(path: &Path) -> Option<MultiRepoConfig> {
    let contents = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<MultiRepoConfig>(&contents) {
        Ok(config) if config.enabled => Some(config),
        Ok(_) => None,
        Err(_) => {
            log_warn!("Invalid multi-repo.json, continuing as single-repo mode");
            None
        }
    }
}

fn task_executor_path(root: &Path) -> PathBuf {
    root.join(TASK_EXECUTOR_DIR).join(CONFIG_FILE)
}

fn legacy_path(root: &Path) -> PathBuf {
    root.join(LEGACY_DIR).join(CONFIG_FILE)
}

/// Writes to a `NamedTempFile` in the same directory, syncs it to disk, then
/// persists it over the target path. The file is always either the old
/// version or the new version, never partially written.
fn write_config_atomic(path: &Path, config: &MultiRepoConfig) -> Result<(), OrchestratorError> {
    let parent = path
        .parent()
        .ok_or_else(|| OrchestratorError::InvalidInput(format!("no parent for {}", path.display())))?;
    fs::create_dir_all(parent)?;

    let json = serde_json::to_string_pretty(config)?;

    let temp_file = NamedTempFile::new_in(parent)?;
    fs::write(temp_file.path(), &json)?;

    let file = fs::File::open(temp_file.path())?;
    file.sync_all()?;

    temp_file
        .persist(path)
        .map_err(|e| OrchestratorError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn detect() -> RepoDetection {
        RepoDetection {
            mode: RepoMode::Separate,
            git_roots: vec![PathBuf::from("/b"), PathBuf::from("/f")],
        }
    }

    #[test]
    fn set_multi_repo_persists_to_all_three_roots() {
        let workspace = TempDir::new().unwrap();
        let backend = TempDir::new().unwrap();
        let frontend = TempDir::new().unwrap();

        set_multi_repo(workspace.path(), backend.path(), frontend.path(), &detect()).unwrap();

        for root in [workspace.path(), backend.path(), frontend.path()] {
            assert!(task_executor_path(root).exists());
        }
    }

    #[test]
    fn restore_on_continue_reads_primary_location() {
        let workspace = TempDir::new().unwrap();
        let backend = TempDir::new().unwrap();
        let frontend = TempDir::new().unwrap();
        set_multi_repo(workspace.path(), backend.path(), frontend.path(), &detect()).unwrap();

        let restored = restore_on_continue(workspace.path()).unwrap();
        assert!(restored.enabled);
        assert_eq!(restored.mode, RepoMode::Separate);
    }

    #[test]
    fn restore_on_continue_migrates_legacy_path() {
        let workspace = TempDir::new().unwrap();
        let legacy = legacy_path(workspace.path());
        fs::create_dir_all(legacy.parent().unwrap()).unwrap();
        let config = MultiRepoConfig {
            enabled: true,
            mode: RepoMode::Monorepo,
            repositories: Repositories::default(),
            git_roots: vec![],
        };
        fs::write(&legacy, serde_json::to_string(&config).unwrap()).unwrap();

        let restored = restore_on_continue(workspace.path()).unwrap();
        assert_eq!(restored.mode, RepoMode::Monorepo);
        assert!(task_executor_path(workspace.path()).exists());
    }

    #[test]
    fn disabled_config_is_treated_as_absent() {
        let workspace = TempDir::new().unwrap();
        let path = task_executor_path(workspace.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let config = MultiRepoConfig {
            enabled: false,
            mode: RepoMode::Monorepo,
            repositories: Repositories::default(),
            git_roots: vec![],
        };
        fs::write(&path, serde_json::to_string(&config).unwrap()).unwrap();

        assert!(restore_on_continue(workspace.path()).is_none());
    }

    #[test]
    fn invalid_json_degrades_to_single_repo() {
        let workspace = TempDir::new().unwrap();
        let path = task_executor_path(workspace.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();

        assert!(restore_on_continue(workspace.path()).is_none());
    }

    #[test]
    fn no_config_present_is_single_repo() {
        let workspace = TempDir::new().unwrap();
        assert!(restore_on_continue(workspace.path()).is_none());
    }
}
