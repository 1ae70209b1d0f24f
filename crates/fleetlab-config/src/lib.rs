pub mod error;
pub mod schema;

pub use error::*;
pub use schema::*;

use std::path::PathBuf;

pub const ENV_CONFIG_PATH: &str = "FLEETLAB_CONFIG_PATH";

const CANDIDATES: [&str; 2] = ["fleetlab.local.yaml", "fleetlab.yaml"];

/// fleetlab's per-user configuration directory, created on first use
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("fleetlab");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// Default location of provider SSH keys
pub fn default_key_dir() -> Result<PathBuf> {
    Ok(get_config_dir()?.join("keys"))
}

/// Finds the configuration file.
///
/// Search order:
/// 1. `FLEETLAB_CONFIG_PATH`
/// 2. current directory: fleetlab.local.yaml, fleetlab.yaml
/// 3. ./.fleetlab/config.yaml
/// 4. ~/.config/fleetlab/config.yaml
pub fn find_config_file() -> Result<PathBuf> {
    if let Ok(config_path) = std::env::var(ENV_CONFIG_PATH) {
        let path = PathBuf::from(config_path);
        if path.exists() {
            return Ok(path);
        }
    }

    let current_dir = std::env::current_dir()?;

    for filename in &CANDIDATES {
        let path = current_dir.join(filename);
        if path.exists() {
            return Ok(path);
        }
    }

    let project_config = current_dir.join(".fleetlab").join("config.yaml");
    if project_config.exists() {
        return Ok(project_config);
    }

    if let Some(config_dir) = dirs::config_dir() {
        let global_config = config_dir.join("fleetlab").join("config.yaml");
        if global_config.exists() {
            return Ok(global_config);
        }
    }

    Err(ConfigError::ConfigFileNotFound)
}

/// Loads the discovered file (or defaults when there is none), applies the
/// environment overrides and validates the result
pub fn load() -> Result<FleetlabConfig> {
    let mut config = match find_config_file() {
        Ok(path) => FleetlabConfig::from_file(&path)?,
        Err(ConfigError::ConfigFileNotFound) => FleetlabConfig::default(),
        Err(e) => return Err(e),
    };
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    fn in_dir<F: FnOnce()>(dir: &std::path::Path, f: F) {
        let original_dir = std::env::current_dir().unwrap();
        std::env::set_current_dir(dir).unwrap();
        temp_env::with_vars_unset([ENV_CONFIG_PATH, ENV_BACKEND, ENV_PROJECT, ENV_OWNER], f);
        std::env::set_current_dir(original_dir).unwrap();
    }

    #[test]
    #[serial]
    fn test_find_config_in_current_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("fleetlab.yaml"), "{}").unwrap();

        in_dir(temp_dir.path(), || {
            let found = find_config_file().unwrap();
            assert!(found.ends_with("fleetlab.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_local_file_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("fleetlab.yaml"), "{}").unwrap();
        fs::write(temp_dir.path().join("fleetlab.local.yaml"), "{}").unwrap();

        in_dir(temp_dir.path(), || {
            let found = find_config_file().unwrap();
            assert!(found.ends_with("fleetlab.local.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_find_config_in_project_dir() {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_dir = temp_dir.path().join(".fleetlab");
        fs::create_dir(&project_dir).unwrap();
        fs::write(project_dir.join("config.yaml"), "{}").unwrap();

        in_dir(temp_dir.path(), || {
            let found = find_config_file().unwrap();
            assert!(found.ends_with(".fleetlab/config.yaml"));
        });
    }

    #[test]
    #[serial]
    fn test_env_path_wins() {
        let temp_dir = tempfile::tempdir().unwrap();
        let custom = temp_dir.path().join("custom.yaml");
        fs::write(&custom, "backend:\n  type: aws\n").unwrap();
        fs::write(temp_dir.path().join("fleetlab.yaml"), "{}").unwrap();

        in_dir(temp_dir.path(), || {
            temp_env::with_var(ENV_CONFIG_PATH, Some(&custom), || {
                assert_eq!(find_config_file().unwrap(), custom);
                assert_eq!(load().unwrap().backend.kind, "aws");
            });
        });
    }

    #[test]
    #[serial]
    fn test_load_without_file_uses_defaults() {
        let temp_dir = tempfile::tempdir().unwrap();

        in_dir(temp_dir.path(), || {
            // a global config on the test machine would be picked up instead
            if let Ok(path) = find_config_file() {
                assert!(!path.starts_with(temp_dir.path()));
                return;
            }
            let config = load().unwrap();
            assert_eq!(config.backend.kind, "docker");
            assert_eq!(config.source, None);
        });
    }

    #[test]
    #[serial]
    fn test_load_rejects_invalid_backend() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("fleetlab.yaml"), "backend:\n  type: azure\n").unwrap();

        in_dir(temp_dir.path(), || {
            assert!(matches!(load(), Err(ConfigError::Invalid(_))));
        });
    }
}
