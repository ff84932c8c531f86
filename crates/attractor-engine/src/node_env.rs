use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STAGE_STATUS_PATH_VAR: &str = "STAGE_STATUS_PATH";
pub const STAGE_STATUS_FALLBACK_PATH_VAR: &str = "STAGE_STATUS_FALLBACK_PATH";

/// Environment keys that must never leak into stage subprocesses.
pub const DEFAULT_STRIP_KEYS: &[&str] = &["CLAUDECODE"];

const TOOLCHAIN_KEYS: &[&str] = &[
    "HOME",
    "CARGO_HOME",
    "RUSTUP_HOME",
    "GOPATH",
    "GOMODCACHE",
    "CARGO_TARGET_DIR",
];

/// Base environment for a stage subprocess. Composed once per attempt:
/// inherited process env minus the strip list, toolchain variables pinned
/// through, worktree-local artifact dirs, and the status-contract paths.
#[derive(Clone, Debug, Default)]
pub struct NodeEnvironment {
    vars: BTreeMap<String, String>,
    /// Relative paths normalized to absolute, recorded for the invocation
    /// artifact.
    pub path_overrides: BTreeMap<String, String>,
}

impl NodeEnvironment {
    pub fn base(worktree_dir: &Path, stage_logs_dir: &Path, strip_keys: &[String]) -> Self {
        let mut vars: BTreeMap<String, String> = std::env::vars()
            .filter(|(key, _)| {
                !strip_keys.iter().any(|s| s.eq_ignore_ascii_case(key))
                    && !DEFAULT_STRIP_KEYS
                        .iter()
                        .any(|s| s.eq_ignore_ascii_case(key))
            })
            .collect();

        let mut path_overrides = BTreeMap::new();

        for key in TOOLCHAIN_KEYS {
            if let Some(value) = vars.get(*key) {
                if let Some(absolute) = normalize_to_absolute(value) {
                    if absolute != *value {
                        path_overrides.insert((*key).to_string(), absolute.clone());
                        vars.insert((*key).to_string(), absolute);
                    }
                }
            }
        }

        // Build artifacts stay inside the worktree so checkpoint excludes
        // can keep them out of commits.
        vars.entry("CARGO_TARGET_DIR".to_string())
            .or_insert_with(|| worktree_dir.join(".cargo-target").display().to_string());

        vars.insert(
            STAGE_STATUS_PATH_VAR.to_string(),
            stage_logs_dir.join("status.json").display().to_string(),
        );

        Self {
            vars,
            path_overrides,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) {
        self.vars.remove(key);
    }

    /// Isolated HOME and XDG dirs for providers that persist global state
    /// (codex), while toolchain pins stay pointed at the real caches.
    pub fn isolate_home(&mut self, isolated_home: &Path) {
        let pinned: Vec<(String, String)> = TOOLCHAIN_KEYS
            .iter()
            .filter(|k| **k != "HOME")
            .filter_map(|k| self.vars.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect();

        let home = isolated_home.display().to_string();
        self.vars.insert("HOME".to_string(), home.clone());
        self.vars
            .insert("XDG_CONFIG_HOME".to_string(), format!("{home}/.config"));
        self.vars
            .insert("XDG_DATA_HOME".to_string(), format!("{home}/.local/share"));
        self.vars
            .insert("XDG_CACHE_HOME".to_string(), format!("{home}/.cache"));
        self.path_overrides.insert("HOME".to_string(), home);

        for (key, value) in pinned {
            self.vars.insert(key, value);
        }
    }

    pub fn vars(&self) -> &BTreeMap<String, String> {
        &self.vars
    }

    pub fn apply_to(&self, cmd: &mut tokio::process::Command) {
        cmd.env_clear();
        for (key, value) in &self.vars {
            cmd.env(key, value);
        }
    }
}

fn normalize_to_absolute(value: &str) -> Option<String> {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return Some(value.to_string());
    }
    std::env::current_dir()
        .ok()
        .map(|cwd| cwd.join(path).display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn base_env_strips_claudecode_and_exports_status_path() {
        let temp = TempDir::new().expect("temp dir should create");
        std::env::set_var("CLAUDECODE", "1");
        let env = NodeEnvironment::base(temp.path(), &temp.path().join("logs/impl"), &[]);
        std::env::remove_var("CLAUDECODE");

        assert_eq!(env.get("CLAUDECODE"), None);
        assert!(env
            .get(STAGE_STATUS_PATH_VAR)
            .expect("status path should be exported")
            .ends_with("impl/status.json"));
    }

    #[test]
    fn base_env_pins_cargo_target_inside_worktree_when_unset() {
        let temp = TempDir::new().expect("temp dir should create");
        std::env::remove_var("CARGO_TARGET_DIR");
        let env = NodeEnvironment::base(temp.path(), &temp.path().join("logs/impl"), &[]);
        assert!(env
            .get("CARGO_TARGET_DIR")
            .expect("CARGO_TARGET_DIR should be set")
            .contains(".cargo-target"));
    }

    #[test]
    fn isolate_home_keeps_toolchain_pins() {
        let temp = TempDir::new().expect("temp dir should create");
        let mut env = NodeEnvironment::base(temp.path(), &temp.path().join("logs/n"), &[]);
        env.set("CARGO_HOME", "/opt/cargo");
        let isolated = temp.path().join("codex-home");
        env.isolate_home(&isolated);

        assert_eq!(env.get("HOME"), Some(isolated.display().to_string().as_str()));
        assert_eq!(env.get("CARGO_HOME"), Some("/opt/cargo"));
        assert!(env.get("XDG_CONFIG_HOME").expect("xdg").starts_with(&isolated.display().to_string()));
        assert!(env.path_overrides.contains_key("HOME"));
    }

    #[test]
    fn custom_strip_keys_removed_case_insensitively() {
        let temp = TempDir::new().expect("temp dir should create");
        std::env::set_var("MY_WRAPPER_FLAG", "1");
        let env = NodeEnvironment::base(
            temp.path(),
            &temp.path().join("logs/n"),
            &["my_wrapper_flag".to_string()],
        );
        std::env::remove_var("MY_WRAPPER_FLAG");
        assert_eq!(env.get("MY_WRAPPER_FLAG"), None);
    }
}
