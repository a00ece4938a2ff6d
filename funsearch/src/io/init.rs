//! Scaffolding for `funsearch init`: a default config and a seed program.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::io::config::{CONFIG_FILE, SearchConfig, write_config};
use crate::io::generator::catalog_source;

/// Default seed program file name.
pub const SEED_FILE: &str = "seed.py";

/// Behavior written as the starting seed.
const SEED_BEHAVIOR: &str = "flee";

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub config_path: PathBuf,
    pub seed_path: PathBuf,
}

impl ProjectPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config_path: root.join(CONFIG_FILE),
            seed_path: root.join(SEED_FILE),
            root,
        }
    }
}

/// Options for `init_project`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config and seed.
    pub force: bool,
}

/// Write `funsearch.toml` and `seed.py` into `root`.
///
/// Fails if either file exists unless `options.force` is set.
pub fn init_project(root: &Path, options: &InitOptions) -> Result<ProjectPaths> {
    let paths = ProjectPaths::new(root);
    if !options.force {
        for path in [&paths.config_path, &paths.seed_path] {
            if path.exists() {
                return Err(anyhow!(
                    "funsearch init: {} already exists (use --force to overwrite)",
                    path.display()
                ));
            }
        }
    }

    fs::create_dir_all(&paths.root)
        .with_context(|| format!("create directory {}", paths.root.display()))?;
    write_config(&paths.config_path, &SearchConfig::default())?;
    let seed = catalog_source(SEED_BEHAVIOR)
        .ok_or_else(|| anyhow!("built-in behavior `{SEED_BEHAVIOR}` is missing"))?;
    fs::write(&paths.seed_path, seed)
        .with_context(|| format!("write file {}", paths.seed_path.display()))?;

    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_writes_loadable_config_and_seed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");

        assert_eq!(
            load_config(&paths.config_path).expect("load"),
            SearchConfig::default()
        );
        let seed = fs::read_to_string(&paths.seed_path).expect("seed");
        assert!(seed.contains("def mice_behavior"));
    }

    #[test]
    fn init_without_force_refuses_existing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_project(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_project(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_seed() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_project(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.seed_path, "custom").expect("write custom");

        init_project(temp.path(), &InitOptions { force: true }).expect("re-init");
        let seed = fs::read_to_string(&paths.seed_path).expect("seed");
        assert_eq!(Some(seed.as_str()), catalog_source(SEED_BEHAVIOR));
    }
}
