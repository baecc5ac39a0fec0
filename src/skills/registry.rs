//! Skill Registry: on-demand scan of installed-skill directories.
//!
//! A register/list-by-name registry, generalized from compiled-in tools
//! to on-disk TOML manifests. No caching daemon: each call re-scans the configured
//! directory, so a skill dropped into place is discoverable without a
//! restart.

use std::path::{Path, PathBuf};

use super::manifest::SkillManifest;

/// One discovered skill: its manifest plus the directory it lives in
/// (needed to locate its virtualenv interpreter and `run.py`).
#[derive(Debug, Clone)]
pub struct InstalledSkill {
    pub manifest: SkillManifest,
    pub dir: PathBuf,
}

impl InstalledSkill {
    /// Name as declared in the manifest, used for planner-facing
    /// summaries and `allowed_skills` matching.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.manifest.kiso.name
    }

    /// Path to the skill's `run.py` entry point.
    #[must_use]
    pub fn entrypoint(&self) -> PathBuf {
        self.dir.join("run.py")
    }

    /// Path to the skill's virtualenv Python interpreter.
    #[must_use]
    pub fn interpreter(&self) -> PathBuf {
        self.dir.join(".venv").join("bin").join("python")
    }
}

/// Scans `root` for immediate subdirectories containing a `manifest.toml`.
pub struct SkillRegistry {
    root: PathBuf,
}

impl SkillRegistry {
    /// Construct a registry rooted at `root` (typically `config.paths.skills_dir`).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scan `root` and return every directory with a valid manifest.
    /// Directories with a malformed manifest are skipped with a warning
    /// rather than failing the whole scan.
    #[must_use]
    pub fn scan(&self) -> Vec<InstalledSkill> {
        let mut found = Vec::new();
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(dir = %self.root.display(), error = %e, "skills directory unreadable");
                return found;
            }
        };
        for entry in entries.flatten() {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            match Self::load_one(&dir) {
                Ok(skill) => found.push(skill),
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "skipping invalid skill manifest");
                }
            }
        }
        found.sort_by(|a, b| a.name().cmp(b.name()));
        found
    }

    fn load_one(dir: &Path) -> anyhow::Result<InstalledSkill> {
        let manifest_path = dir.join("manifest.toml");
        let contents = std::fs::read_to_string(&manifest_path)?;
        let manifest: SkillManifest = toml::from_str(&contents)?;
        Ok(InstalledSkill { manifest, dir: dir.to_path_buf() })
    }

    /// Look up one skill by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<InstalledSkill> {
        self.scan().into_iter().find(|s| s.name() == name)
    }

    /// Summaries suitable for planner context assembly: `(name, summary,
    /// args schema)` restricted to `allowed`, unless `allowed` is `None`
    /// (admin callers see every installed skill).
    #[must_use]
    pub fn allowed_summaries(&self, allowed: Option<&[String]>) -> Vec<InstalledSkill> {
        let all = self.scan();
        match allowed {
            None => all,
            Some(names) => all.into_iter().filter(|s| names.iter().any(|n| n == s.name())).collect(),
        }
    }
}
