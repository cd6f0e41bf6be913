//! Skill and rule catalogs, loaded from layered directories.
//!
//! Definitions are plain `.md` or `.txt` files. Three layers are searched in
//! order, later layers shadowing earlier ones by file stem: configured extra
//! roots, the per-user `~/.shoestring` directory, then the project's own
//! `.shoestring` directory. A project can therefore override a user-wide
//! skill just by shipping a file with the same name.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shoestring_core::{runtime_dir, truncate_chars};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const DESCRIPTION_MAX_CHARS: usize = 120;

/// Executor prompt used when no skill in the catalog matches a subtask.
pub const GENERIC_SKILL_PROMPT: &str = "You are a careful software engineer. \
Make the smallest change that satisfies the task. Prefer editing existing \
files over rewriting them, and preserve the surrounding style of any file \
you touch.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// File stem, unique per catalog.
    pub name: String,
    /// First heading or first non-empty line of the file.
    pub description: String,
    pub body: String,
    pub path: PathBuf,
}

/// A name-keyed set of definitions from one load pass.
#[derive(Debug, Clone, Default)]
pub struct DefCatalog {
    entries: BTreeMap<String, Definition>,
}

impl DefCatalog {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, name: &str) -> Option<&Definition> {
        self.entries.get(name)
    }

    /// Entries in stable name order.
    pub fn iter(&self) -> impl Iterator<Item = &Definition> {
        self.entries.values()
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Search roots for skills, least specific first.
pub fn skill_roots(workspace: &Path, extra: &[String]) -> Vec<PathBuf> {
    layer_roots(workspace, extra, "skills")
}

/// Search roots for rules, least specific first.
pub fn rule_roots(workspace: &Path, extra: &[String]) -> Vec<PathBuf> {
    layer_roots(workspace, extra, "rules")
}

fn layer_roots(workspace: &Path, extra: &[String], kind: &str) -> Vec<PathBuf> {
    let mut roots = Vec::new();
    for raw in extra {
        let path = Path::new(raw);
        if path.is_absolute() {
            roots.push(path.to_path_buf());
        } else {
            roots.push(workspace.join(path));
        }
    }
    if let Some(home) = std::env::home_dir() {
        roots.push(home.join(".shoestring").join(kind));
    }
    roots.push(runtime_dir(workspace).join(kind));
    roots
}

/// Load every definition under the given roots. Later roots shadow earlier
/// ones when two files share a stem. Missing roots are skipped, a root that
/// exists but cannot be walked is not an error either; unreadable individual
/// files are.
pub fn load_catalog(roots: &[PathBuf]) -> Result<DefCatalog> {
    let mut entries = BTreeMap::new();
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            let path = entry.path();
            if !path.is_file() || !has_definition_extension(path) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(path)?;
            entries.insert(
                name.to_string(),
                Definition {
                    name: name.to_string(),
                    description: describe(&body, name),
                    body,
                    path: path.to_path_buf(),
                },
            );
        }
    }
    Ok(DefCatalog { entries })
}

fn has_definition_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("md") | Some("txt")
    )
}

fn describe(body: &str, fallback: &str) -> String {
    let line = body
        .lines()
        .find(|line| line.trim_start().starts_with('#'))
        .map(|line| line.trim_start_matches('#').trim())
        .filter(|line| !line.is_empty())
        .or_else(|| {
            body.lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
        })
        .unwrap_or(fallback);
    truncate_chars(line, DESCRIPTION_MAX_CHARS).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, body).expect("write");
    }

    #[test]
    fn later_roots_shadow_earlier_ones() {
        let dir = tempfile::tempdir().expect("tempdir");
        let user = dir.path().join("user");
        let project = dir.path().join("project");
        write(&user, "python-style.md", "# User-wide python style\nuser body");
        write(&user, "testing.md", "# Testing habits\nbody");
        write(&project, "python-style.md", "# Project python style\nproject body");

        let catalog = load_catalog(&[user, project]).expect("load");
        assert_eq!(catalog.len(), 2);
        let def = catalog.get("python-style").expect("entry");
        assert_eq!(def.description, "Project python style");
        assert!(def.body.contains("project body"));
    }

    #[test]
    fn description_falls_back_to_first_non_empty_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "no-heading.txt", "\n\nAlways run the linter.\nmore");
        let catalog = load_catalog(&[dir.path().to_path_buf()]).expect("load");
        assert_eq!(
            catalog.get("no-heading").expect("entry").description,
            "Always run the linter."
        );
    }

    #[test]
    fn non_definition_files_are_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "skill.md", "# Real skill");
        write(dir.path(), "notes.json", "{}");
        write(dir.path(), "script.py", "print()");
        let catalog = load_catalog(&[dir.path().to_path_buf()]).expect("load");
        assert_eq!(catalog.names(), vec!["skill"]);
    }

    #[test]
    fn missing_roots_load_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let catalog = load_catalog(&[dir.path().join("nope")]).expect("load");
        assert!(catalog.is_empty());
    }

    #[test]
    fn nested_directories_are_walked() {
        let dir = tempfile::tempdir().expect("tempdir");
        write(dir.path(), "backend/django.md", "# Django conventions\nbody");
        let catalog = load_catalog(&[dir.path().to_path_buf()]).expect("load");
        assert!(catalog.get("django").is_some());
    }
}
