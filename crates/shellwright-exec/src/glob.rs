//! Post-run file harvesting with ordered include/exclude globs
//!
//! Patterns use `/` as the separator on every platform. `*` stops at a
//! separator while `**` crosses any number of them, including when it is
//! glued to other characters (`src/**.js`). A leading `!` turns a pattern
//! into an exclusion. Patterns are applied in order to every regular file
//! under the working directory, so exclusions should follow the inclusions
//! they trim.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::ExecError;

/// One compiled pattern
#[derive(Debug)]
struct Rule {
    exclude: bool,
    set: GlobSet,
}

impl Rule {
    fn parse(pattern: &str) -> Result<Self, ExecError> {
        let (exclude, body) = match pattern.strip_prefix('!') {
            Some(rest) => (true, rest),
            None => (false, pattern),
        };

        let mut builder = GlobSetBuilder::new();
        for alternative in expand_double_star(body) {
            let glob = GlobBuilder::new(&alternative)
                .literal_separator(true)
                .build()
                .map_err(|e| ExecError::Glob(format!("{pattern}: {e}")))?;
            builder.add(glob);
        }
        let set = builder
            .build()
            .map_err(|e| ExecError::Glob(format!("{pattern}: {e}")))?;
        Ok(Self { exclude, set })
    }
}

/// Rewrite `**` that is not a whole path component into forms globset
/// understands
///
/// `a**b` can match within one component (`a*b`) or across several
/// (`a*/**/*b`); every such occurrence doubles the alternatives.
fn expand_double_star(pattern: &str) -> Vec<String> {
    let pieces: Vec<&str> = pattern.split("**").collect();
    let mut alternatives = vec![pieces[0].to_string()];

    for window in pieces.windows(2) {
        let (before, after) = (window[0], window[1]);
        let left_bounded = before.is_empty() || before.ends_with('/');
        let right_bounded = after.is_empty() || after.starts_with('/');

        let choices: &[&str] = match (left_bounded, right_bounded) {
            (true, true) => &["**"],
            (true, false) => &["*", "**/*"],
            (false, true) => &["*", "*/**"],
            (false, false) => &["*", "*/**/*"],
        };

        alternatives = alternatives
            .iter()
            .flat_map(|prefix| choices.iter().map(move |c| format!("{prefix}{c}{after}")))
            .collect();
    }
    alternatives
}

/// Collect the files under `dir` selected by `patterns`
///
/// Keys are paths relative to `dir` joined with `/`; values are the full
/// local paths. Directories are never returned.
///
/// # Errors
/// Returns `ExecError::Glob` for an invalid pattern and `ExecError::IoError`
/// if the tree cannot be walked
pub fn harvest(dir: &Path, patterns: &[String]) -> Result<BTreeMap<String, PathBuf>, ExecError> {
    let rules = patterns
        .iter()
        .map(|p| Rule::parse(p))
        .collect::<Result<Vec<_>, _>>()?;

    let mut found = BTreeMap::new();
    for entry in WalkDir::new(dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| ExecError::IoError(e.to_string()))?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Some(key) = relative_key(dir, entry.path()) else {
            continue;
        };

        for rule in &rules {
            if !rule.set.is_match(&key) {
                continue;
            }
            if rule.exclude {
                found.remove(&key);
            } else {
                found.insert(key.clone(), entry.path().to_path_buf());
            }
        }
    }

    debug!(dir = %dir.display(), matched = found.len(), "harvested files");
    Ok(found)
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn tree(files: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for file in files {
            let path = dir.path().join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, file.as_bytes()).unwrap();
        }
        dir
    }

    fn keys(found: &BTreeMap<String, PathBuf>) -> Vec<&str> {
        found.keys().map(String::as_str).collect()
    }

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_include_then_exclude() {
        let dir = tree(&["assets/logo.svg", "src/index.js", "src/secret.js"]);
        let found = harvest(
            dir.path(),
            &patterns(&["assets/**", "src/**.js", "!**secret.*"]),
        )
        .unwrap();

        assert_eq!(keys(&found), vec!["assets/logo.svg", "src/index.js"]);
        assert_eq!(found["src/index.js"], dir.path().join("src/index.js"));
    }

    #[test]
    fn test_order_matters() {
        let dir = tree(&["a.txt", "b.txt"]);
        let found = harvest(dir.path(), &patterns(&["!a.txt", "*.txt"])).unwrap();
        assert_eq!(keys(&found), vec!["a.txt", "b.txt"]);
    }

    #[test]
    fn test_single_star_stays_in_component() {
        let dir = tree(&["top.js", "nested/deep.js"]);
        let found = harvest(dir.path(), &patterns(&["*.js"])).unwrap();
        assert_eq!(keys(&found), vec!["top.js"]);

        let found = harvest(dir.path(), &patterns(&["**.js"])).unwrap();
        assert_eq!(keys(&found), vec!["nested/deep.js", "top.js"]);
    }

    #[test]
    fn test_glued_double_star_crosses_directories() {
        let dir = tree(&["src/a.js", "src/x/y/b.js", "src/x/c.ts"]);
        let found = harvest(dir.path(), &patterns(&["src/**.js"])).unwrap();
        assert_eq!(keys(&found), vec!["src/a.js", "src/x/y/b.js"]);
    }

    #[test]
    fn test_directories_excluded() {
        let dir = tree(&["out/file"]);
        fs::create_dir_all(dir.path().join("out/empty")).unwrap();
        let found = harvest(dir.path(), &patterns(&["**"])).unwrap();
        assert_eq!(keys(&found), vec!["out/file"]);
    }

    #[test]
    fn test_invalid_pattern() {
        let dir = tree(&[]);
        let err = harvest(dir.path(), &patterns(&["src/[a"])).unwrap_err();
        assert!(matches!(err, ExecError::Glob(_)));
    }

    #[test]
    fn test_expansion() {
        assert_eq!(expand_double_star("assets/**"), vec!["assets/**"]);
        assert_eq!(
            expand_double_star("src/**.js"),
            vec!["src/*.js", "src/**/*.js"]
        );
        assert_eq!(expand_double_star("a**b"), vec!["a*b", "a*/**/*b"]);
        assert_eq!(expand_double_star("plain"), vec!["plain"]);
    }
}
