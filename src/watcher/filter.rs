//! Ignore-pattern matching for watched paths.
//!
//! Two complementary layers:
//! - glob patterns loaded from the VCS ignore file (fine filter, checked per
//!   event)
//! - explicit exclude prefixes (coarse filter, also applied at watch
//!   registration so excluded subtrees never consume watch descriptors)

use std::path::{Path, PathBuf};

use glob::Pattern;

use crate::debug_event;

/// Decides whether a filesystem path is relevant.
///
/// Loaded once at startup; read-only for the watcher's lifetime.
pub struct PathFilter {
    patterns: Vec<Pattern>,
    excludes: Vec<PathBuf>,
}

impl PathFilter {
    /// Load patterns from the ignore file inside `root` (missing file means
    /// no patterns) and normalize the exclude prefixes to absolute paths.
    ///
    /// Ignore-file syntax: one shell-glob pattern per line; blank lines and
    /// `#` comments are skipped. Unparseable patterns are logged and dropped.
    pub fn load(root: &Path, ignore_file: &str, exclude_paths: &[String]) -> Self {
        let mut patterns = Vec::new();
        let ignore_path = root.join(ignore_file);
        if let Ok(contents) = std::fs::read_to_string(&ignore_path) {
            for line in contents.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                patterns.extend(Self::anchor(root, line));
            }
            debug_event!(
                "filter",
                "loaded ignore patterns",
                "{} from {}",
                patterns.len(),
                ignore_path.display()
            );
        }

        let excludes = exclude_paths
            .iter()
            .map(|p| {
                let p = Path::new(p);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    root.join(p)
                }
            })
            .collect();

        Self { patterns, excludes }
    }

    /// Build a filter from raw pattern strings, anchored at `root`.
    pub fn from_patterns(root: &Path, raw: &[&str], exclude_paths: &[String]) -> Self {
        let patterns = raw.iter().flat_map(|p| Self::anchor(root, p)).collect();
        let excludes = exclude_paths.iter().map(|p| root.join(p)).collect();
        Self { patterns, excludes }
    }

    /// Anchor a raw ignore-file pattern to the watch root.
    ///
    /// Shell-glob matching runs against the full absolute path, so relative
    /// patterns get both a root-level and an any-depth anchored form. A
    /// trailing slash marks a directory pattern, which also ignores the
    /// directory's contents.
    fn anchor(root: &Path, raw: &str) -> Vec<Pattern> {
        let (body, is_dir) = match raw.strip_suffix('/') {
            Some(stripped) => (stripped, true),
            None => (raw, false),
        };

        let anchored: Vec<String> = if let Some(rooted) = body.strip_prefix('/') {
            vec![root.join(rooted).to_string_lossy().into_owned()]
        } else {
            vec![
                root.join(body).to_string_lossy().into_owned(),
                root.join("**").join(body).to_string_lossy().into_owned(),
            ]
        };

        let mut out = Vec::new();
        for base in anchored {
            match Pattern::new(&base) {
                Ok(p) => out.push(p),
                Err(e) => {
                    tracing::warn!("[filter] skipping unparseable ignore pattern {raw:?}: {e}");
                    continue;
                }
            }
            if is_dir {
                // contents of an ignored directory are ignored too
                if let Ok(p) = Pattern::new(&format!("{base}/**")) {
                    out.push(p);
                }
            }
        }
        out
    }

    /// True when any ignore pattern or exclude prefix matches `path`.
    /// Any match suffices; order does not matter. No side effects.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if self.is_excluded(path) {
            return true;
        }
        let text = path.to_string_lossy();
        self.patterns.iter().any(|p| p.matches(&text))
    }

    /// Coarse filter: true when `path` is inside an excluded prefix.
    /// Used at watch registration to skip whole subtrees.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.excludes.iter().any(|prefix| path.starts_with(prefix))
    }
}
