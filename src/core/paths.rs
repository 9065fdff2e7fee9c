//! Shared path manipulation utilities.

use std::env;
use std::path::{Component, Path, PathBuf};

/// Resolve a path to an absolute, normalized path.
///
/// If `fs::canonicalize` succeeds (path exists), it is used to resolve symlinks
/// and normalize components.
///
/// If it fails (e.g. path does not exist), the path is made absolute relative
/// to CWD and `..`/`.` components are resolved syntactically.
pub fn resolve_absolute_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
    };

    if let Ok(canonical) = std::fs::canonicalize(&absolute) {
        return canonical;
    }

    normalize_syntactic(&absolute)
}

fn normalize_syntactic(path: &Path) -> PathBuf {
    let mut components = Vec::new();
    for component in path.components() {
        match component {
            Component::Prefix(..) | Component::RootDir | Component::Normal(_) => {
                components.push(component);
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(Component::Normal(_)) = components.last() {
                    components.pop();
                }
            }
        }
    }
    components.into_iter().collect()
}

/// Flatten a path into a single filesystem-safe component.
///
/// Used for staged-write file names: the original's relative path must survive
/// as one flat name inside the staging area, with no separators or traversal
/// components left.
#[must_use]
pub fn sanitize_for_flat_name(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if let Component::Normal(part) = component {
            if !out.is_empty() {
                out.push('_');
            }
            for ch in part.to_string_lossy().chars() {
                if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' || ch == '_' {
                    out.push(ch);
                } else {
                    out.push('_');
                }
            }
        }
    }
    if out.is_empty() {
        out.push_str("unnamed");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_path_unchanged_when_normalized() {
        let p = Path::new("/a/b/c");
        assert_eq!(normalize_syntactic(p), PathBuf::from("/a/b/c"));
    }

    #[test]
    fn parent_components_are_resolved() {
        let p = Path::new("/a/b/../c/./d");
        assert_eq!(normalize_syntactic(p), PathBuf::from("/a/c/d"));
    }

    #[test]
    fn relative_path_becomes_absolute() {
        let resolved = resolve_absolute_path(Path::new("some/relative/path"));
        assert!(resolved.is_absolute());
    }

    #[test]
    fn sanitize_flattens_separators() {
        assert_eq!(
            sanitize_for_flat_name(Path::new("records/2024/scan.dcm")),
            "records_2024_scan.dcm"
        );
    }

    #[test]
    fn sanitize_drops_traversal_components() {
        let name = sanitize_for_flat_name(Path::new("../../etc/passwd"));
        assert_eq!(name, "etc_passwd");
        assert!(!name.contains(".."));
    }

    #[test]
    fn sanitize_replaces_unsafe_characters() {
        let name = sanitize_for_flat_name(Path::new("a b/c:d"));
        assert_eq!(name, "a_b_c_d");
    }

    #[test]
    fn sanitize_of_empty_path_is_stable() {
        assert_eq!(sanitize_for_flat_name(Path::new("")), "unnamed");
    }
}
