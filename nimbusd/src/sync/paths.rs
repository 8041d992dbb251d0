use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path must start with '/'")]
    Relative,
    #[error("remote path contains an empty component")]
    EmptyComponent,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
}

/// Syntax rules applied to every container-scoped path before it reaches the
/// coordinator. A trailing separator is allowed and denotes a directory.
pub fn validate(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(PathError::Relative);
    }
    let trimmed = path.strip_suffix('/').unwrap_or(path);
    if trimmed.is_empty() {
        // "/" addresses the container root itself
        return Ok(());
    }
    for part in trimmed[1..].split('/') {
        if part.is_empty() {
            return Err(PathError::EmptyComponent);
        }
        if part == "." || part == ".." {
            return Err(PathError::UnsupportedComponent);
        }
    }
    Ok(())
}

pub fn denotes_directory(path: &str) -> bool {
    path.ends_with('/')
}

/// Join a container-relative path onto the container's remote root.
pub fn join_remote(root: &str, relative: &str) -> String {
    let root = root.trim_end_matches('/');
    let relative = relative.trim_end_matches('/');
    if relative.is_empty() {
        return root.to_string();
    }
    format!("{root}{relative}")
}

/// Container-relative view of an absolute remote path.
pub fn relative_to(root: &str, absolute: &str) -> String {
    let root = root.trim_end_matches('/');
    match absolute.strip_prefix(root) {
        Some(rest) if rest.is_empty() => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => absolute.to_string(),
    }
}

/// Remote paths are POSIX-like ("/Docs/A.txt"); map them under the local
/// materialized tree.
pub fn materialized_path_for(data_root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    validate(remote_path)?;
    let mut out = data_root.to_path_buf();
    for component in Path::new(remote_path.trim_end_matches('/')).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir => continue,
            Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_file_path() {
        assert!(validate("/Docs/A.txt").is_ok());
    }

    #[test]
    fn accepts_trailing_slash_for_directories() {
        assert!(validate("/Docs/").is_ok());
        assert!(denotes_directory("/Docs/"));
        assert!(!denotes_directory("/Docs/A.txt"));
    }

    #[test]
    fn rejects_relative_and_empty_paths() {
        assert!(matches!(validate(""), Err(PathError::Empty)));
        assert!(matches!(validate("Docs/A.txt"), Err(PathError::Relative)));
    }

    #[test]
    fn rejects_dot_components_and_doubled_separators() {
        assert!(matches!(
            validate("/Docs/../secret"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            validate("/Docs/./A.txt"),
            Err(PathError::UnsupportedComponent)
        ));
        assert!(matches!(
            validate("/Docs//A.txt"),
            Err(PathError::EmptyComponent)
        ));
    }

    #[test]
    fn joins_and_relativizes_against_container_root() {
        let root = "/containers/notes";
        assert_eq!(join_remote(root, "/Docs/A.txt"), "/containers/notes/Docs/A.txt");
        assert_eq!(join_remote(root, "/"), "/containers/notes");
        assert_eq!(relative_to(root, "/containers/notes/Docs/A.txt"), "/Docs/A.txt");
        assert_eq!(relative_to(root, "/containers/notes"), "/");
    }

    #[test]
    fn maps_remote_path_under_data_root() {
        let root = PathBuf::from("/data");
        let mapped = materialized_path_for(&root, "/Docs/A.txt").unwrap();
        assert_eq!(mapped, PathBuf::from("/data/Docs/A.txt"));
    }

    #[test]
    fn mapping_rejects_parent_dir() {
        let root = PathBuf::from("/data");
        assert!(matches!(
            materialized_path_for(&root, "/../secret"),
            Err(PathError::UnsupportedComponent)
        ));
    }
}
