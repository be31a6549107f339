use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("path escapes its allowed root: {0}")]
    Escapes(PathBuf),
    #[error("io error canonicalizing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Canonicalizes `candidate` and verifies it is contained under `root`
/// (itself canonicalized). Used to enforce the sandbox's filesystem
/// permission boundaries (`readPaths`/`writePaths`).
pub fn canonicalize_under(root: &Path, candidate: &Path) -> Result<PathBuf, PathError> {
    let root = root
        .canonicalize()
        .map_err(|source| PathError::Io {
            path: root.to_path_buf(),
            source,
        })?;
    let resolved = candidate.canonicalize().map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            PathError::NotFound(candidate.to_path_buf())
        } else {
            PathError::Io {
                path: candidate.to_path_buf(),
                source,
            }
        }
    })?;
    if resolved.starts_with(&root) {
        Ok(resolved)
    } else {
        Err(PathError::Escapes(resolved))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_path_outside_root() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let err = canonicalize_under(root.path(), outside.path()).unwrap_err();
        assert!(matches!(err, PathError::Escapes(_)));
    }

    #[test]
    fn accepts_path_inside_root() {
        let root = tempfile::tempdir().unwrap();
        let nested = root.path().join("inner");
        std::fs::create_dir(&nested).unwrap();
        let resolved = canonicalize_under(root.path(), &nested).unwrap();
        assert!(resolved.starts_with(root.path().canonicalize().unwrap()));
    }

    #[test]
    fn missing_path_reports_not_found() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("does-not-exist");
        let err = canonicalize_under(root.path(), &missing).unwrap_err();
        assert!(matches!(err, PathError::NotFound(_)));
    }
}
