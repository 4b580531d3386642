//! Bind-mount parsing and composition
//!
//! Parses `src:dst[:ro]` bind specs, tilde-expanding `src`. A writable
//! bind creates a missing source directory; a read-only bind requires
//! the source to already exist.

use std::path::PathBuf;

use crate::error::{DaemonError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: String,
    pub read_only: bool,
}

/// Parse and materialize every bind spec, preserving the raw strings so
/// a restart-recreate can reproduce them exactly.
pub fn compose(binds: &[String]) -> Result<Vec<BindMount>> {
    binds.iter().map(|spec| parse_one(spec)).collect()
}

fn parse_one(spec: &str) -> Result<BindMount> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    let (src, dst, read_only) = match parts.as_slice() {
        [src, dst] => (*src, *dst, false),
        [src, dst, "ro"] => (*src, *dst, true),
        [src, dst, "rw"] => (*src, *dst, false),
        _ => {
            return Err(DaemonError::InvalidArgument(format!(
                "malformed bind mount spec: {spec}"
            )))
        }
    };

    if dst.is_empty() {
        return Err(DaemonError::InvalidArgument(format!("malformed bind mount spec: {spec}")));
    }

    let source = expand_tilde(src);

    if read_only {
        if !source.exists() {
            return Err(DaemonError::InvalidArgument(format!(
                "read-only bind source does not exist: {}",
                source.display()
            )));
        }
    } else if !source.exists() {
        std::fs::create_dir_all(&source)?;
    }

    Ok(BindMount { source, destination: dst.to_string(), read_only })
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    } else if path == "~" {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parses_rw_bind_and_creates_missing_source() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("data");
        let spec = format!("{}:/data", src.display());

        let mounts = compose(&[spec]).unwrap();
        assert_eq!(mounts.len(), 1);
        assert!(!mounts[0].read_only);
        assert!(src.exists());
    }

    #[test]
    fn ro_bind_requires_existing_source() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope");
        let spec = format!("{}:/data:ro", missing.display());

        let err = compose(&[spec]).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_malformed_spec() {
        let err = compose(&["justasrc".to_string()]).unwrap_err();
        assert!(matches!(err, DaemonError::InvalidArgument(_)));
    }
}
