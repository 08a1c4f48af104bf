use anyhow::{Context, Result, bail};
/// Plugin executable discovery
///
/// Registry entries name an executable in one of three ways:
/// - an absolute path
/// - a path relative to the registry file (anything containing a separator)
/// - a bare command name, looked up on PATH
use std::path::{Path, PathBuf};

/// Resolve a registry `executable` value to a runnable file
pub fn resolve_executable(raw: &str, base_dir: &Path) -> Result<PathBuf> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("executable is empty");
    }

    let candidate = Path::new(raw);
    let looks_like_path = candidate.is_absolute() || candidate.components().count() > 1;

    let path = if looks_like_path {
        let joined = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            base_dir.join(candidate)
        };
        if !joined.is_file() {
            bail!("{} does not exist", joined.display());
        }
        joined
    } else {
        let local = base_dir.join(candidate);
        if local.is_file() {
            local
        } else {
            which::which(raw)
                .with_context(|| format!("'{raw}' not found next to the registry or on PATH"))?
        }
    };

    if !validate_plugin(&path)? {
        bail!("{} is not executable", path.display());
    }

    Ok(path)
}

/// Validate that a plugin binary can be executed
pub fn validate_plugin(path: &Path) -> Result<bool> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        Ok(metadata.is_file() && metadata.permissions().mode() & 0o111 != 0)
    }

    #[cfg(not(unix))]
    {
        Ok(metadata.is_file())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_bare_name_prefers_file_next_to_registry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pricing-plugin");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        make_executable(&path);

        let resolved = resolve_executable("pricing-plugin", dir.path()).unwrap();
        assert_eq!(resolved, path);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain.txt");
        fs::write(&path, "not a program").unwrap();

        let err = resolve_executable("./plain.txt", dir.path()).unwrap_err();
        assert!(err.to_string().contains("not executable"));
    }

    #[cfg(unix)]
    #[test]
    fn test_bare_name_falls_back_to_path() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_executable("sh", dir.path()).unwrap();
        assert!(resolved.ends_with("sh"));
    }

    #[test]
    fn test_missing_relative_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_executable("bin/missing", dir.path()).unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }
}
