//! Executable resolution: PATH search in the process that will exec.

use std::env;
use std::path::{Path, PathBuf};

/// Resolves `program` the way exec would: a name containing a path separator
/// is used as-is, anything else is searched on `PATH`.  On Windows-class
/// systems an `.exe` suffix is probed when the bare name is not found.
pub fn resolve_executable(program: &str, path_override: Option<&str>) -> Option<PathBuf> {
    if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
        let candidate = PathBuf::from(program);
        return is_executable(&candidate).then_some(candidate);
    }

    let path_var = match path_override {
        Some(value) => value.to_string(),
        None => env::var("PATH").unwrap_or_default(),
    };

    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }

    #[cfg(windows)]
    if !program.to_ascii_lowercase().ends_with(".exe") {
        return resolve_executable(&format!("{program}.exe"), path_override);
    }

    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn bare_names_are_found_on_path() {
        let resolved = resolve_executable("sh", None).expect("sh on PATH");
        assert!(resolved.is_absolute());
    }

    #[test]
    fn absolute_paths_bypass_the_search() {
        assert_eq!(
            resolve_executable("/bin/sh", None),
            Some(PathBuf::from("/bin/sh"))
        );
    }

    #[test]
    fn missing_programs_resolve_to_none() {
        assert_eq!(resolve_executable("forker-does-not-exist", None), None);
    }

    #[test]
    fn path_override_wins_over_process_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("onlyhere");
        fs::write(&tool, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();

        let found =
            resolve_executable("onlyhere", Some(dir.path().to_str().unwrap()));
        assert_eq!(found, Some(tool));
        assert_eq!(resolve_executable("onlyhere", Some("/usr/bin")), None);
    }

    #[test]
    fn non_executable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("data");
        fs::write(&plain, "not a program").unwrap();
        fs::set_permissions(&plain, fs::Permissions::from_mode(0o644)).unwrap();
        assert_eq!(
            resolve_executable("data", Some(dir.path().to_str().unwrap())),
            None
        );
    }
}
