//! Run directory naming and layout.

use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

use crate::error::{InstallError, Result};

/// Directory under `<run_root>/<flow>` holding install metadata.
pub const INSTALL_DIR: &str = "_cylc-install";
/// Symlink inside [`INSTALL_DIR`] pointing at the source directory.
pub const SOURCE_LINK: &str = "source";
/// Symlink to the most recent numbered run.
pub const RUN_N: &str = "runN";

/// Names that may not appear at the top of a source directory: they are
/// created by running the workflow.
pub const RESERVED_DIRS: &[&str] = &["log", "share", "work", INSTALL_DIR];

pub const FLOW_FILE: &str = "flow.cylc";
pub const SUITE_RC: &str = "suite.rc";

pub fn validate_flow_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(InstallError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.trim().is_empty() {
        return invalid("empty");
    }
    if name.chars().any(char::is_whitespace) {
        return invalid("contains whitespace");
    }
    if name.starts_with('-') || name.starts_with('.') {
        return invalid("cannot start with '-' or '.'");
    }
    let path = Path::new(name);
    if path.is_absolute() {
        return invalid("cannot be an absolute path");
    }
    if path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return invalid("cannot contain '.' or '..' components");
    }
    Ok(())
}

/// Number for the next `run<N>` directory under `flow_dir`.
pub fn next_run_number(flow_dir: &Path) -> io::Result<u32> {
    let entries = match fs::read_dir(flow_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(1),
        Err(e) => return Err(e),
    };
    let mut max = 0;
    for entry in entries {
        let name = entry?.file_name();
        if let Some(n) = name
            .to_str()
            .and_then(|n| n.strip_prefix("run"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            max = max.max(n);
        }
    }
    Ok(max + 1)
}

/// Point `<flow_dir>/runN` at `run<number>`.
pub fn link_run_n(flow_dir: &Path, number: u32) -> io::Result<PathBuf> {
    let link = flow_dir.join(RUN_N);
    if link.symlink_metadata().is_ok() {
        fs::remove_file(&link)?;
    }
    symlink(format!("run{number}"), &link)?;
    Ok(link)
}

/// Check the source holds a workflow definition and nothing reserved.
///
/// A lone `suite.rc` gets a `flow.cylc` symlink; returns whether one was
/// created.
pub fn prepare_source(source: &Path) -> Result<bool> {
    if !source.is_dir() {
        return Err(InstallError::Source(format!(
            "{} is not a directory",
            source.display()
        )));
    }
    for dir in RESERVED_DIRS {
        if source.join(dir).exists() {
            return Err(InstallError::Source(format!(
                "{dir} exists in source directory {}",
                source.display()
            )));
        }
    }

    let flow_file = source.join(FLOW_FILE);
    if flow_file.is_file() {
        return Ok(false);
    }
    let suite_rc = source.join(SUITE_RC);
    if suite_rc.is_file() {
        symlink(SUITE_RC, &flow_file)?;
        return Ok(true);
    }
    Err(InstallError::Source(format!(
        "no {FLOW_FILE} or {SUITE_RC} in {}",
        source.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_names() {
        assert!(validate_flow_name("nwp").is_ok());
        assert!(validate_flow_name("team/nwp").is_ok());
        assert!(validate_flow_name("").is_err());
        assert!(validate_flow_name("/abs/flow").is_err());
        assert!(validate_flow_name("a/../b").is_err());
        assert!(validate_flow_name("has space").is_err());
        assert!(validate_flow_name("-flag").is_err());
    }

    #[test]
    fn run_numbers_follow_highest() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(next_run_number(&dir.path().join("missing")).unwrap(), 1);
        fs::create_dir(dir.path().join("run1")).unwrap();
        fs::create_dir(dir.path().join("run7")).unwrap();
        fs::create_dir(dir.path().join("runway")).unwrap();
        assert_eq!(next_run_number(dir.path()).unwrap(), 8);
    }

    #[test]
    fn run_n_is_repointed() {
        let dir = tempfile::tempdir().unwrap();
        link_run_n(dir.path(), 1).unwrap();
        let link = link_run_n(dir.path(), 2).unwrap();
        assert_eq!(fs::read_link(link).unwrap(), Path::new("run2"));
    }

    #[test]
    fn suite_rc_gets_flow_file_link() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SUITE_RC), "[scheduling]\n").unwrap();
        assert!(prepare_source(dir.path()).unwrap());
        assert!(dir.path().join(FLOW_FILE).is_file());
        // Second time round the link already exists.
        assert!(!prepare_source(dir.path()).unwrap());
    }

    #[test]
    fn reserved_dir_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(FLOW_FILE), "").unwrap();
        fs::create_dir(dir.path().join("log")).unwrap();
        assert!(matches!(
            prepare_source(dir.path()),
            Err(InstallError::Source(_))
        ));
    }

    #[test]
    fn missing_flow_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(prepare_source(dir.path()).is_err());
    }
}
