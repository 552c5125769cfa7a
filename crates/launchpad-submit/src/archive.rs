//! Local tar archives streamed to remote commands on stdin.

use std::path::Path;

use launchpad_remote::{run_remote, CommandRunner, CommandSpec};
use tempfile::NamedTempFile;

use crate::error::{Result, SubmitError};

/// Archive `items` (paths relative to `base`) into a temporary file.
///
/// The file is deleted when the returned handle is dropped, so keep it
/// alive until the command reading it has finished.
pub async fn make_archive(
    runner: &dyn CommandRunner,
    base: &Path,
    items: &[String],
) -> Result<NamedTempFile> {
    let archive = NamedTempFile::new()?;
    let mut spec = CommandSpec::new("tar")
        .arg("-c")
        .arg("-f")
        .arg(archive.path().to_string_lossy())
        .arg("-C")
        .arg(base.to_string_lossy());
    spec = if items.is_empty() {
        spec.args(["-T", "/dev/null"])
    } else {
        spec.args(items.iter().cloned())
    };

    let res = run_remote(runner, spec).await;
    if !res.success() {
        return Err(SubmitError::Io(format!(
            "tar exited {}: {}",
            res.exit_code,
            res.stderr.trim()
        )));
    }
    Ok(archive)
}
