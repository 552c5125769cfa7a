//! Construction of ssh and rsync-over-ssh command lines for a platform.

use launchpad_core::Platform;

use crate::quote::shell_join;
use crate::types::CommandSpec;

/// Run-directory items every file installation copies.
pub const DEFAULT_INCLUDES: &[&str] = &["app/", "bin/", "etc/", "lib/", ".service/server.key"];

/// Version-control metadata is never shipped to a remote.
pub const VCS_EXCLUDES: &[&str] = &[".git", ".svn"];

/// Wrap `remote_args` in the platform's ssh command targeting `host`.
///
/// ssh hands the remote side one command string, so the arguments are
/// shell-quoted here and re-split by the remote login shell.
pub fn construct_ssh_cmd(remote_args: &[String], platform: &Platform, host: &str) -> CommandSpec {
    let mut ssh = platform.ssh_command.split_whitespace();
    let program = ssh.next().unwrap_or("ssh").to_string();
    CommandSpec::new(program)
        .args(ssh)
        .arg(host)
        .arg(shell_join(remote_args))
}

/// Mirror `src` into `dst` on `host` with rsync tunnelled through the
/// platform's ssh command.
///
/// Only the default items plus `platform.rsync_includes` are copied;
/// `excludes` are applied first so user ignore patterns always win.
pub fn construct_rsync_over_ssh_cmd(
    src: &str,
    dst: &str,
    platform: &Platform,
    host: &str,
    excludes: &[String],
) -> CommandSpec {
    let mut spec = CommandSpec::new("rsync").args([
        "--delete".to_string(),
        format!("--rsh={}", platform.ssh_command),
        "--checksum".to_string(),
        "--recursive".to_string(),
        "--links".to_string(),
        "--perms".to_string(),
        "--out-format=%o %n%L".to_string(),
        "--no-t".to_string(),
    ]);

    for pattern in VCS_EXCLUDES
        .iter()
        .map(|s| s.to_string())
        .chain(excludes.iter().cloned())
    {
        spec = spec.arg(format!("--exclude={pattern}"));
    }

    for item in DEFAULT_INCLUDES
        .iter()
        .map(|s| s.to_string())
        .chain(platform.rsync_includes.iter().cloned())
    {
        spec = match item.strip_suffix('/') {
            Some(dir) => spec
                .arg(format!("--include=/{dir}/"))
                .arg(format!("--include=/{dir}/***")),
            None => {
                // Parent directories must be included for a nested file to be reached.
                let mut s = spec;
                if let Some((dirs, _file)) = item.rsplit_once('/') {
                    let mut parent = String::new();
                    for part in dirs.split('/') {
                        parent.push('/');
                        parent.push_str(part);
                        s = s.arg(format!("--include={parent}/"));
                    }
                }
                s.arg(format!("--include=/{item}"))
            }
        };
    }

    spec.arg("--exclude=*")
        .arg(format!("{}/", src.trim_end_matches('/')))
        .arg(format!("{host}:{}/", dst.trim_end_matches('/')))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> Platform {
        Platform {
            name: "hpc".into(),
            hosts: vec!["h1".into()],
            install_target: "hpc".into(),
            communication_method: launchpad_core::CommsMethod::Zmq,
            job_runner: "pbs".into(),
            ssh_command: "ssh -oBatchMode=yes".into(),
            rsync_includes: vec!["data/".into()],
        }
    }

    #[test]
    fn ssh_wraps_quoted_remote_command() {
        let spec = construct_ssh_cmd(
            &["cylc".into(), "remote-init".into(), "dir=a b".into()],
            &platform(),
            "h1",
        );
        assert_eq!(spec.program, "ssh");
        assert_eq!(spec.args, ["-oBatchMode=yes", "h1", "cylc remote-init 'dir=a b'"]);
    }

    #[test]
    fn rsync_includes_and_excludes() {
        let spec = construct_rsync_over_ssh_cmd(
            "/home/u/cylc-run/flow",
            "cylc-run/flow",
            &platform(),
            "h1",
            &["*.tmp".into()],
        );
        let args = spec.args.join(" ");
        assert_eq!(spec.program, "rsync");
        assert!(args.contains("--exclude=.git --exclude=.svn --exclude=*.tmp"));
        assert!(args.contains("--include=/app/ --include=/app/***"));
        assert!(args.contains("--include=/data/***"));
        assert!(args.contains("--include=/.service/ --include=/.service/server.key"));
        assert!(args.ends_with("--exclude=* /home/u/cylc-run/flow/ h1:cylc-run/flow/"));
    }

    #[test]
    fn excludes_precede_includes() {
        let spec = construct_rsync_over_ssh_cmd("a", "b", &platform(), "h1", &[]);
        let first_include = spec.args.iter().position(|a| a.starts_with("--include")).unwrap();
        let last_vcs = spec.args.iter().position(|a| a == "--exclude=.svn").unwrap();
        assert!(last_vcs < first_include);
    }
}
