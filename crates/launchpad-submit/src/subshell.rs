//! Evaluation of host and platform expressions.
//!
//! An expression is either a literal name (with `$VAR`/`${VAR}` expanded
//! from the environment) or a command substitution, `$(cmd)` or
//! `` `cmd` ``, whose trimmed stdout is the result.

use std::time::Duration;

use launchpad_core::{HostIdentity, LOCALHOST};
use launchpad_remote::{run_remote, CommandRunner, CommandSpec};
use tracing::debug;

use crate::error::{Result, SubmitError};

/// Parsed form of a host/platform expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expr<'a> {
    /// Unset or blank: the scheduler host.
    Default,
    /// Command substitution; holds the inner command.
    Command(&'a str),
    Literal(&'a str),
}

pub fn parse(expr: &str) -> Expr<'_> {
    let trimmed = expr.trim();
    if trimmed.is_empty() {
        return Expr::Default;
    }
    let inner = trimmed
        .strip_prefix("$(")
        .and_then(|s| s.strip_suffix(')'))
        .or_else(|| {
            trimmed
                .strip_prefix('`')
                .and_then(|s| s.strip_suffix('`'))
        });
    match inner {
        Some(cmd) => Expr::Command(cmd.trim()),
        None => Expr::Literal(trimmed),
    }
}

/// Expand `$VAR` and `${VAR}` references using `lookup`.
///
/// Unknown variables are left as written.
pub fn expand_vars<F>(s: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (!name.is_empty()).then(|| lookup(name)).flatten() {
            Some(value) => out.push_str(&value),
            None => {
                out.push('$');
                out.push_str(&after[..consumed]);
            }
        }
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}

fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

/// Evaluate `expr` to a name. Blank expressions evaluate to `localhost`.
pub async fn subshell_eval(
    expr: &str,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<String> {
    match parse(expr) {
        Expr::Default => Ok(LOCALHOST.to_string()),
        Expr::Literal(name) => Ok(expand_vars(name, env_lookup)),
        Expr::Command(cmd) => {
            let spec = CommandSpec::new("bash")
                .args(["-c", cmd])
                .timeout(timeout);
            let res = run_remote(runner, spec).await;
            if !res.success() {
                return Err(SubmitError::Eval {
                    expr: expr.to_string(),
                    reason: format!(
                        "command exited {}: {}",
                        res.exit_code,
                        res.stderr.trim()
                    ),
                });
            }
            let value = res.stdout.trim();
            if value.is_empty() {
                return Err(SubmitError::Eval {
                    expr: expr.to_string(),
                    reason: "command produced no output".to_string(),
                });
            }
            debug!(expr, value, "expression evaluated");
            Ok(expand_vars(value, env_lookup))
        }
    }
}

/// Evaluate a host expression. Names of the scheduler host itself come
/// back as `localhost`.
pub async fn eval_host(
    expr: &str,
    runner: &dyn CommandRunner,
    identity: &HostIdentity,
    timeout: Duration,
) -> Result<String> {
    let host = subshell_eval(expr, runner, timeout).await?;
    if identity.is_local(&host) {
        Ok(LOCALHOST.to_string())
    } else {
        Ok(host)
    }
}

/// Evaluate a platform expression to a platform or group name.
pub async fn eval_platform(
    expr: &str,
    runner: &dyn CommandRunner,
    timeout: Duration,
) -> Result<String> {
    subshell_eval(expr, runner, timeout).await
}
