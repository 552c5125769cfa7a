//! launchpad-remote: the command execution service used by the submission
//! pipeline.
//!
//! Everything that crosses the machine boundary is a [`CommandSpec`] run by
//! a [`CommandRunner`]:
//! - local subshell evaluation (`bash -c`)
//! - ssh to a platform host (remote init, job submission)
//! - rsync over ssh (file installation)
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use launchpad_remote::{CommandRunner, CommandSpec, ProcessRunner};
//!
//! #[tokio::main]
//! async fn main() {
//!     let runner = ProcessRunner::new(4, Duration::from_secs(30));
//!     let result = runner
//!         .run(CommandSpec::new("echo").arg("hello"))
//!         .await
//!         .unwrap();
//!     println!("{}", result.stdout);
//! }
//! ```

pub mod error;
pub mod quote;
pub mod runner;
pub mod ssh;
pub mod types;

pub use error::{RemoteError, Result};
pub use quote::{shell_join, shell_quote};
pub use runner::{run_remote, CommandRunner, ProcessRunner};
pub use ssh::{construct_rsync_over_ssh_cmd, construct_ssh_cmd};
pub use types::{CommandSpec, ExecResult, HOST_UNREACHABLE};
