//! `launchpad-submit`: takes tasks that are ready to run and submits their
//! jobs to execution platforms.
//!
//! # Overview
//!
//! For each task the [`pipeline::SubmitPipeline`] resolves a platform and
//! host, prepares the host's install target, and submits the job, failing
//! over to the next host when one cannot be reached. Work shared between
//! tasks happens once:
//!
//! | Stage            | Shared per                         | Module         |
//! |------------------|------------------------------------|----------------|
//! | Resolution       | platform/host expression           | `resolver`     |
//! | Remote init      | install target                     | `remote_init`  |
//! | File install     | install target                     | `file_install` |
//! | Job submission   | `(platform, host)` within one tick | `batcher`      |
//!
//! The [`engine::Submitter`] runs the pipeline for batches of tasks fed in
//! from the task pool and reports outcomes back.

pub mod archive;
pub mod batcher;
pub mod cache;
pub mod engine;
pub mod error;
pub mod file_install;
pub mod job_file;
pub mod keys;
pub mod pipeline;
pub mod remote_init;
pub mod resolver;
pub mod subshell;
pub mod task;

pub use cache::SelectionCache;
pub use engine::{Finished, Submitter};
pub use error::{PlatformError, Result, SubmitError};
pub use keys::{FileKeyStore, KeyStore};
pub use pipeline::{PipelineServices, Stage, SubmitPipeline};
pub use resolver::{HostSelector, Resolution, Resolver};
pub use task::{SubmitState, TaskToSubmit};
