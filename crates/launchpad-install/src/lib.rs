//! `launchpad-install`: installs a workflow from its source directory into
//! a fresh run directory under the run root.
//!
//! ```text
//! <run_root>/<flow>/
//!     _cylc-install/source -> <source>
//!     run1/  run2/  ...
//!     runN -> run2
//! ```

pub mod error;
pub mod install;
pub mod rundir;

pub use error::{InstallError, Result};
pub use install::{InstallOptions, InstallReport, Installer};
