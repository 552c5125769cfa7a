//! `launchpad-core`: configuration and shared types for the launchpad
//! job submission pipeline.

pub mod bad_hosts;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod host;
pub mod platform;
pub mod types;

pub use bad_hosts::BadHosts;
pub use broadcast::{Broadcast, BroadcastStore, RuntimeConfigSource};
pub use config::{CommsMethod, LaunchpadConfig, LOCALHOST};
pub use error::{LaunchpadError, Result};
pub use host::HostIdentity;
pub use platform::{ConfigRegistry, Platform, PlatformRegistry};
pub use types::{AttemptId, RuntimeConfig, SubmitOutcome, TaskId};
