//! Core building blocks shared by the keymount binaries.
//!
//! Configuration, the association registry, the command templater, the
//! process spawner, and the mount controller live here so the engine and
//! CLI crates can focus on their own surfaces.

pub mod config;
pub mod engine;
pub mod error;
pub mod escape;
pub mod keyfile;
pub mod logging;
pub mod mount;
pub mod mtab;
pub mod spawn;
pub mod template;
pub mod volume;

pub use config::{Config, DEFAULT_CONFIG_PATH};
pub use engine::{EhdEngine, EhdInfo, EhdRequest};
pub use error::{MountError, MountResult};
pub use mount::Mounter;
pub use mtab::{CmtabEntry, CmtabField, Registry, SmtabField};
pub use volume::{Volume, VolumeKind, MAX_PAR};
