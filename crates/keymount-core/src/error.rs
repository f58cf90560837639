//! Error type shared across the keymount crates.

use std::io;
use thiserror::Error;

/// Convenience alias used throughout the workspace.
pub type MountResult<T> = Result<T, MountError>;

/// Failure kinds surfaced by the core.
///
/// Each subsystem fails with a distinct kind; the controller folds them
/// into a single success/failure for its caller but logs the variant.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("could not create mountpoint {path}: {reason}")]
    MountpointCreate { path: String, reason: String },

    #[error("unknown digest: {0}")]
    DigestUnknown(String),

    #[error("unknown cipher: {0}")]
    CipherUnknown(String),

    #[error("keyfile error: {0}")]
    KeyIo(String),

    #[error("keyfile decryption failed: {0}")]
    KeyDecrypt(String),

    #[error("no free loop devices")]
    LoopExhausted,

    #[error("loop device error: {0}")]
    LoopOs(String),

    #[error("crypto helper failed: {0}")]
    CryptoHelper(String),

    #[error("mount helper exited with status {0}")]
    MountHelper(i32),

    #[error("unmount helper exited with status {0}")]
    UnmountHelper(i32),

    #[error("registry error on {path}: {reason}")]
    RegistryIo { path: String, reason: String },

    #[error("could not lock {path}: {reason}")]
    RegistryLock { path: String, reason: String },

    #[error("template expansion failed: {0}")]
    TemplateExpand(String),

    #[error("could not spawn {command}: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("not supported on this platform")]
    NotSupported,

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("configuration parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
