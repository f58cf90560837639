//! Engine contract for encrypted-container handling.
//!
//! The concrete dm-crypt implementation lives in `keymount-ehd`; the
//! controller only sees this capability set, which keeps a slot open for
//! other block-encryption backends (NetBSD cgd, historically).

use crate::error::MountResult;

/// A request to map an encrypted container below a mountpoint.
#[derive(Debug, Clone)]
pub struct EhdRequest {
    /// Path to the container: a disk image file or a block device.
    pub container: String,
    /// Where the decrypted filesystem will be mounted.
    pub mountpoint: String,
    /// Filesystem cipher, in the crypto helper's naming scheme. `None`
    /// lets a LUKS header speak for itself.
    pub fs_cipher: Option<String>,
    /// Hash for plain dm-crypt key processing.
    pub fs_hash: Option<String>,
    /// Truncate the key to this many bytes before handing it over.
    pub trunc_keysize: Option<usize>,
    /// Map the container read-only.
    pub readonly: bool,
}

/// The layer stack a successful load produced. Everything teardown needs
/// to unwind in reverse order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EhdInfo {
    /// The container the stack was built over.
    pub container: String,
    /// The container itself when it is a block device, otherwise the
    /// loop device that translates it into one.
    pub lower_device: String,
    /// Loop device allocated for a file-backed container.
    pub loop_device: Option<String>,
    /// Short name of the crypto mapping.
    pub crypto_name: String,
    /// Full crypto device path: `/dev/mapper/` + name.
    pub crypto_device: String,
}

/// Capability set of an encrypted-container engine.
pub trait EhdEngine {
    /// Build the loop + crypto stack for `req`, feeding `key` to the
    /// crypto helper. On failure every layer already established is
    /// released again.
    fn load(&self, req: &EhdRequest, key: &[u8]) -> MountResult<EhdInfo>;

    /// Tear the stack down in reverse: crypto mapping first, then the
    /// loop device if one is in play.
    fn unload(&self, info: &EhdInfo) -> MountResult<()>;

    /// Whether `path` holds a LUKS header. `blkdev_assured` skips the
    /// transient read-only loop otherwise needed for plain files.
    fn is_luks(&self, path: &str, blkdev_assured: bool) -> MountResult<bool>;

    /// Resolve a loop device back to its backing file; paths that are
    /// not loop devices come back unchanged.
    fn loop_file(&self, device: &str) -> String;
}
