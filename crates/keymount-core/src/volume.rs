//! Volume records: what to mount, where, and for whom.

use crate::error::{MountError, MountResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound for helper parameters and short string fields.
pub const MAX_PAR: usize = 127;

/// Upper bound for path fields.
pub const MAX_PATH: usize = 4096;

/// The closed set of volume kinds the controller knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKind {
    Local,
    Smb,
    Cifs,
    Ncp,
    Nfs,
    Fuse,
    Crypt,
    Truecrypt,
}

impl VolumeKind {
    /// Remote kinds must name a server.
    pub fn requires_server(&self) -> bool {
        matches!(self, Self::Smb | Self::Cifs | Self::Ncp | Self::Nfs)
    }

    /// Network filesystems with case-insensitive share naming.
    pub fn case_insensitive_fsname(&self) -> bool {
        matches!(self, Self::Smb | Self::Cifs | Self::Ncp)
    }

    /// Whether the mounted object is an encrypted container whose layer
    /// stack must be recorded for teardown.
    pub fn is_crypt_container(&self) -> bool {
        matches!(self, Self::Crypt)
    }
}

impl fmt::Display for VolumeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Smb => "smb",
            Self::Cifs => "cifs",
            Self::Ncp => "ncp",
            Self::Nfs => "nfs",
            Self::Fuse => "fuse",
            Self::Crypt => "crypt",
            Self::Truecrypt => "truecrypt",
        };
        f.write_str(name)
    }
}

/// One volume to mount at login and unmount at logout.
///
/// Records are owned by the caller; the controller only mutates the
/// `created_mntpt` bookkeeping flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Volume kind, selecting the mount command template.
    pub kind: VolumeKind,

    /// Login name of the user this volume belongs to.
    pub user: String,

    /// Server for remote kinds; empty for local ones.
    #[serde(default)]
    pub server: String,

    /// Remote path, block device, or container path.
    pub volume: String,

    /// Where to mount.
    pub mountpoint: String,

    /// Filesystem type handed to the mount helper.
    #[serde(default = "default_fstype")]
    pub fstype: String,

    /// Mount options in configuration order; values may be empty
    /// (`ro`, `nosuid`, ...).
    #[serde(default, with = "options_map")]
    pub options: Vec<(String, String)>,

    /// Path to an encrypted filesystem keyfile.
    #[serde(default)]
    pub fs_key_path: String,

    /// Cipher the keyfile is sealed with (OpenSSL name); empty when the
    /// login password is used directly.
    #[serde(default)]
    pub fs_key_cipher: String,

    /// Digest for keyfile key derivation.
    #[serde(default = "default_fs_key_hash")]
    pub fs_key_hash: String,

    /// Whether this record came from the global config (as opposed to a
    /// per-user one; informational, logged only).
    #[serde(default)]
    pub globalconf: bool,

    /// Mount read-only.
    #[serde(default)]
    pub readonly: bool,

    /// Prefix the mount command with the fd0ssh pipe helper.
    #[serde(default)]
    pub uses_ssh: bool,

    /// Set by the controller when it had to create the mountpoint.
    #[serde(skip)]
    pub created_mntpt: bool,
}

fn default_fstype() -> String {
    "auto".to_string()
}

fn default_fs_key_hash() -> String {
    "md5".to_string()
}

impl Volume {
    /// Structural validation: string caps, server presence for remote
    /// kinds, key path presence when a key cipher is named.
    pub fn validate(&self) -> MountResult<()> {
        let cap = |name: &str, value: &str, max: usize| -> MountResult<()> {
            if value.len() > max {
                return Err(MountError::ConfigInvalid(format!(
                    "volume {}: {name} exceeds {max} bytes",
                    self.volume
                )));
            }
            Ok(())
        };

        cap("user", &self.user, MAX_PAR)?;
        cap("server", &self.server, MAX_PAR)?;
        cap("volume", &self.volume, MAX_PATH)?;
        cap("mountpoint", &self.mountpoint, MAX_PATH)?;
        cap("fstype", &self.fstype, MAX_PAR)?;
        cap("fs_key_cipher", &self.fs_key_cipher, MAX_PAR)?;
        cap("fs_key_path", &self.fs_key_path, MAX_PATH)?;

        if self.user.is_empty() {
            return Err(MountError::ConfigInvalid(format!(
                "volume {}: user must be set",
                self.volume
            )));
        }
        if self.volume.is_empty() || self.mountpoint.is_empty() {
            return Err(MountError::ConfigInvalid(
                "volume and mountpoint must be set".to_string(),
            ));
        }
        if self.kind.requires_server() && self.server.is_empty() {
            return Err(MountError::ConfigInvalid(format!(
                "volume {}: kind {} requires a server",
                self.volume, self.kind
            )));
        }
        if !self.fs_key_cipher.is_empty() && self.fs_key_path.is_empty() {
            return Err(MountError::ConfigInvalid(format!(
                "volume {}: fs_key_cipher is set but fs_key_path is not",
                self.volume
            )));
        }

        Ok(())
    }

    /// Join the options map back into a `a=b,c,...` string for the
    /// OPTIONS substitution variable.
    pub fn options_string(&self) -> String {
        self.options
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Look up a single option value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }

    /// Whether an option key is present at all.
    pub fn has_option(&self, key: &str) -> bool {
        self.options.iter().any(|(name, _)| name == key)
    }
}

/// Options are a table in the configuration file but an ordered list in
/// memory; helpers see them in the order the admin wrote them.
mod options_map {
    use serde::de::{MapAccess, Visitor};
    use serde::ser::SerializeMap;
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(
        options: &[(String, String)],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(options.len()))?;
        for (key, value) in options {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<(String, String)>, D::Error> {
        struct OptionsVisitor;

        impl<'de> Visitor<'de> for OptionsVisitor {
            type Value = Vec<(String, String)>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a table of mount options")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut options = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some(entry) = access.next_entry()? {
                    options.push(entry);
                }
                Ok(options)
            }
        }

        deserializer.deserialize_map(OptionsVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(kind: VolumeKind) -> Volume {
        Volume {
            kind,
            user: "alice".into(),
            server: String::new(),
            volume: "/srv/vol.img".into(),
            mountpoint: "/home/alice".into(),
            fstype: "auto".into(),
            options: Vec::new(),
            fs_key_path: String::new(),
            fs_key_cipher: String::new(),
            fs_key_hash: "md5".into(),
            globalconf: true,
            readonly: false,
            uses_ssh: false,
            created_mntpt: false,
        }
    }

    #[test]
    fn local_volume_validates() {
        assert!(sample(VolumeKind::Local).validate().is_ok());
    }

    #[test]
    fn remote_kind_requires_server() {
        let mut vol = sample(VolumeKind::Cifs);
        assert!(vol.validate().is_err());
        vol.server = "fileserver".into();
        assert!(vol.validate().is_ok());
    }

    #[test]
    fn key_cipher_requires_key_path() {
        let mut vol = sample(VolumeKind::Crypt);
        vol.fs_key_cipher = "aes-256-cbc".into();
        assert!(vol.validate().is_err());
        vol.fs_key_path = "/home/alice.key".into();
        assert!(vol.validate().is_ok());
    }

    #[test]
    fn caps_are_enforced() {
        let mut vol = sample(VolumeKind::Local);
        vol.user = "x".repeat(MAX_PAR + 1);
        assert!(vol.validate().is_err());
    }

    #[test]
    fn options_keep_their_configured_order() {
        let mut vol = sample(VolumeKind::Local);
        vol.options.push(("uid".into(), "1000".into()));
        vol.options.push(("loop".into(), String::new()));
        assert_eq!(vol.options_string(), "uid=1000,loop");
        assert!(vol.has_option("loop"));
        assert!(!vol.has_option("gid"));
        assert_eq!(vol.option("uid"), Some("1000"));
    }
}
