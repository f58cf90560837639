//! Configuration model and helpers used by the keymount binaries.

use crate::error::{MountError, MountResult};
use crate::keyfile::{cipher_digest_security, SecurityLevel};
use crate::volume::{Volume, VolumeKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/keymount.toml";

const DEFAULT_FSCKLOOP: &str = "/dev/loop7";
const DEFAULT_MOUNTS_PATH: &str = "/proc/mounts";

fn d_true() -> bool {
    true
}

fn d_fsckloop() -> String {
    DEFAULT_FSCKLOOP.to_string()
}

fn d_mounts_path() -> String {
    DEFAULT_MOUNTS_PATH.to_string()
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

/// Helper argv templates, one per command kind. Elements are expanded
/// through the templater; an element that collapses to nothing (an
/// affixed empty variable) is dropped from the argv.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Commands {
    pub smbmount: Vec<String>,
    pub smbumount: Vec<String>,
    pub cifsmount: Vec<String>,
    pub ncpmount: Vec<String>,
    pub ncpumount: Vec<String>,
    pub nfsmount: Vec<String>,
    pub lclmount: Vec<String>,
    pub fusemount: Vec<String>,
    pub fuseumount: Vec<String>,
    pub cryptmount: Vec<String>,
    pub truecryptmount: Vec<String>,
    pub truecryptumount: Vec<String>,
    pub umount: Vec<String>,
    pub losetup: Vec<String>,
    pub unlosetup: Vec<String>,
    pub fsck: Vec<String>,
    pub fd0ssh: Vec<String>,
}

impl Default for Commands {
    fn default() -> Self {
        Self {
            smbmount: argv(&[
                "smbmount",
                "//%(SERVER)/%(VOLUME)",
                "%(MNTPT)",
                "-o",
                "username=%(USER)%(before=\",\" OPTIONS)",
            ]),
            smbumount: argv(&["smbumount", "%(MNTPT)"]),
            cifsmount: argv(&[
                "mount",
                "-t",
                "cifs",
                "//%(SERVER)/%(VOLUME)",
                "%(MNTPT)",
                "-o",
                "username=%(USER)%(before=\",\" OPTIONS)",
            ]),
            ncpmount: argv(&[
                "ncpmount",
                "%(SERVER)/%(USER)",
                "%(MNTPT)",
                "-o",
                "pass-fd=0%(before=\",\" OPTIONS)",
            ]),
            ncpumount: argv(&["ncpumount", "%(MNTPT)"]),
            nfsmount: argv(&[
                "mount",
                "%(SERVER):%(VOLUME)",
                "%(MNTPT)",
                "%(before=\"-o\" OPTIONS)",
            ]),
            lclmount: argv(&[
                "mount",
                "-p0",
                "%(before=\"-o\" OPTIONS)",
                "%(VOLUME)",
                "%(MNTPT)",
            ]),
            fusemount: argv(&[
                "mount.fuse",
                "%(VOLUME)",
                "%(MNTPT)",
                "%(before=\"-o\" OPTIONS)",
            ]),
            fuseumount: argv(&["fusermount", "-u", "%(MNTPT)"]),
            cryptmount: argv(&[
                "mount",
                "%(before=\"-o\" OPTIONS)",
                "%(CRYPTODEV)",
                "%(MNTPT)",
            ]),
            truecryptmount: argv(&["truecrypt", "--non-interactive", "%(VOLUME)", "%(MNTPT)"]),
            truecryptumount: argv(&["truecrypt", "--non-interactive", "-d", "%(VOLUME)"]),
            umount: argv(&["umount", "%(MNTPT)"]),
            losetup: argv(&[
                "losetup",
                "-p0",
                "%(before=\"-e\" CIPHER)",
                "%(before=\"-k\" KEYBITS)",
                "%(FSCKLOOP)",
                "%(VOLUME)",
            ]),
            unlosetup: argv(&["losetup", "-d", "%(FSCKLOOP)"]),
            fsck: argv(&["fsck", "-p", "%(FSCKTARGET)"]),
            fd0ssh: argv(&["fd0ssh"]),
        }
    }
}

impl Commands {
    /// Template for mounting a volume of `kind`.
    pub fn mount_for(&self, kind: VolumeKind) -> &[String] {
        match kind {
            VolumeKind::Smb => &self.smbmount,
            VolumeKind::Cifs => &self.cifsmount,
            VolumeKind::Ncp => &self.ncpmount,
            VolumeKind::Nfs => &self.nfsmount,
            VolumeKind::Local => &self.lclmount,
            VolumeKind::Fuse => &self.fusemount,
            VolumeKind::Crypt => &self.cryptmount,
            VolumeKind::Truecrypt => &self.truecryptmount,
        }
    }

    /// Template for unmounting a volume of `kind`. Each mount kind has a
    /// paired unmount command; everything else falls through to plain
    /// `umount`.
    pub fn umount_for(&self, kind: VolumeKind) -> &[String] {
        match kind {
            VolumeKind::Smb => &self.smbumount,
            VolumeKind::Ncp => &self.ncpumount,
            VolumeKind::Fuse => &self.fuseumount,
            VolumeKind::Truecrypt => &self.truecryptumount,
            _ => &self.umount,
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log debug chatter to stderr and dump volume records before use.
    #[serde(default)]
    pub debug: bool,

    /// Create missing mountpoints.
    #[serde(default = "d_true")]
    pub mkmountpoint: bool,

    /// Remove mountpoints this process created, on unmount.
    #[serde(default = "d_true")]
    pub rmdir_mntpt: bool,

    /// Loop device reserved for the fsck preflight.
    #[serde(default = "d_fsckloop")]
    pub fsckloop: String,

    /// Kernel mount list consulted for the already-mounted check.
    #[serde(default = "d_mounts_path")]
    pub mounts_path: String,

    /// Override for the cmtab location (tests, mostly).
    #[serde(default)]
    pub cmtab_path: Option<String>,

    #[serde(default)]
    pub commands: Commands,

    /// Volumes to manage, usually one per user.
    #[serde(default, rename = "volume")]
    pub volumes: Vec<Volume>,

    #[serde(skip)]
    pub path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            mkmountpoint: true,
            rmdir_mntpt: true,
            fsckloop: d_fsckloop(),
            mounts_path: d_mounts_path(),
            cmtab_path: None,
            commands: Commands::default(),
            volumes: Vec::new(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read a config file from disk and validate the volume records.
    pub fn load<P: AsRef<Path>>(path: P) -> MountResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg: Self = toml::from_str(&contents)?;
        cfg.path = path.to_path_buf();

        for vol in &cfg.volumes {
            vol.validate()?;
        }
        Ok(cfg)
    }

    /// Volumes belonging to `user`.
    pub fn volumes_for(&self, user: &str) -> Vec<&Volume> {
        self.volumes.iter().filter(|v| v.user == user).collect()
    }

    /// Best-effort validation pass returning human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        for vol in &self.volumes {
            if let Err(err) = vol.validate() {
                issues.push(err.to_string());
            }

            if !vol.fs_key_cipher.is_empty()
                && cipher_digest_security(&vol.fs_key_cipher) < SecurityLevel::Adequate
            {
                issues.push(format!(
                    "volume {}: fs_key_cipher {} is considered insecure",
                    vol.volume, vol.fs_key_cipher
                ));
            }
            if !vol.fs_key_cipher.is_empty()
                && cipher_digest_security(&vol.fs_key_hash) < SecurityLevel::Adequate
            {
                issues.push(format!(
                    "volume {}: fs_key_hash {} is considered insecure",
                    vol.volume, vol.fs_key_hash
                ));
            }
            if let Some(cipher) = vol.option("encryption") {
                if cipher_digest_security(cipher) < SecurityLevel::Adequate {
                    issues.push(format!(
                        "volume {}: encryption option {cipher} is considered insecure",
                        vol.volume
                    ));
                }
            }
        }

        if self.fsckloop.is_empty() {
            issues.push("fsckloop must name a loop device".to_string());
        }

        issues
    }

    /// cmtab location, honouring the override.
    pub fn cmtab_path(&self) -> Option<&str> {
        self.cmtab_path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_a_minimal_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
debug = true

[[volume]]
kind = "cifs"
user = "alice"
server = "fileserver"
volume = "share"
mountpoint = "/home/alice/share"
fstype = "cifs"

[volume.options]
nosuid = ""
uid = "1000"
"#
        )
        .unwrap();

        let cfg = Config::load(file.path()).unwrap();
        assert!(cfg.debug);
        assert!(cfg.mkmountpoint);
        assert_eq!(cfg.fsckloop, DEFAULT_FSCKLOOP);
        assert_eq!(cfg.volumes.len(), 1);
        assert_eq!(cfg.volumes_for("alice").len(), 1);
        assert!(cfg.volumes_for("bob").is_empty());
        assert_eq!(cfg.volumes[0].options_string(), "nosuid,uid=1000");
    }

    #[test]
    fn invalid_volume_fails_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[[volume]]
kind = "nfs"
user = "alice"
volume = "/export/home"
mountpoint = "/home/alice"
"#
        )
        .unwrap();

        assert!(matches!(
            Config::load(file.path()),
            Err(MountError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn validate_flags_weak_ciphers() {
        let mut cfg = Config::default();
        let mut vol = Volume {
            kind: VolumeKind::Crypt,
            user: "alice".into(),
            server: String::new(),
            volume: "/srv/a.img".into(),
            mountpoint: "/mnt/a".into(),
            fstype: "ext4".into(),
            options: Default::default(),
            fs_key_path: "/srv/a.key".into(),
            fs_key_cipher: "des-cbc".into(),
            fs_key_hash: "md5".into(),
            globalconf: false,
            readonly: false,
            uses_ssh: false,
            created_mntpt: false,
        };
        cfg.volumes.push(vol.clone());
        assert_eq!(cfg.validate().len(), 1);

        vol.fs_key_cipher = "aes-256-cbc".into();
        cfg.volumes[0] = vol;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn default_umount_pairing_falls_through() {
        let commands = Commands::default();
        assert_eq!(commands.umount_for(VolumeKind::Smb)[0], "smbumount");
        assert_eq!(commands.umount_for(VolumeKind::Fuse)[0], "fusermount");
        assert_eq!(commands.umount_for(VolumeKind::Local)[0], "umount");
        assert_eq!(commands.umount_for(VolumeKind::Nfs)[0], "umount");
        assert_eq!(commands.umount_for(VolumeKind::Crypt)[0], "umount");
    }
}
