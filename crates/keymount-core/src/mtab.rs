//! Association registry for encrypted-mount layer stacks.
//!
//! Retrieving the container/loop/crypto/mountpoint associations back out
//! of each kernel layer is painful, so every successful encrypted mount
//! appends one record to the cmtab. Teardown reads it to unwind the stack
//! in reverse, even across reboots. On platforms where the kernel mtab is
//! a writable plain file the system mtab is kept consistent too; on
//! everything else the smtab path is empty and those calls are no-ops.
//!
//! All mutations happen under a blocking advisory byte-range lock over
//! the whole file. Records of the same mountpoint may be stacked
//! (overmounts); lookups resolve the stack with a last-match-wins rule
//! and removal takes out the last matching line.

use crate::error::{MountError, MountResult};
use crate::escape;
use log::warn;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::{FileExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

const CMTAB_PATH: &str = "/etc/cmtab";

#[cfg(target_os = "linux")]
const SMTAB_PATH: &str = "/etc/mtab";
#[cfg(not(target_os = "linux"))]
const SMTAB_PATH: &str = "";

const COMPACT_CHUNK: usize = 1024;

/// Field selector for cmtab matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmtabField {
    Mountpoint = 0,
    Container = 1,
    LoopDevice = 2,
    CryptoDevice = 3,
}

/// Field selector for smtab matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmtabField {
    Device = 0,
    Mountpoint = 1,
}

/// One recorded layer stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmtabEntry {
    pub mountpoint: String,
    pub container: String,
    pub loop_device: Option<String>,
    pub crypto_device: Option<String>,
}

/// Handle on the registry files.
#[derive(Debug, Clone)]
pub struct Registry {
    cmtab: PathBuf,
    smtab: Option<PathBuf>,
}

impl Default for Registry {
    fn default() -> Self {
        Self {
            cmtab: PathBuf::from(CMTAB_PATH),
            smtab: if SMTAB_PATH.is_empty() {
                None
            } else {
                Some(PathBuf::from(SMTAB_PATH))
            },
        }
    }
}

impl Registry {
    /// Registry with explicit file locations (tests, or a cmtab override
    /// from configuration).
    pub fn with_paths(cmtab: PathBuf, smtab: Option<PathBuf>) -> Self {
        Self { cmtab, smtab }
    }

    /// Registry honouring a configured cmtab override.
    pub fn from_override(cmtab_override: Option<&str>) -> Self {
        let mut registry = Self::default();
        if let Some(path) = cmtab_override {
            registry.cmtab = PathBuf::from(path);
        }
        registry
    }

    /// Append one cmtab record. Absent loop/crypto layers are stored as
    /// `-`.
    pub fn cmtab_add(&self, entry: &CmtabEntry) -> MountResult<()> {
        let line = format!(
            "{}\t{}\t{}\t{}\n",
            escape::encode_str(&entry.mountpoint),
            escape::encode_str(&entry.container),
            escape::encode_str(entry.loop_device.as_deref().unwrap_or("-")),
            escape::encode_str(entry.crypto_device.as_deref().unwrap_or("-")),
        );
        mtab_add(&self.cmtab, &line)
    }

    /// Look up the most recent cmtab record whose `field` equals `spec`.
    pub fn cmtab_get(&self, spec: &str, field: CmtabField) -> MountResult<Option<CmtabEntry>> {
        let file = match File::open(&self.cmtab) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(&self.cmtab, e)),
        };
        lock(&file, &self.cmtab, false)?;

        // Read through the locked handle: opening a second descriptor
        // would drop the advisory lock when it closes.
        let contents = read_all(&file).map_err(|e| self.io_err(&self.cmtab, e))?;
        let mut found = None;
        for line in lines(&contents) {
            let fields = parse_fields(line);
            if field_matches(&fields, field as usize, spec) {
                // Most recent entry is at the bottom; keep scanning so
                // overmount stacks resolve to the newest record.
                found = Some(CmtabEntry {
                    mountpoint: fields.first().cloned().flatten().unwrap_or_default(),
                    container: fields.get(1).cloned().flatten().unwrap_or_default(),
                    loop_device: dash_to_none(fields.get(2).cloned().flatten()),
                    crypto_device: dash_to_none(fields.get(3).cloned().flatten()),
                });
            }
        }
        Ok(found)
    }

    /// Remove the last cmtab record whose `field` equals `spec`.
    /// Returns whether a record was removed.
    pub fn cmtab_remove(&self, spec: &str, field: CmtabField) -> MountResult<bool> {
        mtab_remove(&self.cmtab, spec, field as usize)
    }

    /// Append a system mtab record, where the platform has a writable
    /// one.
    pub fn smtab_add(
        &self,
        device: &str,
        mountpoint: &str,
        fstype: &str,
        options: &str,
    ) -> MountResult<()> {
        let Some(smtab) = &self.smtab else {
            return Err(MountError::NotSupported);
        };
        let line = format!(
            "{} {} {} {} 0 0\n",
            escape::encode_str(device),
            escape::encode_str(mountpoint),
            escape::encode_str(fstype),
            escape::encode_str(options),
        );
        mtab_add(smtab, &line)
    }

    /// Remove the last matching system mtab record. A platform without a
    /// writable mtab reports success without touching anything.
    pub fn smtab_remove(&self, spec: &str, field: SmtabField) -> MountResult<bool> {
        match &self.smtab {
            Some(smtab) => mtab_remove(smtab, spec, field as usize),
            None => Ok(false),
        }
    }

    fn io_err(&self, path: &Path, e: std::io::Error) -> MountError {
        MountError::RegistryIo {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
    }
}

fn mtab_add(path: &Path, line: &str) -> MountResult<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .append(true)
        .mode(0o644)
        .open(path)
        .map_err(|e| registry_io(path, e))?;

    lock(&file, path, true)?;
    file.write_all(line.as_bytes())
        .and_then(|_| file.flush())
        .map_err(|e| registry_io(path, e))
    // Closing the file releases the lock.
}

/// Remove the last line whose `field_idx` field equals `spec`, then pull
/// the rest of the file forward over it and truncate. Interrupting this
/// mid-copy can leave a partially compacted tail; the trailing data is
/// still line-oriented, so recovery is dropping any incomplete last line.
fn mtab_remove(path: &Path, spec: &str, field_idx: usize) -> MountResult<bool> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| registry_io(path, e))?;
    lock(&file, path, true)?;

    let contents = read_all(&file).map_err(|e| registry_io(path, e))?;

    let mut pos_dst = None;
    let mut pos_src = 0u64;
    let mut offset = 0usize;
    for line in lines(&contents) {
        let line_len = line.len();
        let fields = parse_fields(line);
        if field_matches(&fields, field_idx, spec) {
            pos_dst = Some(offset as u64);
            pos_src = (offset + line_len) as u64;
        }
        offset += line_len;
    }

    let Some(mut pos_dst) = pos_dst else {
        return Ok(false);
    };

    let mut buf = [0u8; COMPACT_CHUNK];
    loop {
        let read = file
            .read_at(&mut buf, pos_src)
            .map_err(|e| registry_io(path, e))?;
        if read == 0 {
            break;
        }
        let written = file
            .write_at(&buf[..read], pos_dst)
            .map_err(|e| registry_io(path, e))?;
        if written != read {
            warn!(
                "short write while compacting {}: {written} of {read} bytes",
                path.display()
            );
            pos_dst += written as u64;
            break;
        }
        pos_src += read as u64;
        pos_dst += read as u64;
    }

    if let Err(e) = file.set_len(pos_dst) {
        warn!("could not truncate {}: {e}", path.display());
    }
    Ok(true)
}

fn lock(file: &File, path: &Path, exclusive: bool) -> MountResult<()> {
    let lock = libc::flock {
        l_type: if exclusive {
            libc::F_WRLCK as libc::c_short
        } else {
            libc::F_RDLCK as libc::c_short
        },
        l_whence: libc::SEEK_SET as libc::c_short,
        l_start: 0,
        l_len: 0,
        l_pid: 0,
    };
    let ret = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lock) };
    if ret < 0 {
        return Err(MountError::RegistryLock {
            path: path.display().to_string(),
            reason: std::io::Error::last_os_error().to_string(),
        });
    }
    Ok(())
}

fn read_all(mut file: &File) -> std::io::Result<Vec<u8>> {
    use std::io::Read;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(contents)
}

fn registry_io(path: &Path, e: std::io::Error) -> MountError {
    MountError::RegistryIo {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

/// Split into lines, newline included, so byte offsets stay exact.
fn lines(contents: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    let mut rest = contents;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let end = rest
            .iter()
            .position(|&b| b == b'\n')
            .map(|p| p + 1)
            .unwrap_or(rest.len());
        let (line, tail) = rest.split_at(end);
        rest = tail;
        Some(line)
    })
}

/// Split a record into up to four unescaped fields.
fn parse_fields(line: &[u8]) -> Vec<Option<String>> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|field| !field.is_empty())
        .take(4)
        .map(|field| {
            let mut buf = field.to_vec();
            escape::decode_in_place(&mut buf);
            Some(String::from_utf8_lossy(&buf).into_owned())
        })
        .collect()
}

fn field_matches(fields: &[Option<String>], idx: usize, spec: &str) -> bool {
    matches!(fields.get(idx), Some(Some(value)) if value == spec)
}

fn dash_to_none(field: Option<String>) -> Option<String> {
    field.filter(|value| value != "-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(mountpoint: &str, container: &str, loopdev: Option<&str>, cryptodev: Option<&str>) -> CmtabEntry {
        CmtabEntry {
            mountpoint: mountpoint.to_string(),
            container: container.to_string(),
            loop_device: loopdev.map(str::to_string),
            crypto_device: cryptodev.map(str::to_string),
        }
    }

    fn registry(dir: &tempfile::TempDir) -> Registry {
        Registry::with_paths(dir.path().join("cmtab"), Some(dir.path().join("mtab")))
    }

    #[test]
    fn cmtab_round_trip() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.cmtab_add(&entry(
            "/mnt/a",
            "/srv/img.bin",
            Some("/dev/loop3"),
            Some("/dev/mapper/x"),
        ))
        .unwrap();

        let found = reg.cmtab_get("/mnt/a", CmtabField::Mountpoint).unwrap().unwrap();
        assert_eq!(found.mountpoint, "/mnt/a");
        assert_eq!(found.container, "/srv/img.bin");
        assert_eq!(found.loop_device.as_deref(), Some("/dev/loop3"));
        assert_eq!(found.crypto_device.as_deref(), Some("/dev/mapper/x"));

        assert!(reg.cmtab_remove("/mnt/a", CmtabField::Mountpoint).unwrap());
        assert!(reg.cmtab_get("/mnt/a", CmtabField::Mountpoint).unwrap().is_none());
    }

    #[test]
    fn lookup_returns_the_last_matching_record() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.cmtab_add(&entry("/mnt/a", "/srv/old.img", Some("/dev/loop1"), None))
            .unwrap();
        reg.cmtab_add(&entry("/mnt/b", "/srv/other.img", None, None)).unwrap();
        reg.cmtab_add(&entry("/mnt/a", "/srv/new.img", Some("/dev/loop2"), None))
            .unwrap();

        let found = reg.cmtab_get("/mnt/a", CmtabField::Mountpoint).unwrap().unwrap();
        assert_eq!(found.container, "/srv/new.img");
        assert_eq!(found.loop_device.as_deref(), Some("/dev/loop2"));
    }

    #[test]
    fn dash_fields_decode_to_absent() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.cmtab_add(&entry("/mnt/a", "/dev/sdb2", None, Some("/dev/mapper/a")))
            .unwrap();
        let found = reg.cmtab_get("/dev/sdb2", CmtabField::Container).unwrap().unwrap();
        assert_eq!(found.loop_device, None);
        assert_eq!(found.crypto_device.as_deref(), Some("/dev/mapper/a"));
    }

    #[test]
    fn remove_takes_the_last_match_and_preserves_the_rest() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.cmtab_add(&entry("/mnt/a", "/srv/1.img", None, None)).unwrap();
        reg.cmtab_add(&entry("/mnt/b", "/srv/2.img", None, None)).unwrap();
        reg.cmtab_add(&entry("/mnt/a", "/srv/3.img", None, None)).unwrap();
        reg.cmtab_add(&entry("/mnt/c", "/srv/4.img", None, None)).unwrap();

        assert!(reg.cmtab_remove("/mnt/a", CmtabField::Mountpoint).unwrap());

        let contents = std::fs::read_to_string(dir.path().join("cmtab")).unwrap();
        let containers: Vec<&str> = contents
            .lines()
            .map(|line| line.split('\t').nth(1).unwrap())
            .collect();
        assert_eq!(containers, vec!["/srv/1.img", "/srv/2.img", "/srv/4.img"]);

        // The stack now resolves to the older record.
        let found = reg.cmtab_get("/mnt/a", CmtabField::Mountpoint).unwrap().unwrap();
        assert_eq!(found.container, "/srv/1.img");
    }

    #[test]
    fn remove_without_match_reports_false() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.cmtab_add(&entry("/mnt/a", "/srv/1.img", None, None)).unwrap();
        assert!(!reg.cmtab_remove("/mnt/z", CmtabField::Mountpoint).unwrap());
        let contents = std::fs::read_to_string(dir.path().join("cmtab")).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn fields_with_whitespace_survive_storage() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.cmtab_add(&entry(
            "/mnt/with space",
            "/srv/vol 1/image.bin",
            None,
            Some("/dev/mapper/_srv_vol_1_image_bin"),
        ))
        .unwrap();

        let found = reg
            .cmtab_get("/mnt/with space", CmtabField::Mountpoint)
            .unwrap()
            .unwrap();
        assert_eq!(found.container, "/srv/vol 1/image.bin");

        let raw = std::fs::read_to_string(dir.path().join("cmtab")).unwrap();
        assert!(raw.contains("/mnt/with\\040space"));
    }

    #[test]
    fn smtab_records_use_mtab_format() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        reg.smtab_add("/dev/mapper/x", "/mnt/a", "ext4", "rw").unwrap();
        let raw = std::fs::read_to_string(dir.path().join("mtab")).unwrap();
        assert_eq!(raw, "/dev/mapper/x /mnt/a ext4 rw 0 0\n");

        assert!(reg.smtab_remove("/mnt/a", SmtabField::Mountpoint).unwrap());
        let raw = std::fs::read_to_string(dir.path().join("mtab")).unwrap();
        assert!(raw.is_empty());
    }

    #[test]
    fn read_only_smtab_platform_is_not_supported() {
        let dir = tempdir().unwrap();
        let reg = Registry::with_paths(dir.path().join("cmtab"), None);
        assert!(matches!(
            reg.smtab_add("/dev/x", "/mnt/a", "ext4", "rw"),
            Err(MountError::NotSupported)
        ));
        // Removal is a successful no-op, per the mtab contract.
        assert!(!reg.smtab_remove("/mnt/a", SmtabField::Mountpoint).unwrap());
    }

    #[test]
    fn lookup_on_missing_cmtab_is_not_found() {
        let dir = tempdir().unwrap();
        let reg = registry(&dir);
        assert!(reg.cmtab_get("/mnt/a", CmtabField::Mountpoint).unwrap().is_none());
    }
}
