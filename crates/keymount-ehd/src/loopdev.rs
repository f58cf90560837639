//! Loop device management.
//!
//! cryptsetup wants a block device below it, so file-backed containers
//! are attached to a free loop device first. Allocation goes through
//! `/dev/loop-control`; platforms without it report `NotSupported`.

use keymount_core::error::{MountError, MountResult};
use log::debug;
use nix::errno::Errno;

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::io::AsRawFd;

    const LOOP_CONTROL: &str = "/dev/loop-control";

    const LOOP_SET_FD: libc::c_ulong = 0x4C00;
    const LOOP_CLR_FD: libc::c_ulong = 0x4C01;
    const LOOP_SET_STATUS64: libc::c_ulong = 0x4C04;
    const LOOP_GET_STATUS64: libc::c_ulong = 0x4C05;
    const LOOP_CTL_GET_FREE: libc::c_ulong = 0x4C82;

    const LO_FLAGS_READ_ONLY: u32 = 1;
    const LO_NAME_SIZE: usize = 64;

    /// How often to race for a device before calling the pool exhausted.
    const SETUP_ATTEMPTS: usize = 16;

    /// Kernel ABI for the LOOP_*_STATUS64 ioctls.
    #[repr(C)]
    #[allow(dead_code)]
    pub struct LoopInfo64 {
        lo_device: u64,
        lo_inode: u64,
        lo_rdevice: u64,
        lo_offset: u64,
        lo_sizelimit: u64,
        lo_number: u32,
        lo_encrypt_type: u32,
        lo_encrypt_key_size: u32,
        lo_flags: u32,
        lo_file_name: [u8; LO_NAME_SIZE],
        lo_crypt_name: [u8; LO_NAME_SIZE],
        lo_encrypt_key: [u8; 32],
        lo_init: [u64; 2],
    }

    nix::ioctl_none_bad!(loop_ctl_get_free, LOOP_CTL_GET_FREE);
    nix::ioctl_write_int_bad!(loop_set_fd, LOOP_SET_FD);
    nix::ioctl_none_bad!(loop_clr_fd, LOOP_CLR_FD);
    nix::ioctl_write_ptr_bad!(loop_set_status64, LOOP_SET_STATUS64, LoopInfo64);
    nix::ioctl_read_bad!(loop_get_status64, LOOP_GET_STATUS64, LoopInfo64);

    pub fn loop_setup(filename: &str, readonly: bool) -> MountResult<String> {
        let control = OpenOptions::new()
            .read(true)
            .write(true)
            .open(LOOP_CONTROL)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => MountError::NotSupported,
                _ => MountError::LoopOs(format!("{LOOP_CONTROL}: {e}")),
            })?;

        let backing = OpenOptions::new()
            .read(true)
            .write(!readonly)
            .open(filename)
            .map_err(|e| MountError::LoopOs(format!("{filename}: {e}")))?;

        for _ in 0..SETUP_ATTEMPTS {
            let index = unsafe { loop_ctl_get_free(control.as_raw_fd()) }
                .map_err(|e| MountError::LoopOs(format!("LOOP_CTL_GET_FREE: {e}")))?;
            let device = format!("/dev/loop{index}");

            let node = match OpenOptions::new().read(true).write(true).open(&device) {
                Ok(node) => node,
                // The node may not have materialised yet, or another
                // process may have torn it down; grab a new index.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(MountError::LoopOs(format!("{device}: {e}"))),
            };

            match unsafe { loop_set_fd(node.as_raw_fd(), backing.as_raw_fd()) } {
                Ok(_) => {}
                Err(Errno::EBUSY) => continue,
                Err(e) => return Err(MountError::LoopOs(format!("LOOP_SET_FD: {e}"))),
            }

            let mut info: LoopInfo64 = unsafe { std::mem::zeroed() };
            let name = filename.as_bytes();
            let len = name.len().min(LO_NAME_SIZE - 1);
            info.lo_file_name[..len].copy_from_slice(&name[..len]);
            if readonly {
                info.lo_flags |= LO_FLAGS_READ_ONLY;
            }

            if let Err(e) = unsafe { loop_set_status64(node.as_raw_fd(), &info) } {
                let _ = unsafe { loop_clr_fd(node.as_raw_fd()) };
                return Err(MountError::LoopOs(format!("LOOP_SET_STATUS64: {e}")));
            }

            debug!("attached {filename} to {device}");
            return Ok(device);
        }

        Err(MountError::LoopExhausted)
    }

    pub fn loop_release(device: &str) -> Result<(), Errno> {
        let node = File::open(device)
            .map_err(|e| Errno::from_raw(e.raw_os_error().unwrap_or(libc::EIO)))?;
        unsafe { loop_clr_fd(node.as_raw_fd()) }.map(drop)
    }

    pub fn loop_file(device: &str) -> String {
        let Ok(node) = File::open(device) else {
            return device.to_string();
        };
        let mut info: LoopInfo64 = unsafe { std::mem::zeroed() };
        match unsafe { loop_get_status64(node.as_raw_fd(), &mut info) } {
            Ok(_) => {
                let end = info
                    .lo_file_name
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(LO_NAME_SIZE);
                String::from_utf8_lossy(&info.lo_file_name[..end]).into_owned()
            }
            Err(_) => device.to_string(),
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod imp {
    use super::*;

    pub fn loop_setup(_filename: &str, _readonly: bool) -> MountResult<String> {
        Err(MountError::NotSupported)
    }

    pub fn loop_release(_device: &str) -> Result<(), Errno> {
        Err(Errno::ENOSYS)
    }

    pub fn loop_file(device: &str) -> String {
        device.to_string()
    }
}

/// Associate `filename` with a free loop device and return its path.
/// Exhaustion of the device pool is distinct from other OS errors.
pub fn loop_setup(filename: &str, readonly: bool) -> MountResult<String> {
    imp::loop_setup(filename, readonly)
}

/// Detach a loop device. The caller decides which errnos to forgive;
/// ENXIO (nothing attached) and ENOTTY (not a loop device) commonly
/// count as success on teardown.
pub fn loop_release(device: &str) -> Result<(), Errno> {
    imp::loop_release(device)
}

/// Resolve a loop device back to its backing file via a status query.
/// Anything that is not a loop device comes back unchanged.
pub fn loop_file(device: &str) -> String {
    imp::loop_file(device)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loop_file_echoes_non_loop_paths() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not a device").unwrap();
        let path = file.path().to_str().unwrap();
        assert_eq!(loop_file(path), path);
        assert_eq!(loop_file("/nonexistent/loop0"), "/nonexistent/loop0");
    }

    #[test]
    fn releasing_a_regular_file_is_not_a_tty() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = loop_release(file.path().to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Errno::ENOTTY | Errno::ENOSYS), "{err}");
    }

    #[test]
    fn releasing_a_missing_device_reports_the_errno() {
        let err = loop_release("/nonexistent/loop0").unwrap_err();
        assert!(matches!(err, Errno::ENOENT | Errno::ENOSYS), "{err}");
    }

    #[test]
    fn setup_on_missing_backing_file_fails_cleanly() {
        match loop_setup("/nonexistent/container.img", true) {
            Err(MountError::LoopOs(_)) | Err(MountError::NotSupported) => {}
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
