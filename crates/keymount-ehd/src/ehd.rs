//! EHD orchestrator: compose the loop and crypto layers into a single
//! load/unload primitive.

use crate::crypto::{crypto_name, CryptsetupRunner};
use crate::loopdev;
use keymount_core::engine::{EhdEngine, EhdInfo, EhdRequest};
use keymount_core::error::{MountError, MountResult};
use log::{debug, warn};
use nix::errno::Errno;
use std::os::unix::fs::FileTypeExt;

/// dm-crypt/LUKS implementation of the engine contract.
#[derive(Debug, Clone)]
pub struct DmcryptEngine {
    cryptsetup: CryptsetupRunner,
}

impl DmcryptEngine {
    /// Engine using the host `cryptsetup`.
    pub fn new() -> MountResult<Self> {
        Ok(Self {
            cryptsetup: CryptsetupRunner::resolve()?,
        })
    }

    /// Engine over an explicit helper binary (tests use fakes).
    pub fn with_runner(cryptsetup: CryptsetupRunner) -> Self {
        Self { cryptsetup }
    }
}

impl EhdEngine for DmcryptEngine {
    fn load(&self, req: &EhdRequest, key: &[u8]) -> MountResult<EhdInfo> {
        let meta = std::fs::metadata(&req.container)?;

        let (lower_device, loop_device) = if meta.file_type().is_block_device() {
            (req.container.clone(), None)
        } else {
            debug!("setting up loop device for file {}", req.container);
            let device = loopdev::loop_setup(&req.container, req.readonly)?;
            debug!("using {device}");
            (device.clone(), Some(device))
        };

        let name = crypto_name(&req.container);
        debug!("using {name} as dm device name");
        let info = EhdInfo {
            container: req.container.clone(),
            lower_device,
            loop_device,
            crypto_name: name.clone(),
            crypto_device: format!("/dev/mapper/{name}"),
        };

        let key = match req.trunc_keysize {
            Some(limit) => &key[..key.len().min(limit)],
            None => key,
        };

        let result = self.cryptsetup.is_luks(&info.lower_device).and_then(|luks| {
            self.cryptsetup.open(
                luks,
                &info.lower_device,
                &info.crypto_name,
                req.fs_cipher.as_deref(),
                req.fs_hash.as_deref().unwrap_or("plain"),
                req.readonly,
                key,
            )
        });

        if let Err(e) = result {
            if let Some(device) = &info.loop_device {
                if let Err(release_err) = loopdev::loop_release(device) {
                    warn!("could not release {device}: {release_err}");
                }
            }
            return Err(e);
        }

        Ok(info)
    }

    fn unload(&self, info: &EhdInfo) -> MountResult<()> {
        let lower = self
            .cryptsetup
            .status_backing_device(&info.crypto_name)
            .unwrap_or_else(|e| {
                warn!("could not query status of {}: {e}", info.crypto_name);
                None
            })
            .or_else(|| info.loop_device.clone())
            .unwrap_or_else(|| info.lower_device.clone());

        self.cryptsetup.remove(&info.crypto_name)?;

        let bare_blockdev = info.loop_device.is_none() && info.lower_device == info.container;
        if !bare_blockdev {
            match loopdev::loop_release(&lower) {
                // Not assigned or not a loop device both mean there is
                // nothing left to detach.
                Ok(()) | Err(Errno::ENXIO) | Err(Errno::ENOTTY) => {}
                Err(e) => {
                    return Err(MountError::LoopOs(format!(
                        "could not release {lower}: {e}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn is_luks(&self, path: &str, blkdev_assured: bool) -> MountResult<bool> {
        if blkdev_assured {
            return self.cryptsetup.is_luks(path);
        }

        // cryptsetup wants a block device; arrange a transient read-only
        // loop for the duration of the probe.
        let device = loopdev::loop_setup(path, true)?;
        let verdict = self.cryptsetup.is_luks(&device);
        if let Err(e) = loopdev::loop_release(&device) {
            warn!("could not release probe loop {device}: {e}");
        }
        verdict
    }

    fn loop_file(&self, device: &str) -> String {
        loopdev::loop_file(device)
    }
}
