//! Mount/unmount controller.
//!
//! For a single volume this decides whether anything needs doing at all,
//! prepares the mountpoint and the filesystem key, expands the configured
//! helper command, runs it with the key on stdin, and records encrypted
//! layer stacks in the registry so that logout can unwind them.

use crate::config::Config;
use crate::engine::{EhdEngine, EhdInfo, EhdRequest};
use crate::error::{MountError, MountResult};
use crate::escape;
use crate::keyfile;
use crate::mtab::{CmtabEntry, CmtabField, Registry, SmtabField};
use crate::spawn::{self, Identity, Pipes};
use crate::template::Expander;
use crate::volume::{Volume, VolumeKind, MAX_PAR};
use log::{debug, info, warn};
use nix::unistd::{seteuid, Uid, User};
use std::collections::HashMap;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Drives mounts and unmounts for validated volume records.
pub struct Mounter<'a> {
    config: &'a Config,
    engine: &'a dyn EhdEngine,
    registry: Registry,
}

impl<'a> Mounter<'a> {
    pub fn new(config: &'a Config, engine: &'a dyn EhdEngine) -> Self {
        Self {
            config,
            engine,
            registry: Registry::from_override(config.cmtab_path()),
        }
    }

    /// Replace the registry handle (tests point it at a tempdir).
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    /// Mount one volume using the authentication password.
    ///
    /// "Already mounted" is success. The password may be empty but is
    /// always required; it either unlocks the filesystem keyfile or is
    /// itself the key.
    pub fn mount(&self, vol: &mut Volume, password: &str) -> MountResult<()> {
        vol.validate()?;
        let mut vars = self.build_vars(vol);
        if self.config.debug {
            log_volume(vol);
        }

        match self.already_mounted(vol) {
            Ok(true) => {
                info!(
                    "{} already seems to be mounted at {}, skipping",
                    vol.volume, vol.mountpoint
                );
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => {
                warn!(
                    "could not determine if {} is already mounted: {e}",
                    vol.volume
                );
                return Err(e);
            }
        }

        if !Path::new(&vol.mountpoint).exists() {
            if !self.config.mkmountpoint {
                return Err(MountError::MountpointCreate {
                    path: vol.mountpoint.clone(),
                    reason: "does not exist and mountpoint creation is disabled".into(),
                });
            }
            self.mkmountpoint(vol)?;
        }

        let key = stage_key(vol, password)?;

        // Encrypted containers get their loop + crypto stack built first;
        // the mount helper then operates on the crypto device.
        let ehd_info = if vol.kind.is_crypt_container() {
            let info = self.engine.load(&ehd_request(vol), &key)?;
            vars.insert("CRYPTODEV".to_string(), info.crypto_device.clone());
            Some(info)
        } else {
            None
        };

        if vol.kind == VolumeKind::Local {
            match self.check_filesystem(vol, &mut vars, &key) {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    warn!("error checking filesystem but will continue");
                }
            }
        }

        let mut templates: Vec<&[String]> = Vec::new();
        if vol.uses_ssh {
            templates.push(&self.config.commands.fd0ssh);
        }
        templates.push(self.config.commands.mount_for(vol.kind));

        let wants_stdin = vol.kind != VolumeKind::Nfs;
        let identity = mount_identity(vol);
        let envs: &[(&str, &str)] = if matches!(vol.kind, VolumeKind::Smb | VolumeKind::Cifs) {
            &[("PASSWD_FD", "0")]
        } else {
            &[]
        };

        let result = expand_argv(&vars, &templates)
            .and_then(|argv| self.run_mount_helper(&argv, wants_stdin, &identity, envs, &key));
        drop(key);

        match result {
            Ok(()) => {}
            Err(e) => {
                if let Some(info) = &ehd_info {
                    // Roll the crypto stack back; the filesystem never
                    // appeared.
                    if let Err(unload_err) = self.engine.unload(info) {
                        warn!(
                            "could not roll back crypto stack for {}: {unload_err}",
                            info.container
                        );
                    }
                }
                return Err(e);
            }
        }

        if let Some(info) = &ehd_info {
            self.record_crypt_mount(vol, info);
        }

        Ok(())
    }

    /// Unmount one volume, remove a created mountpoint if configured to,
    /// and unwind any recorded crypto stack.
    pub fn unmount(&self, vol: &Volume) -> MountResult<()> {
        let vars = self.build_vars(vol);
        let argv = expand_argv(&vars, &[self.config.commands.umount_for(vol.kind)])?;

        let helper_result = (|| -> MountResult<()> {
            let mut helper = spawn::spawn(
                &argv,
                Pipes {
                    stderr: true,
                    ..Pipes::default()
                },
                &mount_identity(vol),
                &[],
            )?;
            if let Some(stderr) = helper.stderr() {
                spawn::log_output(stderr, Some("umount errors:"));
            }
            debug!("waiting for umount");
            let status = helper.wait()?;
            if status != 0 {
                return Err(MountError::UnmountHelper(status));
            }
            Ok(())
        })();

        // The mountpoint is removed even when the helper complained,
        // matching the teardown the login stack expects.
        if self.config.mkmountpoint && self.config.rmdir_mntpt && vol.created_mntpt {
            if let Err(e) = std::fs::remove_dir(&vol.mountpoint) {
                warn!("could not remove {}: {e}", vol.mountpoint);
            }
        }

        helper_result?;

        if vol.kind.is_crypt_container() {
            self.teardown_crypt(vol)?;
        }
        Ok(())
    }

    fn run_mount_helper(
        &self,
        argv: &[String],
        wants_stdin: bool,
        identity: &Identity,
        envs: &[(&str, &str)],
        key: &[u8],
    ) -> MountResult<()> {
        let mut helper = spawn::spawn(
            argv,
            Pipes {
                stdin: wants_stdin,
                stdout: false,
                stderr: true,
            },
            identity,
            envs,
        )?;

        if wants_stdin {
            if let Some(stdin) = helper.stdin() {
                if let Err(e) = spawn::pipewrite(stdin, key) {
                    warn!("error sending password to mount: {e}");
                }
            }
        }
        if let Some(stderr) = helper.stderr() {
            spawn::log_output(stderr, Some("mount errors:"));
        }

        debug!("waiting for mount");
        let status = helper.wait()?;
        if status != 0 {
            return Err(MountError::MountHelper(status));
        }
        Ok(())
    }

    /// Build the substitution map: every process environment variable,
    /// then the volume-derived fillers.
    fn build_vars(&self, vol: &Volume) -> HashMap<String, String> {
        let mut vars: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();

        let now = chrono::Local::now();
        vars.insert("DAY".to_string(), now.format("%d").to_string());
        vars.insert("MONTH".to_string(), now.format("%B").to_string());
        vars.insert("YEAR".to_string(), now.format("%Y").to_string());

        vars.insert("MNTPT".to_string(), vol.mountpoint.clone());
        vars.insert("FSCKLOOP".to_string(), self.config.fsckloop.clone());
        vars.insert("FSTYPE".to_string(), vol.fstype.clone());
        vars.insert("VOLUME".to_string(), vol.volume.clone());
        vars.insert("SERVER".to_string(), vol.server.clone());
        vars.insert("USER".to_string(), relookup_user(&vol.user));
        vars.insert("OPTIONS".to_string(), vol.options_string());

        match User::from_name(&vol.user) {
            Ok(Some(user)) => {
                vars.insert("USERUID".to_string(), user.uid.as_raw().to_string());
                vars.insert("USERGID".to_string(), user.gid.as_raw().to_string());
            }
            Ok(None) | Err(_) => {
                warn!("could not look up user {}", vol.user);
            }
        }

        vars
    }

    /// Whether the volume already shows up in the kernel mount list.
    ///
    /// Loop-backed entries are resolved back to their backing file, since
    /// a mount list sourced from the kernel shows the loop device rather
    /// than the container. Share names compare case-insensitively for
    /// SMB-family mounts.
    fn already_mounted(&self, vol: &Volume) -> MountResult<bool> {
        let dev = vol_to_dev(vol);
        let real_mpt = std::fs::canonicalize(&vol.mountpoint)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| vol.mountpoint.clone());

        debug!(
            "checking to see if {dev} is already mounted at {}",
            vol.mountpoint
        );

        let contents = std::fs::read_to_string(&self.config.mounts_path)?;
        for line in contents.lines() {
            let mut fields = line.split_whitespace();
            let (Some(fsname), Some(dir)) = (fields.next(), fields.next()) else {
                continue;
            };
            let mut fsname = escape::decode_str(fsname);
            let dir = escape::decode_str(dir);

            if is_loop_device(&fsname) {
                fsname = self.engine.loop_file(&fsname);
            }

            let name_matches = if vol.kind.case_insensitive_fsname() {
                fsname.eq_ignore_ascii_case(&dev)
            } else {
                fsname == dev
            };
            if name_matches && (dir == vol.mountpoint || dir == real_mpt) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Create the mountpoint, preferably under the target user's
    /// identity (NFS root-squash needs this when the parent lives in the
    /// user's home). Falls back to creating as root and chowning over.
    fn mkmountpoint(&self, vol: &mut Volume) -> MountResult<()> {
        let user = User::from_name(&vol.user)
            .ok()
            .flatten()
            .ok_or_else(|| MountError::MountpointCreate {
                path: vol.mountpoint.clone(),
                reason: format!("could not determine uid for {}", vol.user),
            })?;

        debug!("creating mount point {}", vol.mountpoint);
        let _restore = EuidGuard;
        let path = PathBuf::from(&vol.mountpoint);

        let created_as_user =
            seteuid(user.uid).is_ok() && mkdir_chain(&path, &user).is_ok();
        if !created_as_user {
            let _ = seteuid(Uid::from_raw(0));
            mkdir_chain(&path, &user).map_err(|e| MountError::MountpointCreate {
                path: vol.mountpoint.clone(),
                reason: e.to_string(),
            })?;
        }

        vol.created_mntpt = true;
        Ok(())
    }

    /// Preflight filesystem check for local volumes. Loop-backed
    /// containers are attached to the reserved fsck loop device first.
    /// An exit status of 1 means errors were corrected and passes.
    fn check_filesystem(
        &self,
        vol: &Volume,
        vars: &mut HashMap<String, String>,
        key: &[u8],
    ) -> MountResult<bool> {
        if vol.has_option("bind") || vol.has_option("move") {
            return Ok(true);
        }
        if fstype_nodev(&vol.fstype) != Some(false) {
            return Ok(true);
        }

        let looped = vol.has_option("loop");
        if looped {
            if let Some(cipher) = vol.option("encryption") {
                vars.insert("CIPHER".to_string(), cipher.to_string());
                if let Some(keybits) = vol.option("keybits") {
                    vars.insert("KEYBITS".to_string(), keybits.to_string());
                }
            }
            if !self.run_losetup(vars, key)? {
                return Ok(false);
            }
            vars.insert("FSCKTARGET".to_string(), self.config.fsckloop.clone());
        } else {
            debug!("volume not a loopback (options: {})", vol.options_string());
            vars.insert("FSCKTARGET".to_string(), vol.volume.clone());
        }

        let argv = expand_argv(vars, &[&self.config.commands.fsck])?;
        let mut helper = spawn::spawn(
            &argv,
            Pipes {
                stdin: false,
                stdout: true,
                stderr: true,
            },
            &Identity::Root,
            &[],
        )?;
        // Both streams must drain at once: fsck can fill one pipe while
        // we would otherwise block reading the other to EOF.
        let stdout_reader = helper
            .stdout()
            .map(|stdout| std::thread::spawn(move || spawn::log_output(stdout, None)));
        if let Some(stderr) = helper.stderr() {
            spawn::log_output(stderr, None);
        }
        if let Some(reader) = stdout_reader {
            let _ = reader.join();
        }
        debug!("waiting for filesystem check");
        let status = helper.wait()?;

        if looped {
            self.run_unlosetup(vars)?;
        }

        Ok(status == 0 || status == 1)
    }

    fn run_losetup(&self, vars: &HashMap<String, String>, key: &[u8]) -> MountResult<bool> {
        let argv = expand_argv(vars, &[&self.config.commands.losetup])?;
        let mut helper = spawn::spawn(
            &argv,
            Pipes {
                stdin: true,
                stdout: false,
                stderr: true,
            },
            &Identity::Root,
            &[],
        )?;
        if let Some(stdin) = helper.stdin() {
            if let Err(e) = spawn::pipewrite(stdin, key) {
                warn!("error sending password to losetup: {e}");
            }
        }
        if let Some(stderr) = helper.stderr() {
            spawn::log_output(stderr, Some("losetup errors:"));
        }
        debug!("waiting for losetup");
        Ok(helper.wait()? == 0)
    }

    fn run_unlosetup(&self, vars: &HashMap<String, String>) -> MountResult<bool> {
        let argv = expand_argv(vars, &[&self.config.commands.unlosetup])?;
        let helper = spawn::spawn(&argv, Pipes::default(), &Identity::Root, &[])?;
        debug!("waiting for losetup delete");
        Ok(helper.wait()? == 0)
    }

    /// Record a freshly mounted crypto stack. A registry failure is
    /// logged but does not unmount: a live mount the registry does not
    /// know about beats churning the user's data.
    fn record_crypt_mount(&self, vol: &Volume, info: &EhdInfo) {
        let entry = CmtabEntry {
            mountpoint: vol.mountpoint.clone(),
            container: info.container.clone(),
            loop_device: info.loop_device.clone(),
            crypto_device: Some(info.crypto_device.clone()),
        };
        if let Err(e) = self.registry.cmtab_add(&entry) {
            warn!("could not record {} in cmtab: {e}", vol.mountpoint);
        }
        match self.registry.smtab_add(
            &info.crypto_device,
            &vol.mountpoint,
            &vol.fstype,
            &vol.options_string(),
        ) {
            Ok(()) | Err(MountError::NotSupported) => {}
            Err(e) => warn!("could not update system mtab: {e}"),
        }
    }

    /// Find the recorded layer stack for a mountpoint and unwind it.
    fn teardown_crypt(&self, vol: &Volume) -> MountResult<()> {
        let entry = match self.registry.cmtab_get(&vol.mountpoint, CmtabField::Mountpoint)? {
            Some(entry) => entry,
            None => {
                warn!("no cmtab record for {}; nothing to unwind", vol.mountpoint);
                return Ok(());
            }
        };

        if let Some(crypto_device) = &entry.crypto_device {
            let info = EhdInfo {
                container: entry.container.clone(),
                lower_device: entry
                    .loop_device
                    .clone()
                    .unwrap_or_else(|| entry.container.clone()),
                loop_device: entry.loop_device.clone(),
                crypto_name: basename(crypto_device).to_string(),
                crypto_device: crypto_device.clone(),
            };
            if let Err(e) = self.engine.unload(&info) {
                warn!("could not unwind crypto stack for {}: {e}", vol.mountpoint);
            }
        }

        if let Err(e) = self.registry.cmtab_remove(&vol.mountpoint, CmtabField::Mountpoint) {
            warn!("could not drop cmtab record for {}: {e}", vol.mountpoint);
        }
        match self
            .registry
            .smtab_remove(&vol.mountpoint, SmtabField::Mountpoint)
        {
            Ok(_) => {}
            Err(e) => warn!("could not update system mtab: {e}"),
        }
        Ok(())
    }
}

/// Expand helper argv templates over the variable map. Any placeholder
/// parse error fails the whole expansion; a command line missing pieces
/// must never reach exec.
fn expand_argv(vars: &HashMap<String, String>, templates: &[&[String]]) -> MountResult<Vec<String>> {
    let mut expander = Expander::new(vars);
    let mut argv = Vec::new();
    for template in templates {
        argv.extend(expander.arglist(template));
    }

    let errors = expander.drain_errors();
    if !errors.is_empty() {
        return Err(MountError::TemplateExpand(errors.join("; ")));
    }
    Ok(argv)
}

/// Restores root's effective uid when dropped.
struct EuidGuard;

impl Drop for EuidGuard {
    fn drop(&mut self) {
        let _ = seteuid(Uid::from_raw(0));
    }
}

/// The device name this volume would occupy in the kernel mount list.
fn vol_to_dev(vol: &Volume) -> String {
    match vol.kind {
        VolumeKind::Smb | VolumeKind::Cifs => format!("//{}/{}", vol.server, vol.volume),
        VolumeKind::Ncp => format!(
            "{}/{}",
            vol.server,
            vol.option("user").unwrap_or(&vol.user)
        ),
        VolumeKind::Nfs => format!("{}:{}", vol.server, vol.volume),
        VolumeKind::Crypt => format!("/dev/mapper/{}", mangle_name(&vol.volume)),
        _ => vol.volume.clone(),
    }
}

/// dm-crypt mapping names accept only alphanumerics and underscores.
fn mangle_name(path: &str) -> String {
    path.chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

fn ehd_request(vol: &Volume) -> EhdRequest {
    EhdRequest {
        container: vol.volume.clone(),
        mountpoint: vol.mountpoint.clone(),
        fs_cipher: vol.option("cipher").map(str::to_string),
        fs_hash: vol.option("hash").map(str::to_string),
        trunc_keysize: vol.option("trunc_keysize").and_then(|v| v.parse().ok()),
        readonly: vol.readonly || vol.has_option("ro"),
    }
}

/// Stage the binary filesystem key: decrypt the keyfile when a cipher is
/// configured, otherwise the password itself is the key (capped at
/// MAX_PAR bytes).
fn stage_key(vol: &Volume, password: &str) -> MountResult<Zeroizing<Vec<u8>>> {
    if !vol.fs_key_cipher.is_empty() {
        debug!(
            "decrypting FS key using system auth token and {}",
            vol.fs_key_cipher
        );
        return keyfile::decrypt_keyfile(
            &vol.fs_key_path,
            &vol.fs_key_hash,
            &vol.fs_key_cipher,
            password.as_bytes(),
        );
    }
    let bytes = password.as_bytes();
    let cap = bytes.len().min(MAX_PAR);
    Ok(Zeroizing::new(bytes[..cap].to_vec()))
}

/// FUSE helpers run as the user; everything else keeps root.
fn mount_identity(vol: &Volume) -> Identity {
    if vol.kind == VolumeKind::Fuse || vol.fstype == "fuse" {
        Identity::User(vol.user.clone())
    } else {
        Identity::Root
    }
}

/// Re-resolve the username through the user database, so directory
/// services with case-insensitive names normalise to the stored form.
fn relookup_user(name: &str) -> String {
    match User::from_name(name) {
        Ok(Some(user)) => user.name,
        _ => name.to_string(),
    }
}

/// Create `dir` and any missing parents with mode 0711, owned by `user`.
/// The vfsmount root overrides the mode once mounted; the execute bits
/// keep root-squashed CIFS traversal working in the meantime.
fn mkdir_chain(dir: &Path, user: &User) -> std::io::Result<()> {
    let mut missing = Vec::new();
    let mut cursor = dir;
    while !cursor.exists() {
        missing.push(cursor.to_path_buf());
        cursor = cursor.parent().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "no existing ancestor")
        })?;
    }

    for component in missing.iter().rev() {
        std::fs::DirBuilder::new().mode(0o711).create(component)?;
        nix::unistd::chown(component.as_path(), Some(user.uid), Some(user.gid))
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
    }
    Ok(())
}

/// Whether `path` is a loop block device (and so needs resolving back to
/// its backing file before comparison).
#[cfg(target_os = "linux")]
fn is_loop_device(path: &str) -> bool {
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    const LOOP_MAJOR: u64 = 7;

    match std::fs::metadata(path) {
        Ok(meta) => {
            meta.file_type().is_block_device() && libc::major(meta.rdev()) as u64 == LOOP_MAJOR
        }
        Err(_) => false,
    }
}

#[cfg(not(target_os = "linux"))]
fn is_loop_device(_path: &str) -> bool {
    false
}

/// Whether a filesystem type needs no backing block device, per the
/// kernel's own list. `None` when the type is not listed at all.
fn fstype_nodev(name: &str) -> Option<bool> {
    let contents = std::fs::read_to_string("/proc/filesystems").ok()?;
    for line in contents.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(flag), Some(fstype)) if fstype.eq_ignore_ascii_case(name) => {
                return Some(flag.eq_ignore_ascii_case("nodev"));
            }
            (Some(fstype), None) if fstype.eq_ignore_ascii_case(name) => {
                return Some(false);
            }
            _ => {}
        }
    }
    None
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn log_volume(vol: &Volume) {
    debug!("information for mount:");
    debug!("----------------------");
    debug!(
        "(defined by {})",
        if vol.globalconf {
            "globalconf"
        } else {
            "luserconf"
        }
    );
    debug!("user:          {}", vol.user);
    debug!("server:        {}", vol.server);
    debug!("volume:        {}", vol.volume);
    debug!("mountpoint:    {}", vol.mountpoint);
    debug!("options:       {}", vol.options_string());
    debug!("fs_key_cipher: {}", vol.fs_key_cipher);
    debug!("fs_key_path:   {}", vol.fs_key_path);
    debug!("----------------------");
}
