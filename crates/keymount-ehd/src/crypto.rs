//! Execution wrapper for invoking `cryptsetup`.
//!
//! Keeping the helper invocation isolated here keeps the orchestration
//! logic testable against fake binaries with deterministic stdout.

use keymount_core::error::{MountError, MountResult};
use keymount_core::spawn::{self, Identity, Pipes};
use log::{debug, warn};
use std::env;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

const KNOWN_CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];

/// Derive the crypto mapping short name from a container path. The
/// device-mapper target accepts only alphanumerics and underscores.
pub fn crypto_name(container: &str) -> String {
    container
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// Wrapper around one resolved `cryptsetup` binary.
#[derive(Debug, Clone)]
pub struct CryptsetupRunner {
    binary: PathBuf,
}

impl CryptsetupRunner {
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Locate the host binary: well-known locations first, then PATH.
    pub fn resolve() -> MountResult<Self> {
        for candidate in KNOWN_CRYPTSETUP_PATHS {
            let path = Path::new(candidate);
            if path.exists() {
                return Ok(Self::new(path.to_path_buf()));
            }
        }

        find_in_path("cryptsetup").map(Self::new).ok_or_else(|| {
            MountError::CryptoHelper(format!(
                "unable to locate cryptsetup; tried {KNOWN_CRYPTSETUP_PATHS:?} and PATH"
            ))
        })
    }

    /// `cryptsetup isLuks <path>`: exit 0 means a LUKS header is
    /// present, any other clean exit means plain dm-crypt.
    pub fn is_luks(&self, path: &str) -> MountResult<bool> {
        let argv = self.argv(&["isLuks", path]);
        let helper = spawn::spawn(&argv, Pipes::default(), &Identity::Root, &[])?;
        match helper.wait()? {
            0 => Ok(true),
            status if status > 0 => Ok(false),
            status => Err(MountError::CryptoHelper(format!(
                "isLuks terminated abnormally ({status})"
            ))),
        }
    }

    /// Open a crypto mapping, feeding the raw key bytes on stdin.
    ///
    /// LUKS containers use `luksOpen`; plain dm-crypt uses `create` with
    /// explicit cipher and hash and `--key-file=-`.
    pub fn open(
        &self,
        luks: bool,
        lower: &str,
        name: &str,
        cipher: Option<&str>,
        hash: &str,
        readonly: bool,
        key: &[u8],
    ) -> MountResult<()> {
        let mut args: Vec<&str> = Vec::with_capacity(10);
        if readonly {
            args.push("--readonly");
        }
        if let Some(cipher) = cipher {
            args.push("-c");
            args.push(cipher);
        }
        if luks {
            args.push("luksOpen");
            args.push(lower);
            args.push(name);
        } else {
            args.push("--key-file=-");
            args.push("-h");
            args.push(hash);
            args.push("create");
            args.push(name);
            args.push(lower);
        }

        let argv = self.argv(&args);
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
                warn!("password send error: {e}");
            }
        }
        if let Some(stderr) = helper.stderr() {
            spawn::log_output(stderr, Some("cryptsetup errors:"));
        }

        let status = helper.wait()?;
        if status != 0 {
            return Err(MountError::CryptoHelper(format!(
                "cryptsetup exited with non-zero status {status}"
            )));
        }
        Ok(())
    }

    /// `cryptsetup remove <name>`.
    pub fn remove(&self, name: &str) -> MountResult<()> {
        let argv = self.argv(&["remove", name]);
        let helper = spawn::spawn(&argv, Pipes::default(), &Identity::Root, &[])?;
        let status = helper.wait()?;
        if status != 0 {
            return Err(MountError::CryptoHelper(format!(
                "could not remove mapping {name}: cryptsetup exited with {status}"
            )));
        }
        Ok(())
    }

    /// Ask `cryptsetup status` for the device backing a mapping. The
    /// kernel's view is authoritative even when the caller lost track of
    /// the loop device it set up.
    pub fn status_backing_device(&self, name: &str) -> MountResult<Option<String>> {
        let argv = self.argv(&["status", name]);
        let mut helper = spawn::spawn(
            &argv,
            Pipes {
                stdin: false,
                stdout: true,
                stderr: false,
            },
            &Identity::Root,
            &[],
        )?;

        let mut device = None;
        if let Some(stdout) = helper.stdout() {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                // dm-crypt does not allow whitespace in backing paths.
                let line = line.trim();
                if let Some(value) = line.strip_prefix("device:") {
                    device = Some(value.trim().to_string());
                    break;
                }
            }
        }
        let status = helper.wait()?;
        debug!("cryptsetup status {name} exited with {status}");
        Ok(device)
    }

    fn argv(&self, args: &[&str]) -> Vec<String> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(self.binary.display().to_string());
        argv.extend(args.iter().map(|s| s.to_string()));
        argv
    }
}

fn find_in_path(binary: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    env::split_paths(&paths).find_map(|dir| {
        let candidate = dir.join(binary);
        if candidate.exists() {
            Some(candidate)
        } else {
            None
        }
    })
}
