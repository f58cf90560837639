//! Helper process spawning.
//!
//! Children get a fresh session, a known working directory and PATH, and
//! optionally the target user's identity. SIGCHLD is reset for the
//! duration of each spawn and SIGPIPE is ignored around key writes, with
//! the previous dispositions restored afterwards; the host application
//! (an authentication stack, typically) may have installed its own.

use crate::error::{MountError, MountResult};
use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::User;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};

/// PATH forced into every child.
const SAFE_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Who the child should run as.
#[derive(Debug, Clone)]
pub enum Identity {
    /// Keep (or regain) root.
    Root,
    /// Drop to this user: setgid, then setuid, with HOME and USER set.
    User(String),
}

/// Which pipes the caller wants back.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pipes {
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
}

/// Restores the saved SIGPIPE disposition when dropped.
pub struct SigPipeGuard {
    saved: SigAction,
}

impl SigPipeGuard {
    /// Ignore SIGPIPE until the guard drops, so a helper that exits
    /// before reading its key does not kill us.
    pub fn ignore() -> MountResult<Self> {
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let saved = unsafe { sigaction(Signal::SIGPIPE, &ignore) }
            .map_err(|e| MountError::SpawnFailed {
                command: "sigaction".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { saved })
    }
}

impl Drop for SigPipeGuard {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(Signal::SIGPIPE, &self.saved) };
    }
}

/// Restores the saved SIGCHLD disposition when dropped.
struct SigChldGuard {
    saved: SigAction,
}

impl SigChldGuard {
    fn reset() -> MountResult<Self> {
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let saved = unsafe { sigaction(Signal::SIGCHLD, &dfl) }
            .map_err(|e| MountError::SpawnFailed {
                command: "sigaction".into(),
                reason: e.to_string(),
            })?;
        Ok(Self { saved })
    }
}

impl Drop for SigChldGuard {
    fn drop(&mut self) {
        let _ = unsafe { sigaction(Signal::SIGCHLD, &self.saved) };
    }
}

/// A running helper and the pipes requested for it. Waiting consumes the
/// handle and restores the SIGCHLD disposition.
pub struct Helper {
    command: String,
    child: Child,
    _sigchld: SigChldGuard,
}

impl Helper {
    pub fn stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    pub fn stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Wait for the helper and return its exit status (-1 when killed by
    /// a signal).
    pub fn wait(mut self) -> MountResult<i32> {
        let status = self.child.wait().map_err(|e| MountError::SpawnFailed {
            command: self.command.clone(),
            reason: e.to_string(),
        })?;
        Ok(status.code().unwrap_or(-1))
    }
}

/// Spawn `argv` with the requested pipes, identity, and extra
/// environment variables.
///
/// The child calls `setsid()` and `chdir("/")` before exec so daemons
/// (FUSE helpers especially) detach from the login session and do not pin
/// an unreadable working directory.
pub fn spawn(
    argv: &[String],
    pipes: Pipes,
    identity: &Identity,
    envs: &[(&str, &str)],
) -> MountResult<Helper> {
    let Some(program) = argv.first() else {
        return Err(MountError::SpawnFailed {
            command: String::new(),
            reason: "empty argument vector".into(),
        });
    };

    log_argv(argv);

    let mut command = Command::new(program);
    command.args(&argv[1..]);
    command.env("PATH", SAFE_PATH);
    for (key, value) in envs {
        command.env(key, value);
    }
    command.stdin(stdio(pipes.stdin));
    command.stdout(stdio(pipes.stdout));
    command.stderr(stdio(pipes.stderr));

    let drop_to = match identity {
        Identity::Root => None,
        Identity::User(name) => {
            let user = User::from_name(name)
                .map_err(|e| MountError::SpawnFailed {
                    command: program.clone(),
                    reason: format!("user lookup for {name}: {e}"),
                })?
                .ok_or_else(|| MountError::SpawnFailed {
                    command: program.clone(),
                    reason: format!("no such user: {name}"),
                })?;
            command.env("HOME", &user.dir);
            command.env("USER", &user.name);
            Some((user.uid.as_raw(), user.gid.as_raw()))
        }
    };

    unsafe {
        command.pre_exec(move || {
            libc::setsid();
            if libc::chdir(b"/\0".as_ptr().cast()) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            match drop_to {
                Some((uid, gid)) => {
                    if libc::setgid(gid) != 0 || libc::setuid(uid) != 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                None => {
                    // Best effort: we normally already run as root.
                    let _ = libc::setuid(0);
                }
            }
            Ok(())
        });
    }

    let sigchld = SigChldGuard::reset()?;
    let child = command.spawn().map_err(|e| MountError::SpawnFailed {
        command: program.clone(),
        reason: e.to_string(),
    })?;

    Ok(Helper {
        command: program.clone(),
        child,
        _sigchld: sigchld,
    })
}

/// Write key material down a pipe with SIGPIPE masked, then close it.
/// A reader that exited early surfaces as an error for the caller to log.
pub fn pipewrite(mut writer: ChildStdin, data: &[u8]) -> MountResult<()> {
    let _guard = SigPipeGuard::ignore()?;
    writer.write_all(data)?;
    writer.flush()?;
    drop(writer);
    Ok(())
}

/// Drain a helper's output and log it line by line. The header only
/// appears when the helper actually produced output.
pub fn log_output<R: Read>(reader: R, header: Option<&str>) {
    let mut lines = BufReader::new(reader).lines();
    if let Some(Ok(first)) = lines.next() {
        if let Some(header) = header {
            warn!("{header}");
        }
        warn!("{first}");
        for line in lines.map_while(Result::ok) {
            warn!("{line}");
        }
    }
}

fn log_argv(argv: &[String]) {
    if log::log_enabled!(log::Level::Debug) {
        let mut line = String::new();
        for (idx, arg) in argv.iter().enumerate() {
            if idx == 0 {
                line.push_str(arg);
            } else {
                line.push_str(&format!(" [{arg}]"));
            }
        }
        debug!("command: {line}");
    }
}

fn stdio(piped: bool) -> Stdio {
    if piped {
        Stdio::piped()
    } else {
        Stdio::inherit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn captures_exit_status() {
        let helper = spawn(
            &args(&["sh", "-c", "exit 3"]),
            Pipes::default(),
            &Identity::Root,
            &[],
        )
        .unwrap();
        assert_eq!(helper.wait().unwrap(), 3);
    }

    #[test]
    fn feeds_stdin_and_reads_stdout() {
        let mut helper = spawn(
            &args(&["sh", "-c", "tr a-z A-Z"]),
            Pipes {
                stdin: true,
                stdout: true,
                stderr: false,
            },
            &Identity::Root,
            &[],
        )
        .unwrap();

        pipewrite(helper.stdin().unwrap(), b"fskey").unwrap();
        let mut out = String::new();
        helper.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "FSKEY");
        assert_eq!(helper.wait().unwrap(), 0);
    }

    #[test]
    fn pipewrite_survives_early_reader_exit() {
        let mut helper = spawn(
            &args(&["sh", "-c", "exit 0"]),
            Pipes {
                stdin: true,
                ..Pipes::default()
            },
            &Identity::Root,
            &[],
        )
        .unwrap();

        // The child may already be gone; either outcome must leave the
        // process alive (EPIPE, not SIGPIPE).
        std::thread::sleep(std::time::Duration::from_millis(50));
        let _ = pipewrite(helper.stdin().unwrap(), &[0u8; 65536]);
        helper.wait().unwrap();
    }

    #[test]
    fn missing_binary_is_spawn_failed() {
        let err = spawn(
            &args(&["/nonexistent/helper"]),
            Pipes::default(),
            &Identity::Root,
            &[],
        )
        .and_then(Helper::wait)
        .unwrap_err();
        assert!(matches!(err, MountError::SpawnFailed { .. }), "{err:?}");
    }

    #[test]
    fn child_path_is_forced() {
        let mut helper = spawn(
            &args(&["sh", "-c", "echo $PATH"]),
            Pipes {
                stdout: true,
                ..Pipes::default()
            },
            &Identity::Root,
            &[("PASSWD_FD", "0")],
        )
        .unwrap();
        let mut out = String::new();
        helper.stdout().unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out.trim(), SAFE_PATH);
        helper.wait().unwrap();
    }
}
