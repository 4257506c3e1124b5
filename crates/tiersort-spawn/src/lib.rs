//! tiersort-spawn: start a pipeline role in its own process.
//!
//! Each role is the `tiersort` binary re-executed with a role subcommand.
//! Descriptors are passed by inheritance: the parent declares exactly which
//! ones the child gets, and each arrives as `--<flag>=<fd>`.
//!
//! # FD Inheritance
//!
//! Every descriptor the pipeline creates is close-on-exec, so by default a
//! child inherits nothing. [`RoleCommand::inherit`] moves an owned
//! descriptor into the command; between fork and exec its close-on-exec
//! flag is cleared in the child only. After the spawn the parent drops its
//! own copy, so the child ends up as the only holder of that end.
//!
//! Children are killed if their [`RoleChild`] is dropped without being
//! waited for, so an orchestrator that bails out early never leaves roles
//! running behind it.

#![forbid(unsafe_op_in_unsafe_fn)]

use std::ffi::OsStr;
use std::fmt;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};

/// Builder for one role process.
pub struct RoleCommand {
    command: Command,
    label: String,
    inherited: Vec<OwnedFd>,
}

impl RoleCommand {
    /// Run `program` for the role described by `label` (used in logs and
    /// exit reports).
    pub fn new(program: impl AsRef<OsStr>, label: impl Into<String>) -> Self {
        let mut command = Command::new(program);
        command.stdin(Stdio::null()).kill_on_drop(true);
        Self {
            command,
            label: label.into(),
            inherited: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.command.arg(arg);
        self
    }

    /// Hand `fd` to the child, announced as `--<flag>=<fd>`.
    pub fn inherit(mut self, flag: &str, fd: impl Into<OwnedFd>) -> Self {
        let fd = fd.into();
        self.command.arg(format!("--{flag}={}", fd.as_raw_fd()));
        self.inherited.push(fd);
        self
    }

    /// Start the child and close the parent's copies of inherited fds.
    pub fn spawn(mut self) -> io::Result<RoleChild> {
        let raw: Vec<RawFd> = self.inherited.iter().map(AsRawFd::as_raw_fd).collect();

        // SAFETY: the hook runs between fork and exec and only calls fcntl,
        // which is async-signal-safe; it does not allocate.
        unsafe {
            self.command.pre_exec(move || {
                for &fd in &raw {
                    clear_cloexec(fd)?;
                }
                Ok(())
            });
        }

        let child = self.command.spawn()?;
        tracing::debug!(
            role = %self.label,
            pid = child.id(),
            inherited = self.inherited.len(),
            "spawned role process"
        );

        // Parent-side ends close here.
        drop(self.inherited);

        Ok(RoleChild {
            label: self.label,
            child,
        })
    }
}

/// A running role process.
pub struct RoleChild {
    label: String,
    child: Child,
}

impl RoleChild {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for this specific child to exit.
    pub async fn wait(&mut self) -> io::Result<ExitReport> {
        let status = self.child.wait().await?;
        Ok(ExitReport::from(status))
    }

    /// Kill the child and reap it.
    pub async fn kill(&mut self) -> io::Result<()> {
        self.child.kill().await
    }

    /// Reap the child, killing it first if it is still running.
    pub async fn terminate(&mut self) -> io::Result<ExitReport> {
        if let Some(status) = self.child.try_wait()? {
            return Ok(status.into());
        }
        tracing::warn!(role = %self.label, pid = self.child.id(), "killing role process");
        self.kill().await?;
        self.wait().await
    }
}

/// How a role process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for ExitReport {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown status"),
        }
    }
}

/// Adopt a descriptor this process inherited from its spawner.
///
/// The descriptor is marked close-on-exec again so it does not leak further
/// down the process tree.
///
/// # Safety
///
/// `fd` must be an open descriptor that nothing else in this process owns.
pub unsafe fn inherited_fd(fd: RawFd) -> io::Result<OwnedFd> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: caller guarantees fd is open and unowned
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn clear_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn cloexec_pipe() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        for fd in fds {
            assert_eq!(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }, 0);
        }
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn read_all(fd: OwnedFd) -> String {
        let mut out = String::new();
        std::fs::File::from(fd).read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn test_declared_fd_is_inherited_and_parent_copy_closed() {
        let (read, write) = cloexec_pipe();
        let mut child = RoleCommand::new("sh", "probe")
            .arg("-c")
            .arg(r#"fd="${0#--out=}"; printf hello >&"$fd""#)
            .inherit("out", write)
            .spawn()
            .unwrap();

        let report = child.wait().await.unwrap();
        assert!(report.success(), "child failed: {report}");
        // Reaching EOF proves the parent's write end was closed too.
        assert_eq!(read_all(read), "hello");
    }

    #[tokio::test]
    async fn test_undeclared_fd_is_not_inherited() {
        let (read, write) = cloexec_pipe();
        let raw = write.as_raw_fd();
        let mut child = RoleCommand::new("sh", "probe")
            .arg("-c")
            .arg(r#"printf leak >&"$0""#)
            .arg(raw.to_string())
            .spawn()
            .unwrap();

        let report = child.wait().await.unwrap();
        assert!(!report.success());
        drop(write);
        assert_eq!(read_all(read), "");
    }

    #[tokio::test]
    async fn test_exit_reports() {
        let mut failing = RoleCommand::new("sh", "probe")
            .arg("-c")
            .arg("exit 3")
            .spawn()
            .unwrap();
        assert_eq!(
            failing.wait().await.unwrap(),
            ExitReport {
                code: Some(3),
                signal: None
            }
        );

        let mut killed = RoleCommand::new("sh", "probe")
            .arg("-c")
            .arg("kill -9 $$")
            .spawn()
            .unwrap();
        let report = killed.wait().await.unwrap();
        assert_eq!(report.signal, Some(9));
        assert!(!report.success());
        assert_eq!(report.to_string(), "signal 9");
    }

    #[tokio::test]
    async fn test_terminate_kills_running_child() {
        let mut child = RoleCommand::new("sh", "probe")
            .arg("-c")
            .arg("sleep 30")
            .spawn()
            .unwrap();
        let report = child.terminate().await.unwrap();
        assert_eq!(report.signal, Some(libc::SIGKILL));

        let mut done = RoleCommand::new("sh", "probe")
            .arg("-c")
            .arg("exit 0")
            .spawn()
            .unwrap();
        assert!(done.wait().await.unwrap().success());
        assert!(done.terminate().await.unwrap().success());
    }
}
