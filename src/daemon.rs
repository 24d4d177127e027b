//! Functionality relating to daemon mode.
//!
//! A daemon is typically an application that runs as a long lived service
//! in the background, often starting as a privileged user (to own kernel
//! state) and later restricting what it exposes.  This module covers
//! becoming a daemon and obtaining the control listener: either by binding
//! it, or by inheriting it from a previous generation of the daemon during
//! a seamless upgrade (the same mechanism systemd socket activation uses).

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener as StdUnixListener;

use camino::Utf8Path;
use daemonbase::process::Process;
use tracing::{debug, info};

use crate::config::DaemonConfig;
use crate::supervisor::CONTROL_FD_VAR;

/// Apply changes to the identity and access rights of the running
/// application in accordance with the provided settings.
pub fn daemonize(config: &DaemonConfig) -> Result<(), String> {
    let mut daemon_config = daemonbase::process::Config::default();

    if let Some((user, group)) = &config.identity {
        daemon_config = daemon_config
            .with_user(user)
            .map_err(|err| format!("Invalid user name: {err}"))?
            .with_group(group)
            .map_err(|err| format!("Invalid group name: {err}"))?;
    }

    if let Some(pid_file) = &config.pid_file {
        let path = pid_file.clone().into_std_path_buf();
        daemon_config = daemon_config.with_pid_file(daemonbase::config::ConfigPath::from(path));
    }

    let mut process = Process::from_config(daemon_config);

    if config.daemonize {
        debug!("Becoming daemon process");
        if process.setup_daemon(true).is_err() {
            return Err("Failed to become daemon process: unknown error".to_string());
        }
    }

    if let Some((user, group)) = &config.identity {
        debug!("Dropping privileges to {user}:{group}");
        if process.drop_privileges().is_err() {
            return Err("Failed to drop privileges: unknown error".to_string());
        }
    }

    Ok(())
}

//------------ SocketProvider ------------------------------------------------

/// Obtains the control listener, from inheritance or by binding.
///
/// During a seamless upgrade the previous daemon generation passes its
/// listening socket by file descriptor and names it in the environment;
/// taking it over means client connections survive the handoff.  On a
/// normal start the socket is bound fresh under the run directory.
#[derive(Debug)]
pub struct SocketProvider {
    listener: StdUnixListener,

    /// Whether the listener was inherited rather than bound.
    inherited: bool,
}

impl SocketProvider {
    /// Obtain the control listener.
    pub fn control_listener(path: &Utf8Path) -> Result<Self, String> {
        if let Some(listener) = Self::take_inherited()? {
            info!("Inherited the control listener from the previous generation");
            return Ok(Self {
                listener,
                inherited: true,
            });
        }

        Self::bind(path).map(|listener| Self {
            listener,
            inherited: false,
        })
    }

    /// Take the fd named by the environment, if the previous generation
    /// left one.
    fn take_inherited() -> Result<Option<StdUnixListener>, String> {
        let Ok(value) = std::env::var(CONTROL_FD_VAR) else {
            return Ok(None);
        };
        let fd: i32 = value
            .parse()
            .map_err(|_| format!("{CONTROL_FD_VAR} does not name a file descriptor"))?;

        // SAFETY: the previous generation placed a listening socket at this
        // descriptor and cleared its close-on-exec flag before spawning us;
        // nothing else in this process has claimed it.
        let listener = unsafe { StdUnixListener::from_raw_fd(fd) };
        Ok(Some(listener))
    }

    fn bind(path: &Utf8Path) -> Result<StdUnixListener, String> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir.as_std_path())
                .map_err(|err| format!("could not create '{dir}': {err}"))?;
        }

        // Remove the socket if a previous run left it there.
        let _ = std::fs::remove_file(path.as_std_path());

        let listener = StdUnixListener::bind(path.as_std_path())
            .map_err(|err| format!("could not bind '{path}': {err}"))?;

        // Owner and group only; the API plane joins the daemon's group.
        let perms = std::fs::Permissions::from_mode(0o660);
        std::fs::set_permissions(path.as_std_path(), perms)
            .map_err(|err| format!("could not set permissions on '{path}': {err}"))?;

        info!("Bound the control socket at '{path}'");
        Ok(listener)
    }

    /// Whether the listener was inherited during an upgrade.
    pub fn inherited(&self) -> bool {
        self.inherited
    }

    /// A duplicate of the listener's fd, for handing to the next
    /// generation.
    pub fn dup_fd(&self) -> Result<OwnedFd, String> {
        let fd = unsafe { libc::dup(self.listener.as_raw_fd()) };
        if fd < 0 {
            return Err("could not duplicate the control listener".into());
        }
        // SAFETY: dup just handed us ownership of this descriptor.
        Ok(unsafe { OwnedFd::from_raw_fd(fd) })
    }

    /// Convert into the async listener the control unit consumes.
    pub fn into_tokio(self) -> Result<tokio::net::UnixListener, String> {
        self.listener
            .set_nonblocking(true)
            .map_err(|err| format!("could not make the control socket non-blocking: {err}"))?;
        tokio::net::UnixListener::from_std(self.listener)
            .map_err(|err| format!("could not adopt the control socket: {err}"))
    }
}

/// Signal readiness to the previous generation, if one is waiting.
///
/// Called once all units report ready.  On a normal start this is a no-op.
pub fn signal_ready() {
    use std::io::Write;
    use std::os::fd::FromRawFd as _;

    let Ok(value) = std::env::var(crate::supervisor::READY_FD_VAR) else {
        return;
    };
    let Ok(fd) = value.parse::<i32>() else {
        return;
    };

    // SAFETY: the previous generation created this pipe for exactly this
    // purpose and the descriptor is ours alone.
    let mut pipe = unsafe { std::fs::File::from_raw_fd(fd) };
    if pipe.write_all(b"1").is_ok() {
        info!("Signalled readiness to the previous generation");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_creates_a_group_accessible_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("control.sock");

        let provider = SocketProvider::control_listener(&path).unwrap();
        assert!(!provider.inherited());
        let metadata = std::fs::metadata(path.as_std_path()).unwrap();
        assert_eq!(metadata.permissions().mode() & 0o777, 0o660);

        // Binding over a stale socket file works.
        drop(provider);
        let provider = SocketProvider::control_listener(&path).unwrap();
        assert!(!provider.inherited());
    }

    #[test]
    fn dup_fd_yields_an_independent_descriptor() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(dir.path()).unwrap().join("control.sock");

        let provider = SocketProvider::control_listener(&path).unwrap();
        let dup = provider.dup_fd().unwrap();
        assert_ne!(dup.as_raw_fd(), provider.listener.as_raw_fd());
    }
}
