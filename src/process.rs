//! Process Control
//!
//! The collaborator interfaces the engine needs from the OS: a pid-liveness
//! probe, a kill that takes the whole descendant tree with it, and the
//! watchdog a child runs so it never outlives its parent.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Whether a process with this pid currently exists.
pub fn pid_alive(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
        if rc == 0 {
            return true;
        }
        // EPERM means the pid exists but belongs to someone else.
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        true
    }
}

/// Arrange for a child to become its own process-group leader, so
/// `kill_tree` later reaches every descendant it spawned.
pub fn configure_process_group(command: &mut tokio::process::Command) {
    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }
    #[cfg(not(unix))]
    {
        let _ = command;
    }
}

/// Kill a child and its descendant tree. Best-effort: the caller still
/// issues `Child::kill`/`Child::wait` afterwards to reap the direct child.
pub fn kill_tree(pid: u32) {
    #[cfg(unix)]
    unsafe {
        // The child became a group leader at spawn; the group id is its pid.
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
    }
}

/// Poll the parent pid and trigger the shutdown channel when it vanishes,
/// so an orphaned server exits instead of lingering.
pub fn watch_parent(
    parent_pid: u32,
    shutdown: broadcast::Sender<()>,
    poll: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            if !pid_alive(parent_pid) {
                tracing::warn!("parent process {} vanished, shutting down", parent_pid);
                let _ = shutdown.send(());
                break;
            }
        }
    })
}
