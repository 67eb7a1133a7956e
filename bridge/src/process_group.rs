//! Process-group helpers used when launching and killing piped children.
//!
//! - `set_process_group` runs in `pre_exec` so the child leads its own group
//!   and a kill reaches everything it spawned.
//! - `set_parent_death_signal` (Linux only) delivers `SIGTERM` to the child if
//!   the bridging process dies first.
//! - `kill_process_group` sends `SIGKILL` to a whole group.
//!
//! Non-Unix platforms have no equivalent; callers fall back to killing the
//! child directly.

#[cfg(unix)]
use std::io;

#[cfg(target_os = "linux")]
/// Ensure the child receives SIGTERM when the original parent dies.
///
/// Runs in `pre_exec`; `parent_pid` is captured before spawn so a parent that
/// exits between fork and exec is still detected.
pub(crate) fn set_parent_death_signal(parent_pid: libc::pid_t) -> io::Result<()> {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) } == -1 {
        return Err(io::Error::last_os_error());
    }

    if unsafe { libc::getppid() } != parent_pid {
        unsafe {
            libc::raise(libc::SIGTERM);
        }
    }

    Ok(())
}

#[cfg(unix)]
/// Put the calling process into its own process group.
pub(crate) fn set_process_group() -> io::Result<()> {
    let result = unsafe { libc::setpgid(0, 0) };
    if result == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

#[cfg(unix)]
/// Kill a process group (best-effort). A group that is already gone is not an
/// error.
pub(crate) fn kill_process_group(process_group_id: u32) -> io::Result<()> {
    use std::io::ErrorKind;

    let Ok(pgid) = libc::pid_t::try_from(process_group_id) else {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("process group id {process_group_id} out of range"),
        ));
    };
    let result = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }

    Ok(())
}
