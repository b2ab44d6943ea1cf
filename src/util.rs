//! Process liveness and termination by PID.
//!
//! Used for resolver processes that were not spawned by us (service mode),
//! where no child handle exists.

use std::io;

/// Checks whether the process with the given PID is still alive.
///
/// Uses `kill(pid, 0)`: signal 0 checks existence without delivering a
/// signal. `EPERM` means the process exists but belongs to someone else.
#[cfg(unix)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: `kill(pid, 0)` is a standard POSIX existence check that does
    // not deliver any signal.
    if unsafe { libc::kill(pid, 0) } == 0 {
        return true;
    }
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Checks whether the process with the given PID is still alive.
#[cfg(windows)]
#[must_use]
pub fn is_process_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/FO", "CSV", "/NH"])
        .output()
        .is_ok_and(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
}

/// Forcibly terminates the process with the given PID.
///
/// A process that is already gone is not an error.
///
/// # Errors
///
/// Returns the OS error if the signal could not be delivered.
#[cfg(unix)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    // SAFETY: plain `kill(2)`; no memory is shared with the callee.
    if unsafe { libc::kill(pid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Forcibly terminates the process with the given PID.
///
/// # Errors
///
/// Returns an error if `taskkill` could not run or reported a failure while
/// the process is still alive.
#[cfg(windows)]
pub fn kill_process(pid: u32) -> io::Result<()> {
    let out = std::process::Command::new("taskkill")
        .args(["/F", "/PID", &pid.to_string()])
        .output()?;
    if out.status.success() || !is_process_alive(pid) {
        Ok(())
    } else {
        Err(io::Error::other(
            String::from_utf8_lossy(&out.stderr).trim().to_string(),
        ))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn dead_pid_is_not_alive() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn killing_dead_pid_is_ok() {
        assert!(kill_process(999_999_999).is_ok());
    }

    #[test]
    fn kill_terminates_process() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        kill_process(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_process_alive(pid));
    }
}
