//! POSIX plumbing: pseudo-terminals and process-group signalling.

use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::process::Command;

use tracing::debug;

/// Allocate a pty pair. Both descriptors are close-on-exec; the replica
/// reaches the child through the dup2 calls in [`wire_pty`].
pub(crate) fn open_pty() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut master: libc::c_int = -1;
    let mut replica: libc::c_int = -1;

    // SAFETY: openpty writes two valid descriptors on success; name,
    // termios, and winsize are all optional.
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut replica,
            std::ptr::null_mut(),
            std::ptr::null(),
            std::ptr::null(),
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: the descriptors were just returned by openpty and are
    // owned by nothing else.
    let (master, replica) = unsafe { (OwnedFd::from_raw_fd(master), OwnedFd::from_raw_fd(replica)) };
    set_cloexec(&master)?;
    set_cloexec(&replica)?;
    Ok((master, replica))
}

fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: fcntl on an owned, open descriptor.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Make the replica the child's controlling terminal and stdio.
pub(crate) fn wire_pty(cmd: &mut Command, replica: &OwnedFd) {
    use std::os::unix::process::CommandExt;

    let fd = replica.as_raw_fd();
    // SAFETY: the closure runs in the forked child before exec and only
    // calls async-signal-safe functions.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::ioctl(fd, libc::TIOCSCTTY as libc::c_ulong, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            for target in 0..3 {
                if libc::dup2(fd, target) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }
}

pub(crate) fn master_reader(master: OwnedFd) -> File {
    File::from(master)
}

/// Signal the whole process group, falling back to the process itself
/// when the group is already gone. ESRCH is not an error: the target
/// exited before the signal arrived.
pub(crate) fn signal_group(pid: i32, sig: i32) {
    // SAFETY: killpg/kill accept any pid and a valid signal number.
    let rc = unsafe { libc::killpg(pid, sig) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return;
        }
        debug!(pid, sig, %err, "killpg failed, falling back to kill");
        // SAFETY: see above.
        unsafe { libc::kill(pid, sig) };
    }
}
