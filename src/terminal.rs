//! Keypress detection on stdin.
//!
//! `RawMode` turns off canonical input and echo so a single keypress becomes
//! readable immediately; the previous terminal settings are restored and
//! pending input discarded when the guard is dropped.

use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;

const STDIN: RawFd = libc::STDIN_FILENO;

/// Restores the original terminal mode on drop.
pub struct RawMode {
    fd: RawFd,
    original: libc::termios,
}

impl RawMode {
    /// Disable line buffering and echo on stdin.
    ///
    /// Fails if stdin is not a terminal.
    pub fn enable() -> io::Result<Self> {
        let original = get_attrs(STDIN)?;

        let mut raw = original;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        set_attrs(STDIN, &raw)?;

        Ok(Self {
            fd: STDIN,
            original,
        })
    }
}

impl Drop for RawMode {
    fn drop(&mut self) {
        if let Err(e) = set_attrs(self.fd, &self.original) {
            tracing::warn!(error = %e, "Failed to restore terminal mode");
        }
        // Keep the keypress from showing up on the shell prompt
        // SAFETY: tcflush only takes an fd and a queue selector.
        unsafe {
            libc::tcflush(self.fd, libc::TCIFLUSH);
        }
    }
}

/// Whether at least one byte is waiting on stdin.
pub fn key_pressed() -> bool {
    bytes_waiting(STDIN).is_ok_and(|n| n > 0)
}

fn bytes_waiting(fd: RawFd) -> io::Result<usize> {
    let mut waiting: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the provided pointer.
    let ret = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut waiting as *mut libc::c_int) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(waiting.max(0) as usize)
}

fn get_attrs(fd: RawFd) -> io::Result<libc::termios> {
    let mut term = MaybeUninit::<libc::termios>::uninit();
    // SAFETY: tcgetattr fully initializes `term` when it returns 0.
    if unsafe { libc::tcgetattr(fd, term.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: tcgetattr returned 0, so `term` is initialized.
    Ok(unsafe { term.assume_init() })
}

fn set_attrs(fd: RawFd, term: &libc::termios) -> io::Result<()> {
    // SAFETY: `term` points to a valid termios for the duration of the call.
    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, term) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
