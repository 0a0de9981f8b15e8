//! Cross-process mutual exclusion on the backing file.
//!
//! We use BSD `flock(2)`. The lock belongs to the open file description, so two handles opened
//! separately, even in the same process, exclude each other. The kernel drops the lock when the
//! last descriptor of the description is closed, which includes the death of the holding process.
//! A crashed writer therefore never leaves the segment locked, it may however leave a mutation
//! half-applied which the segment detects through the header's lock state.
//!
//! Acquisition blocks without timeout. Interrupted calls (`EINTR`) are restarted, any other
//! failure is returned to the caller as is.
use std::fs::File;
use std::os::unix::io::AsRawFd;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Mode {
    Shared,
    Exclusive,
}

/// A held lock, released on drop.
pub(crate) struct FlockGuard<'lt> {
    file: &'lt File,
    mode: Mode,
}

impl FlockGuard<'_> {
    pub(crate) fn acquire(file: &File, mode: Mode) -> Result<FlockGuard<'_>, std::io::Error> {
        let op = match mode {
            Mode::Shared => libc::LOCK_SH,
            Mode::Exclusive => libc::LOCK_EX,
        };

        flock(file, op)?;
        Ok(FlockGuard { file, mode })
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }
}

impl Drop for FlockGuard<'_> {
    fn drop(&mut self) {
        // Nothing sensible to do on failure, closing the file releases it at the latest.
        if let Err(err) = flock(self.file, libc::LOCK_UN) {
            tracing::error!(%err, "failed to release segment lock");
        }
    }
}

fn flock(file: &File, op: libc::c_int) -> Result<(), std::io::Error> {
    loop {
        // Safety: the descriptor is owned by `file` and open for the duration of the call.
        if 0 == unsafe { libc::flock(file.as_raw_fd(), op) } {
            return Ok(());
        }

        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
