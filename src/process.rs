//! Process-lifetime state: PID file and appointment lock.
//!
//! Out of scope per spec.md §1 except for the contracts described in §6:
//! daemonisation and bootstrap themselves live outside this crate.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::error::Result;

/// A PID file locked with advisory OFD locking, truncated on clean exit.
pub struct PidFile {
    file: File,
}

impl PidFile {
    /// Opens (creating if needed) and locks `path`, writing the current PID.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path.as_ref())?;
        lock_ofd(&file, 0)?;
        file.set_len(0)?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;
        Ok(PidFile { file })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
    }
}

/// A small integer identity assigned by exclusively locking the smallest
/// free byte offset `i >= 0` in a shared lock file.
pub struct Appointment {
    file: File,
    index: u64,
}

impl Appointment {
    /// Scans byte offsets starting at 0 and takes the first one that can be
    /// exclusively locked.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path.as_ref())?;
        let mut index = 0u64;
        loop {
            match lock_ofd(&file, index) {
                Ok(()) => break,
                Err(_) => index += 1,
            }
        }
        file.seek(SeekFrom::Start(0))?;
        Ok(Appointment { file, index })
    }

    pub fn index(&self) -> u64 {
        self.index
    }
}

impl Drop for Appointment {
    fn drop(&mut self) {
        let _ = &self.file;
    }
}

/// Locks byte `offset` of `file` with an exclusive, process-death-safe
/// (OFD, not flock) advisory lock.
fn lock_ofd(file: &File, offset: u64) -> Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = libc::F_WRLCK as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = 1;

    // SAFETY: fl is a fully initialized flock struct and file's fd stays
    // valid for the duration of the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_OFD_SETLK, &fl) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile_path::temp_path;

    mod tempfile_path {
        use std::path::PathBuf;

        pub fn temp_path(name: &str) -> PathBuf {
            let mut p = std::env::temp_dir();
            p.push(format!(
                "poseidon-test-{}-{}",
                std::process::id(),
                name
            ));
            p
        }
    }

    #[test]
    fn pid_file_contains_pid() {
        let path = temp_path("pid");
        let _guard = PidFile::create(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, std::process::id().to_string());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn appointment_picks_smallest_free_slot() {
        let path = temp_path("appointment");
        let a = Appointment::acquire(&path).unwrap();
        assert_eq!(a.index(), 0);
        let _ = std::fs::remove_file(&path);
    }
}
