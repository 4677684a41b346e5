//! Liveness of a region's creator.
//!
//! POSIX shared memory and named semaphores outlive a creator that dies
//! without unlinking them. The creator therefore holds an exclusive `flock`
//! on a lock file named after the region and records the identity of the
//! object it created there. The kernel drops the lock with the process, so an
//! opener that can take the lock knows whatever object carries the name is
//! stale.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use crate::error::{ShmError, ShmResult};

pub fn lock_file_path(region_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}.lock", region_name.trim_start_matches('/')))
}

/// Exclusive ownership of a region name, held for the lifetime of the value.
/// The lock file is removed on drop.
#[derive(Debug)]
pub struct OwnerLock {
    name: String,
    path: PathBuf,
    file: File,
}

impl OwnerLock {
    /// Takes the lock without blocking. Fails with [`ShmError::InUse`] while
    /// a live process owns the name. Any identity left by a dead owner is
    /// cleared.
    pub fn acquire(region_name: &str) -> ShmResult<Self> {
        let path = lock_file_path(region_name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ShmError::from_io("open lock file", region_name, e))?;
        if !try_flock(&file, libc::LOCK_EX, region_name)? {
            return Err(ShmError::InUse {
                name: region_name.to_string(),
            });
        }
        file.set_len(0)
            .map_err(|e| ShmError::from_io("truncate lock file", region_name, e))?;
        Ok(Self {
            name: region_name.to_string(),
            path,
            file,
        })
    }

    /// Records the identity of the object now carrying the name.
    pub fn publish(&mut self, id: u64) -> ShmResult<()> {
        let name = &self.name;
        self.file
            .set_len(0)
            .and_then(|_| self.file.seek(SeekFrom::Start(0)))
            .and_then(|_| self.file.write_all(id.to_string().as_bytes()))
            .and_then(|_| self.file.flush())
            .map_err(|e| ShmError::from_io("write lock file", name, e))
    }

    /// The identity published by the live owner of `region_name`. `None` when
    /// nobody holds the lock or the owner has not published yet.
    pub fn published(region_name: &str) -> ShmResult<Option<u64>> {
        let mut file = match File::open(lock_file_path(region_name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ShmError::from_io("open lock file", region_name, e)),
        };
        // A shared lock only succeeds when no owner holds the exclusive one.
        // It is released when `file` closes.
        if try_flock(&file, libc::LOCK_SH, region_name)? {
            return Ok(None);
        }
        let mut content = String::new();
        file.read_to_string(&mut content)
            .map_err(|e| ShmError::from_io("read lock file", region_name, e))?;
        Ok(content.trim().parse().ok())
    }

    /// Whether a live process currently owns `region_name`.
    pub fn is_held(region_name: &str) -> ShmResult<bool> {
        let file = match File::open(lock_file_path(region_name)) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(ShmError::from_io("open lock file", region_name, e)),
        };
        Ok(!try_flock(&file, libc::LOCK_SH, region_name)?)
    }
}

impl Drop for OwnerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// `Ok(false)` when another open file description holds a conflicting lock.
fn try_flock(file: &File, op: libc::c_int, name: &str) -> ShmResult<bool> {
    loop {
        if unsafe { libc::flock(file.as_raw_fd(), op | libc::LOCK_NB) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(code) if code == libc::EWOULDBLOCK => return Ok(false),
            _ => return Err(ShmError::from_io("flock", name, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_name(tag: &str) -> String {
        format!("/shmch_lock_{}_{}", std::process::id(), tag)
    }

    #[test]
    fn test_lock_is_exclusive_while_held() {
        let name = test_name("held");
        assert!(!OwnerLock::is_held(&name).unwrap());

        let lock = OwnerLock::acquire(&name).unwrap();
        assert!(OwnerLock::is_held(&name).unwrap());
        assert!(matches!(
            OwnerLock::acquire(&name),
            Err(ShmError::InUse { .. })
        ));

        drop(lock);
        assert!(!OwnerLock::is_held(&name).unwrap());
        assert!(!lock_file_path(&name).exists());
    }

    #[test]
    fn test_published_requires_live_owner() {
        let name = test_name("publish");
        let mut lock = OwnerLock::acquire(&name).unwrap();
        assert_eq!(OwnerLock::published(&name).unwrap(), None);
        lock.publish(4711).unwrap();
        assert_eq!(OwnerLock::published(&name).unwrap(), Some(4711));
        drop(lock);
        assert_eq!(OwnerLock::published(&name).unwrap(), None);
    }

    #[test]
    fn test_dead_owner_identity_is_ignored_and_cleared() {
        let name = test_name("leftover");
        // what a killed owner leaves behind: the file, its content, no lock
        std::fs::write(lock_file_path(&name), b"12345").unwrap();
        assert!(!OwnerLock::is_held(&name).unwrap());
        assert_eq!(OwnerLock::published(&name).unwrap(), None);

        let lock = OwnerLock::acquire(&name).unwrap();
        assert!(OwnerLock::is_held(&name).unwrap());
        assert_eq!(OwnerLock::published(&name).unwrap(), None);
        drop(lock);
    }
}
