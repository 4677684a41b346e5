//! Named binary signals with auto-reset semantics, backed by POSIX named
//! semaphores.
//!
//! `raise` never stacks: a signal raised twice before anyone waits is consumed
//! by a single `wait`. Each successful `wait` consumes the raise it observed,
//! so a following `wait` blocks until the next `raise`. Outside Linux the
//! guarantee is weaker, see the fallback `skip_raise`.

use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{Ordering, fence};
use std::time::{Duration, Instant};

use crate::error::{ShmError, ShmResult};
use crate::region::os_name;

pub struct NamedSignal {
    name: String,
    sem: NonNull<libc::sem_t>,
    owner: bool,
}

// sem_post / sem_wait are thread-safe.
unsafe impl Send for NamedSignal {}
unsafe impl Sync for NamedSignal {}

enum WaitOutcome {
    Signaled,
    TimedOut,
    Interrupted,
}

impl NamedSignal {
    /// Creates the signal in the lowered state, replacing a stale one of the
    /// same name. The name is unlinked when the returned value drops.
    pub fn create(name: &str) -> ShmResult<Self> {
        let c_name = os_name(name)?;
        unsafe { libc::sem_unlink(c_name.as_ptr()) };
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(ShmError::last_os("sem_open", name));
        }
        Ok(Self {
            name: name.to_string(),
            sem: non_null(sem, name)?,
            owner: true,
        })
    }

    /// Opens a signal created by another process, `Ok(None)` if it does not exist.
    pub fn open(name: &str) -> ShmResult<Option<Self>> {
        let c_name = os_name(name)?;
        let sem = unsafe { libc::sem_open(c_name.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(ShmError::from_io("sem_open", name, err));
        }
        Ok(Some(Self {
            name: name.to_string(),
            sem: non_null(sem, name)?,
            owner: false,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn raise(&self) -> ShmResult<()> {
        if self.skip_raise() {
            return Ok(());
        }
        // Publish every write to the region before the peer can observe the raise.
        fence(Ordering::SeqCst);
        if unsafe { libc::sem_post(self.sem.as_ptr()) } != 0 {
            return Err(ShmError::last_os("sem_post", &self.name));
        }
        Ok(())
    }

    /// Blocks until the signal is raised or `timeout` elapses. Returns `true`
    /// when a raise was consumed. A timed-out wait never returns early.
    pub fn wait(&self, timeout: Duration) -> ShmResult<bool> {
        let deadline = deadline_after(timeout);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.timed_wait(remaining)? {
                WaitOutcome::Signaled => {
                    fence(Ordering::SeqCst);
                    return Ok(true);
                }
                WaitOutcome::TimedOut if Instant::now() >= deadline => return Ok(false),
                // wall clock stepped, or a signal handler ran
                WaitOutcome::TimedOut | WaitOutcome::Interrupted => {}
            }
        }
    }

    /// Whether a raise is already pending, so a new one would stack.
    #[cfg(target_os = "linux")]
    fn skip_raise(&self) -> bool {
        let mut value: libc::c_int = 0;
        unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) == 0 && value > 0 }
    }

    /// `sem_getvalue` is not implemented on macOS, so the pending raise is
    /// taken back and `raise` posts it again. Two processes raising at the
    /// same instant can still leave the count at two there; the extra raise
    /// shows up as one spurious wake.
    #[cfg(not(target_os = "linux"))]
    fn skip_raise(&self) -> bool {
        self.drain();
        false
    }

    /// Consumes a pending raise without blocking. Returns how many were taken.
    pub fn drain(&self) -> usize {
        let mut taken = 0;
        while unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
            taken += 1;
        }
        taken
    }

    #[cfg(target_os = "linux")]
    fn timed_wait(&self, timeout: Duration) -> ShmResult<WaitOutcome> {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut now) } != 0 {
            return Err(ShmError::last_os("clock_gettime", &self.name));
        }
        let deadline = add_timespec(now, timeout);
        if unsafe { libc::sem_timedwait(self.sem.as_ptr(), &deadline) } == 0 {
            return Ok(WaitOutcome::Signaled);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => Ok(WaitOutcome::TimedOut),
            Some(libc::EINTR) => Ok(WaitOutcome::Interrupted),
            _ => Err(ShmError::from_io("sem_timedwait", &self.name, err)),
        }
    }

    /// Platforms without `sem_timedwait` poll with a short sleep. Binary
    /// raising relies on the non-Linux `skip_raise` there.
    #[cfg(not(target_os = "linux"))]
    fn timed_wait(&self, timeout: Duration) -> ShmResult<WaitOutcome> {
        const POLL: Duration = Duration::from_millis(1);
        let deadline = deadline_after(timeout);
        loop {
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(WaitOutcome::Signaled);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => {}
                Some(libc::EINTR) => return Ok(WaitOutcome::Interrupted),
                _ => return Err(ShmError::from_io("sem_trywait", &self.name, err)),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            std::thread::sleep(POLL.min(deadline - now));
        }
    }
}

impl Drop for NamedSignal {
    fn drop(&mut self) {
        unsafe { libc::sem_close(self.sem.as_ptr()) };
        if self.owner {
            if let Ok(c_name) = os_name(&self.name) {
                unsafe { libc::sem_unlink(c_name.as_ptr()) };
            }
        }
    }
}

/// `now + timeout`, clamped to the latest instant the clock can represent.
/// `Duration::MAX` therefore means "wait indefinitely".
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    let mut timeout = timeout;
    loop {
        if let Some(deadline) = now.checked_add(timeout) {
            return deadline;
        }
        timeout /= 2;
    }
}

fn non_null(sem: *mut libc::sem_t, name: &str) -> ShmResult<NonNull<libc::sem_t>> {
    NonNull::new(sem)
        .ok_or_else(|| ShmError::from_io("sem_open", name, io::Error::other("null semaphore")))
}

#[cfg(target_os = "linux")]
fn add_timespec(base: libc::timespec, delta: Duration) -> libc::timespec {
    const NANOS_PER_SEC: libc::c_long = 1_000_000_000;
    let secs = libc::time_t::try_from(delta.as_secs()).unwrap_or(libc::time_t::MAX);
    let mut sec = base.tv_sec.saturating_add(secs);
    let mut nsec = base.tv_nsec + delta.subsec_nanos() as libc::c_long;
    if nsec >= NANOS_PER_SEC {
        nsec -= NANOS_PER_SEC;
        sec = sec.saturating_add(1);
    }
    libc::timespec {
        tv_sec: sec,
        tv_nsec: nsec,
    }
}
