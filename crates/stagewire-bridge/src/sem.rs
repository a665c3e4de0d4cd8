//! Process-shared POSIX semaphores living inside a shared-memory region.

use std::time::Duration;

use anyhow::{bail, Result};

/// A semaphore at a fixed address inside a mapped region. The creating side
/// initializes and later destroys it; attachers only post and wait.
pub struct ShmSemaphore {
    sem: *mut libc::sem_t,
    owned: bool,
}

unsafe impl Send for ShmSemaphore {}
unsafe impl Sync for ShmSemaphore {}

impl ShmSemaphore {
    /// Initializes a new process-shared semaphore at `ptr`.
    ///
    /// # Safety
    /// `ptr` must point at `sem_t`-sized, suitably aligned storage inside a
    /// shared mapping that outlives the semaphore, not already initialized.
    pub unsafe fn create(ptr: *mut libc::sem_t) -> Result<Self> {
        if libc::sem_init(ptr, 1, 0) != 0 {
            bail!(
                "sem_init failed: {}",
                std::io::Error::last_os_error()
            );
        }
        Ok(Self { sem: ptr, owned: true })
    }

    /// Attaches to a semaphore the peer already initialized.
    ///
    /// # Safety
    /// `ptr` must point at a semaphore initialized via [`ShmSemaphore::create`]
    /// in the peer's mapping of the same region.
    pub unsafe fn attach(ptr: *mut libc::sem_t) -> Self {
        Self { sem: ptr, owned: false }
    }

    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.sem);
        }
    }

    /// Waits up to `timeout`. Returns false when the timeout expired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut now = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        }
        let nanos = now.tv_nsec as i64 + timeout.subsec_nanos() as i64;
        let deadline = libc::timespec {
            tv_sec: now.tv_sec + timeout.as_secs() as libc::time_t + (nanos / 1_000_000_000) as libc::time_t,
            tv_nsec: nanos % 1_000_000_000,
        };
        loop {
            let ret = unsafe { libc::sem_timedwait(self.sem, &deadline) };
            if ret == 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return false,
            }
        }
    }

    /// Blocks until posted. Offline rendering only; the RT path always uses
    /// [`ShmSemaphore::wait_timeout`].
    pub fn wait(&self) -> bool {
        loop {
            let ret = unsafe { libc::sem_wait(self.sem) };
            if ret == 0 {
                return true;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) => continue,
                _ => return false,
            }
        }
    }
}

impl Drop for ShmSemaphore {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                libc::sem_destroy(self.sem);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[repr(C, align(16))]
    struct SemCell(std::mem::MaybeUninit<libc::sem_t>);

    #[test]
    fn post_then_wait_succeeds() {
        let mut cell = SemCell(std::mem::MaybeUninit::uninit());
        let sem = unsafe { ShmSemaphore::create(cell.0.as_mut_ptr()) }.unwrap();
        sem.post();
        assert!(sem.wait_timeout(Duration::from_millis(100)));
    }

    #[test]
    fn wait_times_out_when_unposted() {
        let mut cell = SemCell(std::mem::MaybeUninit::uninit());
        let sem = unsafe { ShmSemaphore::create(cell.0.as_mut_ptr()) }.unwrap();
        let start = Instant::now();
        assert!(!sem.wait_timeout(Duration::from_millis(50)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn cross_thread_rendezvous() {
        let mut cell = SemCell(std::mem::MaybeUninit::uninit());
        let sem = unsafe { ShmSemaphore::create(cell.0.as_mut_ptr()) }.unwrap();
        let peer = unsafe { ShmSemaphore::attach(cell.0.as_mut_ptr()) };
        std::thread::scope(|scope| {
            scope.spawn(|| {
                std::thread::sleep(Duration::from_millis(20));
                peer.post();
            });
            assert!(sem.wait_timeout(Duration::from_secs(2)));
        });
    }
}
