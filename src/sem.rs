//! Process-shared POSIX semaphores embedded in the slot array.
//!
//! The queue's blocking operations are the only place this crate waits:
//! `READ_SEM` counts available items, `WRITE_SEM` counts remaining depth, and
//! `IO_SEM` serializes `ftruncate` during growth. Each semaphore occupies a
//! fixed 4-slot reservation inside the control block and is initialized with
//! `pshared` so any process mapping the object can wait on it.
//!
//! All waits loop on `EINTR`; an `EINVAL` from a destroyed or corrupted
//! semaphore surfaces as [`Error::State`].

use crate::error::Error;

use static_assertions::const_assert;

/// Slots reserved for one embedded semaphore.
pub const SEM_SLOTS: i64 = 4;

const_assert!(core::mem::size_of::<libc::sem_t>() <= SEM_SLOTS as usize * 8);

#[inline]
fn as_sem(slot: *mut i64) -> *mut libc::sem_t {
    slot.cast()
}

/// Initialize a process-shared semaphore in place.
///
/// # Safety
///
/// `slot` must point at a 4-slot reservation inside the mapped object that no
/// other process is concurrently using.
pub unsafe fn init(slot: *mut i64, value: u32) -> Result<(), Error> {
    if libc::sem_init(as_sem(slot), 1, value) < 0 {
        return Err(Error::NoSupport);
    }
    Ok(())
}

/// Destroy an embedded semaphore. Errors are reported but not fatal.
///
/// # Safety
///
/// No process may be blocked on the semaphore.
pub unsafe fn destroy(slot: *mut i64) -> Result<(), Error> {
    if libc::sem_destroy(as_sem(slot)) < 0 {
        return Err(Error::Sys);
    }
    Ok(())
}

/// Block until the semaphore can be decremented.
///
/// # Safety
///
/// `slot` must point at an initialized embedded semaphore.
pub unsafe fn wait(slot: *mut i64) -> Result<(), Error> {
    loop {
        if libc::sem_wait(as_sem(slot)) == 0 {
            return Ok(());
        }
        match *libc::__errno_location() {
            libc::EINTR => continue,
            libc::EINVAL => return Err(Error::State),
            _ => return Err(Error::last_os()),
        }
    }
}

/// Attempt to decrement without blocking. `Ok(false)` means the count was
/// zero.
///
/// # Safety
///
/// `slot` must point at an initialized embedded semaphore.
pub unsafe fn trywait(slot: *mut i64) -> Result<bool, Error> {
    loop {
        if libc::sem_trywait(as_sem(slot)) == 0 {
            return Ok(true);
        }
        match *libc::__errno_location() {
            libc::EINTR => continue,
            libc::EAGAIN => return Ok(false),
            libc::EINVAL => return Err(Error::State),
            _ => return Err(Error::last_os()),
        }
    }
}

/// Block until decremented or the relative timeout elapses. `Ok(false)` means
/// the wait timed out.
///
/// # Safety
///
/// `slot` must point at an initialized embedded semaphore.
pub unsafe fn timedwait(slot: *mut i64, timeout: libc::timespec) -> Result<bool, Error> {
    let mut abs: libc::timespec = core::mem::zeroed();
    libc::clock_gettime(libc::CLOCK_REALTIME, &mut abs);
    abs.tv_sec += timeout.tv_sec;
    abs.tv_nsec += timeout.tv_nsec;
    if abs.tv_nsec >= 1_000_000_000 {
        abs.tv_sec += 1;
        abs.tv_nsec -= 1_000_000_000;
    }

    loop {
        if libc::sem_timedwait(as_sem(slot), &abs) == 0 {
            return Ok(true);
        }
        match *libc::__errno_location() {
            libc::EINTR => continue,
            libc::ETIMEDOUT => return Ok(false),
            libc::EINVAL => return Err(Error::State),
            _ => return Err(Error::last_os()),
        }
    }
}

/// Increment the semaphore.
///
/// # Safety
///
/// `slot` must point at an initialized embedded semaphore.
pub unsafe fn post(slot: *mut i64) -> Result<(), Error> {
    if libc::sem_post(as_sem(slot)) < 0 {
        if *libc::__errno_location() == libc::EINVAL {
            return Err(Error::State);
        }
        return Err(Error::last_os());
    }
    Ok(())
}

/// Read the current count.
///
/// # Safety
///
/// `slot` must point at an initialized embedded semaphore.
pub unsafe fn value(slot: *mut i64) -> Result<i32, Error> {
    let mut sval: i32 = -1;
    if libc::sem_getvalue(as_sem(slot), &mut sval) < 0 {
        return Err(Error::State);
    }
    Ok(sval)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(16))]
    struct SemBlock([i64; SEM_SLOTS as usize]);

    #[test]
    fn test_count_up_down() {
        let mut block = SemBlock([0; 4]);
        let p = block.0.as_mut_ptr();
        unsafe {
            init(p, 2).unwrap();
            assert_eq!(value(p).unwrap(), 2);
            assert!(trywait(p).unwrap());
            assert!(trywait(p).unwrap());
            assert!(!trywait(p).unwrap());
            post(p).unwrap();
            assert_eq!(value(p).unwrap(), 1);
            destroy(p).unwrap();
        }
    }

    #[test]
    fn test_timedwait_expires() {
        let mut block = SemBlock([0; 4]);
        let p = block.0.as_mut_ptr();
        unsafe {
            init(p, 0).unwrap();
            let begin = std::time::Instant::now();
            let got = timedwait(
                p,
                libc::timespec {
                    tv_sec: 0,
                    tv_nsec: 50_000_000,
                },
            )
            .unwrap();
            assert!(!got);
            assert!(begin.elapsed() >= std::time::Duration::from_millis(40));
            destroy(p).unwrap();
        }
    }

    #[test]
    fn test_wait_crosses_threads() {
        let block = Box::leak(Box::new(SemBlock([0; 4])));
        let addr = block.0.as_mut_ptr() as usize;
        unsafe { init(addr as *mut i64, 0).unwrap() };

        let waiter = std::thread::spawn(move || unsafe { wait(addr as *mut i64) });
        std::thread::sleep(std::time::Duration::from_millis(20));
        unsafe { post(addr as *mut i64).unwrap() };
        waiter.join().unwrap().unwrap();
        unsafe { destroy(addr as *mut i64).unwrap() };
    }
}
