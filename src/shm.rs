//! POSIX shared-memory substrate.
//!
//! Each queue or map instance is one named shared-memory object, created with
//! `shm_open` and sized with `ftruncate` in whole pages. The object is mapped
//! as a flat array of 64-bit slots.
//!
//! Because another process can grow the backing file at any time, a process
//! never remaps in place. Instead it keeps an **extent chain**: every size it
//! has observed gets its own mapping, linked oldest to newest. New extents
//! are CAS-installed at the tail, so concurrent threads of one process agree
//! on the current view without a lock, and stale extents are only unmapped
//! once the process-local accessor count shows no call still holding a
//! pointer derived from them.

use core::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::ffi::CString;
use std::path::PathBuf;
use std::ptr;

use log::debug;

use crate::arena::hdr;
use crate::error::Error;
use crate::pr;

/// Page granularity of the backing object.
pub(crate) const PAGE_BYTES: usize = 4096;

/// Slots in one page.
pub(crate) const PAGE_SLOTS: i64 = (PAGE_BYTES / pr::SLOT_BYTES) as i64;

/// rw-r--r--, matching the original library's objects.
const FILE_MODE: libc::mode_t = 0o644;

/// Directory where Linux exposes POSIX shared-memory objects.
const SHM_DIR: &str = "/dev/shm/";

/// One mapping of the backing object at a particular size.
pub(crate) struct Extent {
    next: AtomicPtr<Extent>,
    base: *mut i64,
    bytes: usize,
    slots: i64,
}

impl Extent {
    /// Map the backing file at `slots` and box the record.
    fn map(fd: libc::c_int, slots: i64) -> Result<*mut Extent, Error> {
        let bytes = slots as usize * pr::SLOT_BYTES;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                bytes,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_os());
        }
        Ok(Box::into_raw(Box::new(Extent {
            next: AtomicPtr::new(ptr::null_mut()),
            base: base.cast(),
            bytes,
            slots,
        })))
    }

    /// Unmap and free a boxed extent.
    ///
    /// # Safety
    ///
    /// `ext` must have come from [`Extent::map`] and be unreachable from the
    /// chain.
    unsafe fn unmap_free(ext: *mut Extent) {
        let boxed = Box::from_raw(ext);
        libc::munmap(boxed.base.cast(), boxed.bytes);
    }

    /// Slot count covered by this mapping.
    #[inline]
    pub(crate) fn slots(&self) -> i64 {
        self.slots
    }

    /// Raw pointer to a slot within this extent.
    #[inline]
    pub(crate) fn slot_ptr(&self, slot: i64) -> *mut i64 {
        debug_assert!(slot >= 0 && slot < self.slots);
        unsafe { self.base.add(slot as usize) }
    }
}

/// Reject empty names, over-long names, and embedded NUL bytes.
pub(crate) fn validate_name(name: &str) -> Result<CString, Error> {
    if name.is_empty() || name.len() > libc::PATH_MAX as usize {
        return Err(Error::Path);
    }
    CString::new(name).map_err(|_| Error::Path)
}

/// Filesystem path of the backing object.
fn object_path(name: &str) -> PathBuf {
    PathBuf::from(SHM_DIR).join(name.trim_start_matches('/'))
}

/// Stat the backing object and validate its shape.
///
/// Returns the size in bytes. A missing object reports `Exist`; an empty,
/// odd-sized, or non-regular file reports `State`.
pub(crate) fn stat_backing(name: &str) -> Result<usize, Error> {
    let meta = std::fs::metadata(object_path(name)).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::Exist,
        std::io::ErrorKind::PermissionDenied => Error::Access,
        _ => Error::Sys,
    })?;
    if !meta.is_file() {
        return Err(Error::State);
    }
    let size = meta.len() as usize;
    if size < PAGE_BYTES || size % PAGE_BYTES != 0 {
        return Err(Error::State);
    }
    Ok(size)
}

/// Check, read-only, that the named object exists and carries the expected
/// magic and version in its first slots.
pub(crate) fn peek_magic(name: &str, tag: &[u8; 4], version: i64) -> bool {
    let Ok(cname) = validate_name(name) else {
        return false;
    };
    let Ok(size) = stat_backing(name) else {
        return false;
    };
    let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDONLY, FILE_MODE) };
    if fd < 0 {
        return false;
    }
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            size,
            libc::PROT_READ,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        unsafe { libc::close(fd) };
        return false;
    }
    let slots = base.cast::<i64>();
    let word = unsafe { ptr::read_volatile(slots) }.to_le_bytes();
    let ver = unsafe { ptr::read_volatile(slots.add(crate::arena::hdr::VERSION as usize)) };
    unsafe {
        libc::munmap(base, size);
        libc::close(fd);
    }
    &word[..4] == tag && ver == version
}

/// A process's handle on one backing object: file descriptor plus extent
/// chain.
#[derive(Debug)]
pub(crate) struct Region {
    name: CString,
    fd: libc::c_int,
    prev: AtomicPtr<Extent>,
    current: AtomicPtr<Extent>,
    accessors: AtomicI64,
}

// The chain is only mutated through CAS and raw slot access is atomic; the
// handle is shared freely between threads of the owning process.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Create the named object at one page and map it.
    pub(crate) fn create(name: &str) -> Result<Region, Error> {
        let cname = validate_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_EXCL,
                FILE_MODE,
            )
        };
        if fd < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno == libc::EINVAL {
                return Err(Error::Path);
            }
            return Err(Error::from_errno(errno));
        }

        while unsafe { libc::ftruncate(fd, PAGE_BYTES as libc::off_t) } < 0 {
            let errno = unsafe { *libc::__errno_location() };
            if errno != libc::EINTR {
                unsafe {
                    libc::shm_unlink(cname.as_ptr());
                    libc::close(fd);
                }
                return Err(Error::from_errno(errno));
            }
        }

        let extent = Extent::map(fd, PAGE_SLOTS).map_err(|e| {
            unsafe {
                libc::shm_unlink(cname.as_ptr());
                libc::close(fd);
            }
            e
        })?;

        debug!("created shared object {name}");
        Ok(Region {
            name: cname,
            fd,
            prev: AtomicPtr::new(extent),
            current: AtomicPtr::new(extent),
            accessors: AtomicI64::new(0),
        })
    }

    /// Open an existing object and map it at its settled size.
    ///
    /// Another process may grow the file between the `stat` and the `mmap`,
    /// so the mapping is retried until the `SIZE` slot inside the object
    /// agrees with the mapped length.
    pub(crate) fn open(name: &str) -> Result<Region, Error> {
        let cname = validate_name(name)?;
        let mut size = stat_backing(name)?;

        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, FILE_MODE) };
        if fd < 0 {
            return Err(Error::last_os());
        }

        let extent = loop {
            let ext = Extent::map(fd, (size / pr::SLOT_BYTES) as i64).map_err(|e| {
                unsafe { libc::close(fd) };
                e
            })?;
            let mapped = unsafe { (*ext).slot_ptr(hdr::SIZE) };
            let settled = pr::load(mapped) as usize * pr::SLOT_BYTES;
            if settled == size {
                break ext;
            }
            unsafe { Extent::unmap_free(ext) };
            size = settled;
            if size == 0 {
                unsafe { libc::close(fd) };
                return Err(Error::State);
            }
        };

        debug!("opened shared object {name} ({size} bytes)");
        Ok(Region {
            name: cname,
            fd,
            prev: AtomicPtr::new(extent),
            current: AtomicPtr::new(extent),
            accessors: AtomicI64::new(0),
        })
    }

    /// File descriptor of the backing object.
    #[inline]
    pub(crate) fn fd(&self) -> libc::c_int {
        self.fd
    }

    /// The newest extent.
    #[inline]
    pub(crate) fn current(&self) -> &Extent {
        unsafe { &*self.current.load(Ordering::Acquire) }
    }

    /// Enter a call: pin the chain.
    #[inline]
    pub(crate) fn guard(&self) {
        self.accessors.fetch_add(1, Ordering::AcqRel);
    }

    /// Leave a call.
    #[inline]
    pub(crate) fn unguard(&self) {
        self.accessors.fetch_sub(1, Ordering::AcqRel);
    }

    /// Process-local accessor count.
    #[inline]
    pub(crate) fn accessors(&self) -> i64 {
        self.accessors.load(Ordering::Acquire)
    }

    /// Bring the chain up to `new_slots` if `observed` is still current.
    ///
    /// Maps a fresh extent and CAS-installs it at the tail; when another
    /// thread wins the race the duplicate is unmapped and the winner's extent
    /// is adopted.
    pub(crate) fn resize(&self, observed: *const Extent, new_slots: i64) -> Result<&Extent, Error> {
        let cur_ptr = self.current.load(Ordering::Acquire);
        if cur_ptr as *const Extent != observed {
            return Ok(unsafe { &*cur_ptr });
        }
        let cur = unsafe { &*cur_ptr };
        if cur.slots == new_slots {
            return Ok(cur);
        }

        let next = Extent::map(self.fd, new_slots)?;
        if cur
            .next
            .compare_exchange(ptr::null_mut(), next, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let _ = self.current.compare_exchange(
                cur_ptr,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        } else {
            let winner = cur.next.load(Ordering::Acquire);
            let _ = self.current.compare_exchange(
                cur_ptr,
                winner,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            unsafe { Extent::unmap_free(next) };
        }
        Ok(self.current())
    }

    /// Unmap extents made stale by growth, once no other call in this
    /// process can still hold a pointer into them.
    pub(crate) fn release_prev(&self) {
        loop {
            let head = self.prev.load(Ordering::Acquire);
            if head == self.current.load(Ordering::Acquire) {
                return;
            }
            if self.accessors.load(Ordering::Acquire) > 1 {
                return;
            }
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if self
                .prev
                .compare_exchange(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            unsafe { Extent::unmap_free(head) };
        }
    }

    /// Remove the name from the shared-memory namespace.
    pub(crate) fn unlink(&self) -> Result<(), Error> {
        if unsafe { libc::shm_unlink(self.name.as_ptr()) } < 0 {
            return Err(Error::Sys);
        }
        debug!("unlinked shared object {:?}", self.name);
        Ok(())
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let mut ext = self.prev.load(Ordering::Acquire);
        while !ext.is_null() {
            let next = unsafe { (*ext).next.load(Ordering::Acquire) };
            unsafe { Extent::unmap_free(ext) };
            ext = next;
        }
        unsafe { libc::close(self.fd) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::unique_name;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("/ok").is_ok());
        assert!(validate_name("ok-too").is_ok());
        assert_eq!(validate_name("").unwrap_err(), Error::Path);
        let long = "x".repeat(libc::PATH_MAX as usize + 1);
        assert_eq!(validate_name(&long).unwrap_err(), Error::Path);
        assert_eq!(validate_name("bad\0name").unwrap_err(), Error::Path);
    }

    #[test]
    fn test_create_open_unlink() {
        let name = unique_name("shm");
        let region = Region::create(&name).unwrap();
        assert_eq!(region.current().slots(), PAGE_SLOTS);

        // Second create must refuse; open must succeed.
        assert_eq!(Region::create(&name).unwrap_err(), Error::Exist);
        {
            // Write SIZE so open's settle loop agrees with the stat size.
            pr::store(region.current().slot_ptr(hdr::SIZE), PAGE_SLOTS);
            let other = Region::open(&name).unwrap();
            assert_eq!(other.current().slots(), PAGE_SLOTS);
        }

        region.unlink().unwrap();
        assert_eq!(Region::open(&name).unwrap_err(), Error::Exist);
    }

    #[test]
    fn test_open_missing() {
        assert_eq!(
            Region::open(&unique_name("missing")).unwrap_err(),
            Error::Exist
        );
    }

    #[test]
    fn test_guard_counts() {
        let name = unique_name("guard");
        let region = Region::create(&name).unwrap();
        region.guard();
        region.guard();
        assert_eq!(region.accessors(), 2);
        region.unguard();
        assert_eq!(region.accessors(), 1);
        region.unguard();
        region.unlink().unwrap();
    }
}
