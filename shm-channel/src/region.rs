//! Named shared-memory mapping holding one channel's headers and buffers.
//!
//! The region is never exposed as a Rust reference: the peer process writes
//! into it concurrently, so every access copies through raw pointers at a
//! bounds-checked offset.

use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr::{self, NonNull};

use crate::error::{ShmError, ShmResult};
use crate::layout::{
    FRAME_HEADER_SIZE, FrameHeader, PACKET_HEADER_SIZE, PacketHeader, RegionLayout, frame_field,
};
use crate::lock::OwnerLock;

pub struct SharedRegion {
    name: String,
    layout: RegionLayout,
    base: NonNull<u8>,
    len: usize,
    _fd: OwnedFd,
    /// Held by the creator only; released after the name is unlinked.
    lock: Option<OwnerLock>,
}

// The mapping stays valid for the lifetime of the value; nothing ties it to a thread.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Creates a fresh zero-filled region. Fails with [`ShmError::InUse`]
    /// while a live process owns the name; a stale object left behind by a
    /// crashed creator is removed first. The name is unlinked again when the
    /// returned value drops.
    pub fn create(name: &str, layout: RegionLayout) -> ShmResult<Self> {
        let lock = OwnerLock::acquire(name)?;
        Self::create_locked(name, layout, lock)
    }

    /// [`create`](Self::create) for a caller that took the owner lock
    /// earlier, before setting up other objects under the same owner.
    pub fn create_locked(
        name: &str,
        layout: RegionLayout,
        mut lock: OwnerLock,
    ) -> ShmResult<Self> {
        let c_name = os_name(name)?;
        let len = layout.total_size();

        remove(name)?;
        let raw = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                0o600 as libc::c_uint,
            )
        };
        if raw < 0 {
            return Err(ShmError::last_os("shm_open", name));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let mapped = size_fd(&fd, len, name).and_then(|_| map_fd(fd.as_raw_fd(), len, name));
        let base = match mapped {
            Ok(base) => base,
            Err(e) => {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
                return Err(e);
            }
        };
        let mut region = Self {
            name: name.to_string(),
            layout,
            base,
            len,
            _fd: fd,
            lock: None,
        };
        // Openers accept the object only once its identity is published.
        let published =
            fd_stat(&region._fd, name).and_then(|stat| lock.publish(stat.st_ino as u64));
        if let Err(e) = published {
            unsafe { libc::shm_unlink(c_name.as_ptr()) };
            return Err(e);
        }
        region.lock = Some(lock);

        log::debug!("created shared region {} ({})", name, layout);
        Ok(region)
    }

    /// Attaches to a region published by another process. Returns `Ok(None)`
    /// while the name does not exist or its creator has not published it yet,
    /// and when the object was left behind by a creator that is no longer
    /// running.
    pub fn open(name: &str, layout: RegionLayout) -> ShmResult<Option<Self>> {
        let c_name = os_name(name)?;
        let raw = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if raw < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(None);
            }
            return Err(ShmError::from_io("shm_open", name, err));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let stat = fd_stat(&fd, name)?;
        match OwnerLock::published(name)? {
            Some(id) if id == stat.st_ino as u64 => {}
            Some(_) => return Ok(None),
            None => {
                log::debug!("region {} has no running owner", name);
                return Ok(None);
            }
        }
        let actual = stat.st_size.max(0) as usize;
        let expected = layout.total_size();
        if page_round(actual) != page_round(expected) || actual < expected {
            return Err(ShmError::SizeMismatch {
                name: name.to_string(),
                expected,
                actual,
            });
        }

        let base = map_fd(fd.as_raw_fd(), expected, name)?;
        log::debug!("attached shared region {} ({})", name, layout);
        Ok(Some(Self {
            name: name.to_string(),
            layout,
            base,
            len: expected,
            _fd: fd,
            lock: None,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn is_owner(&self) -> bool {
        self.lock.is_some()
    }

    pub fn read_frame_header(&self) -> FrameHeader {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        self.copy_out(self.layout.frame_header_offset(), &mut buf);
        FrameHeader::decode(&buf)
    }

    /// Writes the whole frame header. The shutdown flag is sticky: once a
    /// shutdown was requested, a later header write cannot clear it.
    pub fn write_frame_header(&mut self, header: &FrameHeader) {
        let mut header = *header;
        header.shutdown |= self.shutdown_requested();
        self.copy_in(self.layout.frame_header_offset(), &header.encode());
    }

    pub fn read_packet_header(&self) -> PacketHeader {
        let mut buf = [0u8; PACKET_HEADER_SIZE];
        self.copy_out(self.layout.packet_header_offset(), &mut buf);
        PacketHeader::decode(&buf)
    }

    pub fn write_packet_header(&mut self, header: &PacketHeader) {
        self.copy_in(self.layout.packet_header_offset(), &header.encode());
    }

    pub fn request_shutdown(&mut self) {
        let at = self.layout.frame_header_offset() + frame_field::SHUTDOWN;
        // SAFETY: header offsets are below FRAME_HEADER_SIZE <= len.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(at), 1) };
    }

    pub fn shutdown_requested(&self) -> bool {
        let at = self.layout.frame_header_offset() + frame_field::SHUTDOWN;
        // SAFETY: header offsets are below FRAME_HEADER_SIZE <= len.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(at)) != 0 }
    }

    pub fn write_frame_payload(&mut self, data: &[u8]) -> ShmResult<()> {
        check_len("frame", data.len(), self.layout.frame_capacity)?;
        self.copy_in(self.layout.frame_buffer_offset(), data);
        Ok(())
    }

    /// Replaces the contents of `dst` with the first `len` bytes of the frame buffer.
    pub fn read_frame_payload(&self, len: usize, dst: &mut Vec<u8>) -> ShmResult<()> {
        check_len("frame", len, self.layout.frame_capacity)?;
        dst.resize(len, 0);
        self.copy_out(self.layout.frame_buffer_offset(), dst);
        Ok(())
    }

    pub fn write_packet_payload(&mut self, data: &[u8]) -> ShmResult<()> {
        check_len("packet", data.len(), self.layout.packet_capacity)?;
        self.copy_in(self.layout.packet_buffer_offset(), data);
        Ok(())
    }

    /// Replaces the contents of `dst` with the first `len` bytes of the packet buffer.
    pub fn read_packet_payload(&self, len: usize, dst: &mut Vec<u8>) -> ShmResult<()> {
        check_len("packet", len, self.layout.packet_capacity)?;
        dst.resize(len, 0);
        self.copy_out(self.layout.packet_buffer_offset(), dst);
        Ok(())
    }

    fn copy_in(&mut self, offset: usize, src: &[u8]) {
        assert!(offset + src.len() <= self.len, "write outside mapping");
        // SAFETY: range checked above, `src` is process-local memory.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.base.as_ptr().add(offset), src.len());
        }
    }

    fn copy_out(&self, offset: usize, dst: &mut [u8]) {
        assert!(offset + dst.len() <= self.len, "read outside mapping");
        // SAFETY: range checked above, `dst` is process-local memory.
        unsafe {
            ptr::copy_nonoverlapping(self.base.as_ptr().add(offset), dst.as_mut_ptr(), dst.len());
        }
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.base.as_ptr().cast(), self.len) };
        if self.lock.is_some() {
            if let Ok(c_name) = os_name(&self.name) {
                unsafe { libc::shm_unlink(c_name.as_ptr()) };
            }
        }
        log::debug!("released shared region {}", self.name);
    }
}

fn check_len(buffer: &'static str, len: usize, capacity: usize) -> ShmResult<()> {
    if len > capacity {
        return Err(ShmError::OutOfBounds {
            buffer,
            len,
            capacity,
        });
    }
    Ok(())
}

pub(crate) fn os_name(name: &str) -> ShmResult<CString> {
    CString::new(name).map_err(|_| ShmError::InvalidName {
        name: name.to_string(),
        reason: "contains NUL byte",
    })
}

/// Removes whatever object carries `name`. A missing name is not an error.
pub fn remove(name: &str) -> ShmResult<()> {
    let c_name = os_name(name)?;
    if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(ShmError::from_io("shm_unlink", name, err));
        }
    }
    Ok(())
}

fn size_fd(fd: &OwnedFd, len: usize, name: &str) -> ShmResult<()> {
    if unsafe { libc::ftruncate(fd.as_raw_fd(), len as libc::off_t) } != 0 {
        return Err(ShmError::last_os("ftruncate", name));
    }
    Ok(())
}

fn fd_stat(fd: &OwnedFd, name: &str) -> ShmResult<libc::stat> {
    // SAFETY: libc::stat is a plain C struct; zeroed is a valid baseline.
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd.as_raw_fd(), &mut stat) } != 0 {
        return Err(ShmError::last_os("fstat", name));
    }
    Ok(stat)
}

fn map_fd(fd: RawFd, len: usize, name: &str) -> ShmResult<NonNull<u8>> {
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(ShmError::last_os("mmap", name));
    }
    NonNull::new(addr.cast::<u8>()).ok_or_else(|| {
        ShmError::from_io("mmap", name, io::Error::other("null mapping"))
    })
}

/// Some platforms report shared-memory sizes rounded up to whole pages.
fn page_round(len: usize) -> usize {
    let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if page > 0 { page as usize } else { 4096 };
    len.div_ceil(page) * page
}
