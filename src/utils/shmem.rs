//! Named shared-memory regions backed by `/dev/shm`.
//!
//! A superblock (or request/reply buffer) is a fixed-size named region
//! created by the client process and opened read-write by the delegator on
//! mount. Layout within the region is offset-based; accessors below copy in
//! and out of the mapping so no references into the shared bytes escape.

use std::ffi::CString;
use std::num::NonZeroUsize;
use std::os::fd::{AsRawFd, IntoRawFd, RawFd};
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{close, ftruncate};

use crate::utils::StagefsError;

/// A named POSIX shared-memory region. The creating side owns the name and
/// unlinks it on drop; openers only unmap.
pub struct ShmRegion {
    ptr: NonNull<u8>,
    size: usize,
    name: CString,
    fd: RawFd,
    is_owner: bool,
}

// The raw mapping is only touched through the copying accessors below, which
// are safe to call from multiple tasks (both sides treat the region as plain
// bytes with count-word publication).
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates a new shared-memory region of `size` bytes under `name`.
    pub fn create(name: &str, size: usize) -> Result<Self, StagefsError> {
        let cname = region_name(name)?;

        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )?;
        let raw_fd = fd.as_raw_fd();

        if let Err(e) = ftruncate(&fd, size as i64) {
            let _ = close(raw_fd);
            let _ = shm_unlink(cname.as_c_str());
            return Err(e.into());
        }

        let len = NonZeroUsize::new(size)
            .ok_or_else(|| StagefsError::msg("region size must be non-zero"))?;
        let ptr = match unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                let _ = shm_unlink(cname.as_c_str());
                return Err(e.into());
            }
        };

        Ok(ShmRegion {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name: cname,
            fd: fd.into_raw_fd(),
            is_owner: true,
        })
    }

    /// Opens an existing shared-memory region of known size.
    pub fn open(name: &str, size: usize) -> Result<Self, StagefsError> {
        let cname = region_name(name)?;

        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty())?;
        let raw_fd = fd.as_raw_fd();

        let len = NonZeroUsize::new(size)
            .ok_or_else(|| StagefsError::msg("region size must be non-zero"))?;
        let ptr = match unsafe {
            mmap(
                None,
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(p) => p,
            Err(e) => {
                let _ = close(raw_fd);
                return Err(e.into());
            }
        };

        Ok(ShmRegion {
            ptr: unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) },
            size,
            name: cname,
            fd: fd.into_raw_fd(),
            is_owner: false,
        })
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Copies `buf.len()` bytes out of the region starting at `offset`.
    pub fn read_at(
        &self,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), StagefsError> {
        self.check_bounds(offset, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.ptr.as_ptr().add(offset),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    /// Copies `data` into the region starting at `offset`.
    pub fn write_at(
        &self,
        offset: usize,
        data: &[u8],
    ) -> Result<(), StagefsError> {
        self.check_bounds(offset, data.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.ptr.as_ptr().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    /// Reads the `u64` count word at `offset`.
    pub fn read_u64(&self, offset: usize) -> Result<u64, StagefsError> {
        let mut word = [0u8; 8];
        self.read_at(offset, &mut word)?;
        Ok(u64::from_le_bytes(word))
    }

    /// Writes the `u64` count word at `offset`.
    pub fn write_u64(
        &self,
        offset: usize,
        val: u64,
    ) -> Result<(), StagefsError> {
        self.write_at(offset, &val.to_le_bytes())
    }

    fn check_bounds(
        &self,
        offset: usize,
        len: usize,
    ) -> Result<(), StagefsError> {
        if offset.checked_add(len).map(|end| end > self.size).unwrap_or(true) {
            Err(StagefsError(format!(
                "region access [{}, +{}) out of bound {}",
                offset, len, self.size
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(
                NonNull::new_unchecked(self.ptr.as_ptr() as *mut _),
                self.size,
            );
            let _ = close(self.fd);

            if self.is_owner {
                let _ = shm_unlink(self.name.as_c_str());
            }
        }
    }
}

fn region_name(name: &str) -> Result<CString, StagefsError> {
    // shm object names must be of the form "/name"
    let name = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    };
    CString::new(name)
        .map_err(|_| StagefsError::msg("region name contains null byte"))
}

/// Queries the system page size; region record arrays start one page after
/// their count word.
pub fn page_size() -> usize {
    nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .unwrap_or(4096) as usize
}

#[cfg(test)]
mod shmem_tests {
    use super::*;

    #[test]
    fn create_then_open() -> Result<(), StagefsError> {
        let name = format!("stagefs-test-region-{}", std::process::id());
        let region = ShmRegion::create(&name, 4096)?;
        region.write_u64(64, 0xdeadbeef)?;

        let other = ShmRegion::open(&name, 4096)?;
        assert_eq!(other.read_u64(64)?, 0xdeadbeef);

        let mut buf = vec![0u8; 4];
        other.write_at(128, b"mark")?;
        region.read_at(128, &mut buf)?;
        assert_eq!(&buf, b"mark");
        Ok(())
    }

    #[test]
    fn out_of_bound_access() -> Result<(), StagefsError> {
        let name = format!("stagefs-test-oob-{}", std::process::id());
        let region = ShmRegion::create(&name, 4096)?;
        assert!(region.write_at(4090, b"too long").is_err());
        assert!(region.read_u64(4095).is_err());
        Ok(())
    }
}
