//! Raw region I/O.
//!
//! Each of the three engine regions (data, metadata, journal) is backed by
//! a [`RawFile`]: a device or regular file opened, when configured, with
//! direct I/O (O_DIRECT on Linux, F_NOCACHE on macOS) so that writes hit
//! the medium without the page cache in between. All engine I/O through a
//! `RawFile` is offset/length aligned to the region's alignment.

use blockvault_common::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::ptr::NonNull;

#[cfg(target_os = "linux")]
use std::os::unix::io::AsRawFd;

/// Raw file handle for one storage region.
pub struct RawFile {
    file: File,
    path: String,
    /// Region window within the device.
    base: u64,
    size: u64,
    /// Required alignment of offsets and lengths.
    alignment: usize,
    direct: bool,
}

impl RawFile {
    /// Open a region window of a device or file.
    ///
    /// `size == 0` uses everything from `base` to the end of the device.
    pub fn open(
        path: impl AsRef<Path>,
        base: u64,
        size: u64,
        alignment: usize,
        direct: bool,
        write: bool,
    ) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        let mut options = OpenOptions::new();
        options.read(true);
        if write {
            options.write(true);
        }
        #[cfg(target_os = "linux")]
        {
            if direct {
                options.custom_flags(libc::O_DIRECT);
            }
        }

        let file = options
            .open(&path)
            .map_err(|e| Error::config(format!("failed to open {path_str}: {e}")))?;

        #[cfg(target_os = "macos")]
        {
            if direct {
                use std::os::unix::io::AsRawFd;
                let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
                if rc == -1 {
                    return Err(Error::config(format!(
                        "failed to set F_NOCACHE on {path_str}: {}",
                        std::io::Error::last_os_error()
                    )));
                }
            }
        }

        let device_size = Self::device_size(&file, &path_str)?;
        if base > device_size {
            return Err(Error::config(format!(
                "region offset {base} beyond end of {path_str} ({device_size} bytes)"
            )));
        }
        let size = if size == 0 { device_size - base } else { size };
        if base + size > device_size {
            return Err(Error::config(format!(
                "region [{base}, {}) beyond end of {path_str} ({device_size} bytes)",
                base + size
            )));
        }

        Ok(Self {
            file,
            path: path_str,
            base,
            size,
            alignment,
            direct,
        })
    }

    /// Create (or truncate) a regular file of `size` bytes and open it as
    /// a region. Block devices are opened as-is with their native size.
    pub fn create(path: impl AsRef<Path>, size: u64, alignment: usize, direct: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block = std::fs::metadata(&path)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);

        if !is_block {
            let file = File::create(&path)
                .map_err(|e| Error::config(format!("failed to create {path_str}: {e}")))?;
            file.set_len(size)
                .map_err(|e| Error::config(format!("failed to size {path_str}: {e}")))?;
        }
        Self::open(path, 0, 0, alignment, direct, true)
    }

    fn device_size(file: &File, path: &str) -> Result<u64> {
        let meta = file
            .metadata()
            .map_err(|e| Error::config(format!("failed to stat {path}: {e}")))?;
        if meta.file_type().is_block_device() {
            Self::block_device_size(file, path)
        } else {
            Ok(meta.len())
        }
    }

    #[cfg(target_os = "linux")]
    fn block_device_size(file: &File, path: &str) -> Result<u64> {
        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
        let mut size: u64 = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if rc == -1 {
            return Err(Error::config(format!(
                "failed to get device size of {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn block_device_size(_file: &File, path: &str) -> Result<u64> {
        Err(Error::config(format!(
            "block devices are not supported on this platform: {path}"
        )))
    }

    /// Region length in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    fn check_io(&self, offset: u64, len: usize) -> Result<()> {
        if self.direct
            && (offset as usize % self.alignment != 0 || len % self.alignment != 0)
        {
            return Err(Error::invalid(format!(
                "unaligned I/O on {}: offset {offset}, len {len}, alignment {}",
                self.path, self.alignment
            )));
        }
        if offset + len as u64 > self.size {
            return Err(Error::invalid(format!(
                "I/O past end of region {}: offset {offset}, len {len}, size {}",
                self.path, self.size
            )));
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at region offset `offset`.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.check_io(offset, buf.len())?;
        self.file.read_exact_at(buf, self.base + offset)?;
        Ok(())
    }

    /// Write `buf` at region offset `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.check_io(offset, buf.len())?;
        self.file.write_all_at(buf, self.base + offset)?;
        Ok(())
    }

    /// Flush written data to the medium (fdatasync).
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// Heap buffer aligned for direct I/O, zero-initialized.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer of `size` bytes aligned to `alignment`.
    /// The size is rounded up to a whole multiple of the alignment.
    pub fn new(size: usize, alignment: usize) -> Self {
        let len = size.div_ceil(alignment).max(1) * alignment;
        let layout = Layout::from_size_align(len, alignment).expect("bad buffer layout");
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).expect("aligned allocation failed");
        Self { ptr, len, layout }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Copy `src` into the front of the buffer, zero-padding the rest.
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.len);
        let slice = self.as_mut_slice();
        slice[..n].copy_from_slice(&src[..n]);
        slice[n..].fill(0);
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AlignedBuffer({} bytes)", self.len)
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_aligned_buffer_rounds_and_zeroes() {
        let mut buf = AlignedBuffer::new(100, 512);
        assert_eq!(buf.len(), 512);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.copy_from(b"abc");
        assert_eq!(&buf.as_slice()[..3], b"abc");
        assert_eq!(buf.as_slice()[3], 0);
    }

    #[test]
    fn test_region_window() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");

        let file = RawFile::create(&path, 8192, 512, false).unwrap();
        file.write_at(4096, &[0xAA; 512]).unwrap();
        file.sync_data().unwrap();
        drop(file);

        // A window starting at 4096 sees the same bytes at offset 0.
        let win = RawFile::open(&path, 4096, 4096, 512, false, false).unwrap();
        assert_eq!(win.size(), 4096);
        let mut buf = [0u8; 512];
        win.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn test_out_of_region_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dev.bin");
        let file = RawFile::create(&path, 4096, 512, false).unwrap();
        assert!(file.write_at(4096, &[0u8; 512]).is_err());
    }
}
