//! Raw block device I/O
//!
//! Direct disk access bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! All offsets and lengths handed to [`RawFile`] must be multiples of
//! [`MEM_ALIGNMENT`]; [`AlignedBuffer`] provides heap buffers with the
//! matching memory alignment.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::fs::FileExt;

/// Memory and disk alignment for direct I/O.
pub const MEM_ALIGNMENT: usize = 512;

/// Raw file or block device handle with direct I/O.
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
}

impl RawFile {
    /// Open an existing file or block device for raw read-write I/O.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = Self::open_direct(&path, false)?;
        Self::disable_cache(&file)?;

        let size = Self::probe_size(&file, &path)?;
        Ok(Self {
            file,
            path: path_str,
            size,
        })
    }

    /// Create (or truncate) a regular file of the given size for raw I/O.
    ///
    /// Opening an existing block device goes through [`RawFile::open`];
    /// this is for file-backed stores and tests.
    pub fn create(path: impl AsRef<Path>, size: u64) -> io::Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = Self::open_direct(&path, true)?;
        Self::disable_cache(&file)?;
        file.set_len(size)?;

        Ok(Self {
            file,
            path: path_str,
            size,
        })
    }

    /// Open with O_DIRECT where the filesystem supports it, falling back
    /// to buffered I/O otherwise (tmpfs and some network filesystems
    /// reject the flag with EINVAL).
    fn open_direct(path: impl AsRef<Path>, create: bool) -> io::Result<File> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if create {
            options.create(true).truncate(true);
        }

        #[cfg(target_os = "linux")]
        {
            let mut direct = OpenOptions::new();
            direct.read(true).write(true);
            if create {
                direct.create(true).truncate(true);
            }
            direct.custom_flags(libc::O_DIRECT);
            match direct.open(&path) {
                Ok(file) => return Ok(file),
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {}
                Err(e) => return Err(e),
            }
        }

        options.open(&path)
    }

    #[cfg(target_os = "macos")]
    fn disable_cache(file: &File) -> io::Result<()> {
        use std::os::unix::io::AsRawFd;
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    fn disable_cache(_file: &File) -> io::Result<()> {
        Ok(())
    }

    /// Size of the file, or of the whole device for block devices.
    #[cfg(target_os = "linux")]
    fn probe_size(file: &File, path: impl AsRef<Path>) -> io::Result<u64> {
        use std::os::unix::fs::FileTypeExt;
        use std::os::unix::io::AsRawFd;

        let meta = std::fs::metadata(&path)?;
        if !meta.file_type().is_block_device() {
            return Ok(meta.len());
        }

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;
        let mut size: u64 = 0;
        let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if rc == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn probe_size(_file: &File, path: impl AsRef<Path>) -> io::Result<u64> {
        Ok(std::fs::metadata(&path)?.len())
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Read `buf.len()` bytes at `offset`. Alignment applies to both.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file.read_exact_at(buf, offset)
    }

    /// Write `buf` at `offset`. Alignment applies to both.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.check_alignment(offset, buf.len())?;
        self.file.write_all_at(buf, offset)
    }

    /// Flush written data to stable storage (fdatasync).
    pub fn sync_data(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn check_alignment(&self, offset: u64, len: usize) -> io::Result<()> {
        if offset as usize % MEM_ALIGNMENT != 0 || len % MEM_ALIGNMENT != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "unaligned I/O on {}: offset {} len {}",
                    self.path, offset, len
                ),
            ));
        }
        Ok(())
    }
}

/// Heap buffer aligned for direct I/O.
///
/// O_DIRECT requires the user buffer itself to be aligned to the device
/// sector size; a plain `Vec<u8>` gives no such guarantee.
#[derive(Debug)]
pub struct AlignedBuffer {
    data: Vec<u8>,
    alignment: usize,
}

impl AlignedBuffer {
    /// Allocate a zeroed aligned buffer, rounding `size` up to the
    /// alignment.
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self::with_alignment(size, MEM_ALIGNMENT)
    }

    #[must_use]
    pub fn with_alignment(size: usize, alignment: usize) -> Self {
        use std::alloc::{alloc_zeroed, Layout};

        let aligned_size = size.div_ceil(alignment) * alignment;
        let layout =
            Layout::from_size_align(aligned_size, alignment).expect("invalid buffer layout");

        let data = unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            Vec::from_raw_parts(ptr, aligned_size, aligned_size)
        };

        Self { data, alignment }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Copy `src` into the buffer, zero-padding the tail.
    pub fn copy_from(&mut self, src: &[u8]) {
        let n = src.len().min(self.data.len());
        self.data[..n].copy_from_slice(&src[..n]);
        if n < self.data.len() {
            self.data[n..].fill(0);
        }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        use std::alloc::{dealloc, Layout};

        if !self.data.is_empty() {
            let layout = Layout::from_size_align(self.data.capacity(), self.alignment)
                .expect("invalid buffer layout");
            unsafe {
                let ptr = self.data.as_mut_ptr();
                std::mem::forget(std::mem::take(&mut self.data));
                dealloc(ptr, layout);
            }
        }
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
