//! File-backed device with optional RAID0 striping.
//!
//! One file is the common case; several files of identical size form a
//! RAID0 set striped at `stripe_size`. The logical address space is the
//! concatenation of stripes in round-robin file order:
//!
//! ```text
//! logical stripe s  →  file s % n,  physical stripe s / n
//! ```
//!
//! An I/O that crosses a stripe boundary is split per stripe and issued
//! sequentially, which trivially preserves per-stripe ordering. Writes are
//! additionally chunked at `max_write_size`.
//!
//! Files are opened with `O_DIRECT` on Linux. Some filesystems (notably
//! tmpfs) refuse the flag; the open is retried buffered in that case, which
//! keeps tests and development environments working while production block
//! devices get the real thing.

use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::Arc;

use smallvec::SmallVec;

use super::{check_io, for_each_block, AlignedBuf, Device, DeviceEncryptor};
use crate::config::{DEFAULT_BLOCK_SIZE, DEFAULT_MAX_DEVICE_WRITE_SIZE};
use crate::error::{DeviceErrorKind, Error, Result};

/// Construction parameters for [`FileDevice`]. Paths are opened in listed
/// order; striping follows that order.
pub struct FileDeviceConfig {
    pub paths: Vec<PathBuf>,
    /// Size of each underlying file. Logical capacity is `paths.len()` times
    /// this.
    pub file_size: u64,
    pub block_size: u64,
    /// Stripe width for RAID0 sets. Ignored for a single file.
    pub stripe_size: u64,
    pub max_write_size: u64,
    /// Truncate and size the files on open (fresh cache) instead of
    /// requiring them to exist with the right size.
    pub truncate: bool,
    pub encryptor: Option<Arc<dyn DeviceEncryptor>>,
}

impl FileDeviceConfig {
    pub fn new(paths: Vec<PathBuf>, file_size: u64) -> Self {
        Self {
            paths,
            file_size,
            block_size: DEFAULT_BLOCK_SIZE,
            stripe_size: 0,
            max_write_size: DEFAULT_MAX_DEVICE_WRITE_SIZE,
            truncate: true,
            encryptor: None,
        }
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn stripe_size(mut self, stripe_size: u64) -> Self {
        self.stripe_size = stripe_size;
        self
    }

    pub fn max_write_size(mut self, max_write_size: u64) -> Self {
        self.max_write_size = max_write_size;
        self
    }

    pub fn truncate(mut self, truncate: bool) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn encryptor(mut self, encryptor: Arc<dyn DeviceEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::invalid_argument("file device needs at least one path"));
        }
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(Error::invalid_argument(format!(
                "block size must be a nonzero power of two, got {}",
                self.block_size
            )));
        }
        if self.file_size == 0 || self.file_size % self.block_size != 0 {
            return Err(Error::invalid_argument(format!(
                "file size {} is not a positive multiple of block size {}",
                self.file_size, self.block_size
            )));
        }
        if self.max_write_size == 0 || self.max_write_size % self.block_size != 0 {
            return Err(Error::invalid_argument(
                "max write size must be a positive multiple of block size",
            ));
        }
        if self.paths.len() > 1 {
            if self.stripe_size == 0 || self.stripe_size % self.block_size != 0 {
                return Err(Error::invalid_argument(
                    "raid stripe size must be a positive multiple of block size",
                ));
            }
            if self.file_size % self.stripe_size != 0 {
                return Err(Error::invalid_argument(
                    "file size must be a multiple of the raid stripe size",
                ));
            }
        }
        Ok(())
    }
}

pub struct FileDevice {
    files: Vec<File>,
    file_size: u64,
    block_size: u64,
    stripe_size: u64,
    max_write_size: u64,
    encryptor: Option<Arc<dyn DeviceEncryptor>>,
}

impl FileDevice {
    pub fn open(config: FileDeviceConfig) -> Result<Self> {
        config.validate()?;

        let mut files = Vec::with_capacity(config.paths.len());
        for path in &config.paths {
            let file = open_direct(path, config.truncate)?;
            let len = file
                .metadata()
                .map_err(|_| Error::device(0, config.file_size, DeviceErrorKind::Io))?
                .len();
            if config.truncate {
                file.set_len(config.file_size)
                    .map_err(|_| Error::device(0, config.file_size, DeviceErrorKind::Io))?;
            } else if len != config.file_size {
                // All members of a set must agree on size or the stripe
                // mapping would address past one of them.
                return Err(Error::invalid_argument(format!(
                    "{} is {} bytes, expected {}",
                    path.display(),
                    len,
                    config.file_size
                )));
            }
            files.push(file);
        }

        // A single file is a degenerate one-stripe set; give it a stripe the
        // size of the file so the mapping below stays uniform.
        let stripe_size = if files.len() > 1 {
            config.stripe_size
        } else {
            config.file_size
        };

        Ok(Self {
            files,
            file_size: config.file_size,
            block_size: config.block_size,
            stripe_size,
            max_write_size: config.max_write_size,
            encryptor: config.encryptor,
        })
    }

    /// Splits `[offset, offset + len)` into per-stripe spans of
    /// `(file, physical_offset, buf_start, span_len)`.
    fn stripe_spans(&self, offset: u64, len: u64) -> SmallVec<[(usize, u64, usize, usize); 4]> {
        let nfiles = self.files.len() as u64;
        let mut spans = SmallVec::new();
        let mut cursor = offset;
        let end = offset + len;
        while cursor < end {
            let stripe = cursor / self.stripe_size;
            let within = cursor % self.stripe_size;
            let span = (self.stripe_size - within).min(end - cursor);
            let file = (stripe % nfiles) as usize;
            let physical = (stripe / nfiles) * self.stripe_size + within;
            spans.push((file, physical, (cursor - offset) as usize, span as usize));
            cursor += span;
        }
        spans
    }

    fn read_raw(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let total = buf.len() as u64;
        for (file, physical, start, len) in self.stripe_spans(offset, total) {
            self.files[file]
                .read_exact_at(&mut buf[start..start + len], physical)
                .map_err(|e| {
                    let kind = if e.kind() == std::io::ErrorKind::UnexpectedEof {
                        DeviceErrorKind::Short
                    } else {
                        DeviceErrorKind::Io
                    };
                    Error::device(offset, total, kind)
                })?;
        }
        Ok(())
    }

    fn write_raw(&self, offset: u64, buf: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;

        let total = buf.len() as u64;
        for (file, physical, start, len) in self.stripe_spans(offset, total) {
            let mut chunk_start = 0usize;
            while chunk_start < len {
                let chunk = (len - chunk_start).min(self.max_write_size as usize);
                self.files[file]
                    .write_all_at(
                        &buf[start + chunk_start..start + chunk_start + chunk],
                        physical + chunk_start as u64,
                    )
                    .map_err(|_| Error::device(offset, total, DeviceErrorKind::Io))?;
                chunk_start += chunk;
            }
        }
        Ok(())
    }
}

impl Device for FileDevice {
    fn size(&self) -> u64 {
        self.file_size * self.files.len() as u64
    }

    fn io_alignment(&self) -> u64 {
        self.block_size
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_io(self.block_size, self.size(), offset, buf.len() as u64)?;
        self.read_raw(offset, buf)?;
        if let Some(encryptor) = &self.encryptor {
            for_each_block(encryptor, offset, self.block_size, buf, true)?;
        }
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_io(self.block_size, self.size(), offset, buf.len() as u64)?;
        match &self.encryptor {
            Some(encryptor) => {
                // Encrypt a copy; the caller's buffer stays plaintext (it may
                // be a live in-memory region buffer serving reads).
                let mut scratch = AlignedBuf::zeroed(buf.len(), self.block_size as usize);
                scratch.copy_from_slice(buf);
                for_each_block(encryptor, offset, self.block_size, &mut scratch, false)?;
                self.write_raw(offset, &scratch)
            }
            None => self.write_raw(offset, buf),
        }
    }

    fn flush(&self) -> Result<()> {
        for file in &self.files {
            file.sync_data()
                .map_err(|_| Error::device(0, 0, DeviceErrorKind::Io))?;
        }
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn open_direct(path: &std::path::Path, truncate: bool) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt;
    use tracing::warn;

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(truncate);
    match options
        .clone()
        .custom_flags(libc::O_DIRECT)
        .open(path)
    {
        Ok(file) => Ok(file),
        Err(direct_err) => {
            warn!(
                path = %path.display(),
                error = %direct_err,
                "O_DIRECT open failed, falling back to buffered i/o"
            );
            options
                .open(path)
                .map_err(|_| Error::device(0, 0, DeviceErrorKind::Io))
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn open_direct(path: &std::path::Path, truncate: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(truncate)
        .open(path)
        .map_err(|_| Error::device(0, 0, DeviceErrorKind::Io))
}
