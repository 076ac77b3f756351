//! RAM-backed device.
//!
//! Enforces the same alignment contract as the file device so unit tests
//! exercising engine I/O catch misaligned offsets the way real hardware
//! would. Also accepts an encryptor, which keeps the transform logic
//! testable without a file system.

use std::sync::Arc;

use parking_lot::RwLock;

use super::{check_io, for_each_block, Device, DeviceEncryptor};
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::error::Result;

pub struct MemoryDevice {
    data: RwLock<Vec<u8>>,
    block_size: u64,
    encryptor: Option<Arc<dyn DeviceEncryptor>>,
}

impl MemoryDevice {
    pub fn new(size: u64) -> Self {
        Self::with_block_size(size, DEFAULT_BLOCK_SIZE)
    }

    pub fn with_block_size(size: u64, block_size: u64) -> Self {
        assert!(block_size > 0 && block_size.is_power_of_two());
        assert!(size % block_size == 0, "device size must be block-aligned");
        Self {
            data: RwLock::new(vec![0u8; size as usize]),
            block_size,
            encryptor: None,
        }
    }

    pub fn with_encryptor(mut self, encryptor: Arc<dyn DeviceEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }
}

impl Device for MemoryDevice {
    fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn io_alignment(&self) -> u64 {
        self.block_size
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        check_io(self.block_size, self.size(), offset, buf.len() as u64)?;
        {
            let data = self.data.read();
            buf.copy_from_slice(&data[offset as usize..offset as usize + buf.len()]);
        }
        if let Some(encryptor) = &self.encryptor {
            for_each_block(encryptor, offset, self.block_size, buf, true)?;
        }
        Ok(())
    }

    fn write(&self, offset: u64, buf: &[u8]) -> Result<()> {
        check_io(self.block_size, self.size(), offset, buf.len() as u64)?;
        match &self.encryptor {
            Some(encryptor) => {
                let mut scratch = buf.to_vec();
                for_each_block(encryptor, offset, self.block_size, &mut scratch, false)?;
                let mut data = self.data.write();
                data[offset as usize..offset as usize + buf.len()].copy_from_slice(&scratch);
                Ok(())
            }
            None => {
                let mut data = self.data.write();
                data[offset as usize..offset as usize + buf.len()].copy_from_slice(buf);
                Ok(())
            }
        }
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DeviceErrorKind, Error};

    /// XOR keystream derived from the block tweak; enough to prove that the
    /// device transforms every block with the right tweak, in both
    /// directions.
    struct XorTweak;

    impl DeviceEncryptor for XorTweak {
        fn encrypt_block(&self, tweak: u64, block: &mut [u8]) -> Result<()> {
            let k = crate::hash::mix64(tweak).to_le_bytes();
            for (i, b) in block.iter_mut().enumerate() {
                *b ^= k[i % 8];
            }
            Ok(())
        }

        fn decrypt_block(&self, tweak: u64, block: &mut [u8]) -> Result<()> {
            self.encrypt_block(tweak, block)
        }
    }

    #[test]
    fn read_returns_written_bytes() {
        let device = MemoryDevice::new(1 << 20);
        let mut out = vec![0u8; 4096];
        out[0] = 1;
        out[4095] = 2;
        device.write(4096, &out).unwrap();

        let mut back = vec![0u8; 4096];
        device.read(4096, &mut back).unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn rejects_unaligned_length() {
        let device = MemoryDevice::new(1 << 20);
        let mut buf = vec![0u8; 100];
        assert!(matches!(
            device.read(0, &mut buf),
            Err(Error::Device {
                kind: DeviceErrorKind::Misaligned,
                ..
            })
        ));
    }

    #[test]
    fn encryption_round_trips_and_scrambles_at_rest() {
        let device = MemoryDevice::new(1 << 20).with_encryptor(Arc::new(XorTweak));
        let out = vec![0xabu8; 8192];
        device.write(8192, &out).unwrap();

        // At-rest bytes differ from plaintext.
        assert_ne!(
            &device.data.read()[8192..8192 + 8192],
            out.as_slice(),
            "device stored plaintext"
        );

        let mut back = vec![0u8; 8192];
        device.read(8192, &mut back).unwrap();
        assert_eq!(back, out);
    }

    #[test]
    fn distinct_blocks_use_distinct_tweaks() {
        let device = MemoryDevice::new(1 << 20).with_encryptor(Arc::new(XorTweak));
        let out = vec![0u8; 8192];
        device.write(0, &out).unwrap();

        let data = device.data.read();
        assert_ne!(&data[0..4096], &data[4096..8192]);
    }
}
