//! Big-endian bit accumulator used by the section and packet encoders.

use bitstream_io::{BigEndian, BitWrite, BitWriter as RawWriter};
use std::io;

/// Accumulates fixed-width fields into a byte buffer, MSB first.
pub struct BitWriter {
    inner: RawWriter<Vec<u8>, BigEndian>,
    bits: u64,
}

impl Default for BitWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BitWriter {
    pub fn new() -> Self {
        Self {
            inner: RawWriter::endian(Vec::new(), BigEndian),
            bits: 0,
        }
    }

    /// Append `value` as an unsigned field of `bits` width.
    ///
    /// A value wider than the field is rejected by the underlying writer.
    pub fn add_int(&mut self, bits: u32, value: u64) -> io::Result<()> {
        self.inner.write(bits, value)?;
        self.bits += u64::from(bits);
        Ok(())
    }

    pub fn add_flag(&mut self, flag: bool) -> io::Result<()> {
        self.inner.write_bit(flag)?;
        self.bits += 1;
        Ok(())
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.inner.write_bytes(bytes)?;
        self.bits += 8 * bytes.len() as u64;
        Ok(())
    }

    /// Number of bits written so far.
    pub fn bit_len(&self) -> u64 {
        self.bits
    }

    /// Consume the writer and return the accumulated bytes.
    pub fn finish(self) -> io::Result<Vec<u8>> {
        if !self.inner.byte_aligned() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bit writer not byte aligned ({} bits)", self.bits),
            ));
        }
        Ok(self.inner.into_writer())
    }
}
