//! Collective communication and restart packing.
//!
//! Analyses are written against [`Communicator`] so that quantities which must
//! agree across partitions (port counts, norms) go through an explicit
//! reduction. Collectives block until every partition contributes and must be
//! called in the same order everywhere.

use crate::error::{Error, Result};

/// Collective operations across cooperating partitions.
pub trait Communicator: Send + Sync {
    fn num_procs(&self) -> usize;

    fn rank(&self) -> usize;

    /// Element-wise global sum.
    fn sum_all(&self, values: &[f64]) -> Vec<f64>;

    /// Element-wise global minimum.
    fn min_all(&self, values: &[f64]) -> Vec<f64>;

    /// Element-wise global maximum.
    fn max_all(&self, values: &[f64]) -> Vec<f64>;
}

/// Single-partition communicator; every reduction is the identity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialComm;

impl Communicator for SerialComm {
    fn num_procs(&self) -> usize {
        1
    }

    fn rank(&self) -> usize {
        0
    }

    fn sum_all(&self, values: &[f64]) -> Vec<f64> {
        values.to_vec()
    }

    fn min_all(&self, values: &[f64]) -> Vec<f64> {
        values.to_vec()
    }

    fn max_all(&self, values: &[f64]) -> Vec<f64> {
        values.to_vec()
    }
}

/// Little-endian writer for restart records.
#[derive(Debug, Clone, Default)]
pub struct PackBuffer {
    bytes: Vec<u8>,
}

impl PackBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pack_f64(&mut self, value: f64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn pack_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    pub fn pack_usize(&mut self, value: usize) {
        self.pack_u64(value as u64);
    }

    pub fn pack_bool(&mut self, value: bool) {
        self.bytes.push(u8::from(value));
    }

    /// Length-prefixed slice of `f64`.
    pub fn pack_f64_slice(&mut self, values: &[f64]) {
        self.pack_usize(values.len());
        for &v in values {
            self.pack_f64(v);
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Reader matching [`PackBuffer`].
#[derive(Debug, Clone)]
pub struct UnpackBuffer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> UnpackBuffer<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        if self.remaining() < N {
            return Err(Error::BufferUnderflow {
                wanted: N,
                remaining: self.remaining(),
            });
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn unpack_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take::<8>()?))
    }

    pub fn unpack_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take::<8>()?))
    }

    pub fn unpack_usize(&mut self) -> Result<usize> {
        Ok(self.unpack_u64()? as usize)
    }

    pub fn unpack_bool(&mut self) -> Result<bool> {
        let [b] = self.take::<1>()?;
        Ok(b != 0)
    }

    pub fn unpack_f64_vec(&mut self) -> Result<Vec<f64>> {
        let len = self.unpack_usize()?;
        if self.remaining() < len.saturating_mul(8) {
            return Err(Error::BufferUnderflow {
                wanted: len.saturating_mul(8),
                remaining: self.remaining(),
            });
        }
        (0..len).map(|_| self.unpack_f64()).collect()
    }
}
