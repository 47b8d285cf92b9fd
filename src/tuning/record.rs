//! The persisted result of one tuning run.

use std::time::Duration;

use briny::prelude::*;

use crate::error::{Error, Result};

/// Chosen local work-group size for one signature, with its measured cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningRecord {
    /// Three launch dimensions, optionally followed by a fourth tuning parameter.
    pub local_size: Vec<u32>,
    /// Average cost of the winning candidate.
    pub cost: Duration,
}

impl TuningRecord {
    pub fn new(local_size: Vec<u32>, cost: Duration) -> Self {
        Self { local_size, cost }
    }

    /// The three dimensions used for launching.
    pub fn launch_size(&self) -> [u32; 3] {
        let mut lws = [1u32; 3];
        for (dst, src) in lws.iter_mut().zip(&self.local_size) {
            *dst = *src;
        }
        lws
    }

    /// `[u8 count][u32 dims...][u64 nanos]`, little-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.local_size.len() * 4 + 8);
        out.push(self.local_size.len() as u8);
        for v in &self.local_size {
            out.extend_from_slice(&v.to_le_bytes());
        }
        let nanos = u64::try_from(self.cost.as_nanos()).unwrap_or(u64::MAX);
        out.extend_from_slice(&nanos.to_le_bytes());
        out
    }

    /// Parses bytes produced by [`TuningRecord::encode`].
    ///
    /// # Errors
    /// Fails on truncated data, a dimension count other than 3 or 4, or a zero dimension.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (&count, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Validation("empty tuning record".to_string()))?;
        let count = count as usize;
        if rest.len() != count * 4 + 8 {
            return Err(Error::Validation(format!(
                "tuning record length {} does not match {count} dimensions",
                bytes.len()
            )));
        }
        let (dims, nanos) = rest.split_at(count * 4);
        let local_size = dims
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let mut buf8 = [0u8; 8];
        buf8.copy_from_slice(nanos);
        let record = Self {
            local_size,
            cost: Duration::from_nanos(u64::from_le_bytes(buf8)),
        };
        Ok(TrustedData::new(record)?.into_inner())
    }
}

impl Validate for TuningRecord {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        if !(3..=4).contains(&self.local_size.len()) {
            return Err(ValidationError);
        }
        if self.local_size.iter().any(|&v| v == 0) {
            return Err(ValidationError);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_what_it_encodes() {
        let rec = TuningRecord::new(vec![8, 4, 2, 1], Duration::from_micros(125));
        let bytes = rec.encode();
        assert_eq!(bytes.len(), 1 + 16 + 8);
        assert_eq!(TuningRecord::decode(&bytes).unwrap(), rec);
        assert_eq!(rec.launch_size(), [8, 4, 2]);
    }

    #[test]
    fn rejects_bad_dimension_counts() {
        let rec = TuningRecord::new(vec![8, 4], Duration::ZERO);
        assert!(matches!(TuningRecord::decode(&rec.encode()), Err(Error::Validation(_))));
        let rec = TuningRecord::new(vec![8, 0, 1], Duration::ZERO);
        assert!(matches!(TuningRecord::decode(&rec.encode()), Err(Error::Validation(_))));
    }

    #[test]
    fn rejects_truncated_bytes() {
        let bytes = TuningRecord::new(vec![1, 1, 1], Duration::ZERO).encode();
        assert!(TuningRecord::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(TuningRecord::decode(&[]).is_err());
    }
}
