//! In-memory decoded page: a parallel sequence of timestamps and fixed-size
//! values, plus the stable little-endian wire encoding used to persist it.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// `(value_size: u64, n: u64, n * u64 timestamps, n * value_size bytes values)`.
const HEADER_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageBuffer {
    value_size: u64,
    timestamps: Vec<u64>,
    /// Contiguous: `values[pos * value_size .. (pos + 1) * value_size]`.
    values: Vec<u8>,
}

impl PageBuffer {
    pub fn new(value_size: u64) -> Self {
        Self {
            value_size,
            timestamps: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn value_size(&self) -> u64 {
        self.value_size
    }

    pub fn size(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.timestamps.last().copied()
    }

    fn check_value_len(&self, value: &[u8]) -> Result<()> {
        if value.len() as u64 != self.value_size {
            return Err(Error::InvalidArgument(format!(
                "value has length {} but page value_size is {}",
                value.len(),
                self.value_size
            )));
        }
        Ok(())
    }

    fn check_pos(&self, pos: usize) -> Result<()> {
        if pos >= self.timestamps.len() {
            return Err(Error::InvalidArgument(format!(
                "position {} out of bounds for page of size {}",
                pos,
                self.timestamps.len()
            )));
        }
        Ok(())
    }

    /// Push a sample to the end. `ts` must be `>= last_timestamp()`; violating
    /// monotonic append order is a programmer error.
    pub fn append(&mut self, ts: u64, value: &[u8]) -> Result<()> {
        self.check_value_len(value)?;

        if let Some(last) = self.last_timestamp() {
            debug_assert!(
                ts >= last,
                "append timestamp {} precedes last timestamp {}",
                ts,
                last
            );
            if ts < last {
                return Err(Error::InvalidArgument(format!(
                    "append timestamp {} precedes last timestamp {}",
                    ts, last
                )));
            }
        }

        self.timestamps.push(ts);
        self.values.extend_from_slice(value);
        Ok(())
    }

    /// Insert a sample at `pos`. The caller (the cursor) is responsible for
    /// having located `pos` via a seek so that sort order is preserved.
    pub fn insert(&mut self, pos: usize, ts: u64, value: &[u8]) -> Result<()> {
        self.check_value_len(value)?;
        if pos > self.timestamps.len() {
            return Err(Error::InvalidArgument(format!(
                "insert position {} out of bounds for page of size {}",
                pos,
                self.timestamps.len()
            )));
        }

        self.timestamps.insert(pos, ts);
        let byte_pos = pos * self.value_size as usize;
        self.values.splice(byte_pos..byte_pos, value.iter().copied());
        Ok(())
    }

    /// Replace the value at `pos`; the timestamp is left unchanged.
    pub fn update(&mut self, pos: usize, value: &[u8]) -> Result<()> {
        self.check_value_len(value)?;
        self.check_pos(pos)?;

        let byte_pos = pos * self.value_size as usize;
        self.values[byte_pos..byte_pos + value.len()].copy_from_slice(value);
        Ok(())
    }

    pub fn get_timestamp(&self, pos: usize) -> Result<u64> {
        self.check_pos(pos)?;
        Ok(self.timestamps[pos])
    }

    pub fn get_value(&self, pos: usize, out: &mut [u8]) -> Result<()> {
        self.check_pos(pos)?;
        self.check_value_len(out)?;

        let byte_pos = pos * self.value_size as usize;
        out.copy_from_slice(&self.values[byte_pos..byte_pos + out.len()]);
        Ok(())
    }

    pub fn value_at(&self, pos: usize) -> Result<&[u8]> {
        self.check_pos(pos)?;
        let byte_pos = pos * self.value_size as usize;
        Ok(&self.values[byte_pos..byte_pos + self.value_size as usize])
    }

    /// First `i` with `timestamps[i] >= ts`, or `None` if every timestamp
    /// in this page is smaller than `ts` (or the page is empty). Ties pick
    /// the first equal timestamp.
    pub fn ceil_index(&self, ts: u64) -> Option<usize> {
        let pos = self.timestamps.partition_point(|&t| t < ts);
        if pos < self.timestamps.len() {
            Some(pos)
        } else {
            None
        }
    }

    /// Exact encoded byte length, without re-encoding.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.timestamps.len() * (8 + self.value_size as usize)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u64_le(self.value_size);
        buf.put_u64_le(self.timestamps.len() as u64);
        for ts in &self.timestamps {
            buf.put_u64_le(*ts);
        }
        buf.put_slice(&self.values);
        buf.freeze()
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::CorruptData(
                "page buffer shorter than header".to_string(),
            ));
        }

        let value_size = bytes.get_u64_le();
        let n = bytes.get_u64_le();

        let expected_len = HEADER_LEN
            + (n as usize)
                .checked_mul(8 + value_size as usize)
                .ok_or_else(|| Error::CorruptData("page buffer length overflow".to_string()))?;

        if bytes.len() + HEADER_LEN != expected_len {
            return Err(Error::CorruptData(format!(
                "page buffer length mismatch: got {}, expected {}",
                bytes.len() + HEADER_LEN,
                expected_len
            )));
        }

        let mut timestamps = Vec::with_capacity(n as usize);
        for _ in 0..n {
            timestamps.push(bytes.get_u64_le());
        }

        let values = bytes.to_vec();

        Ok(Self {
            value_size,
            timestamps,
            values,
        })
    }

    /// Split this buffer at its median position, returning the new (right
    /// half) buffer. `self` retains the left half and its first timestamp is
    /// unchanged; the caller installs the returned buffer under a fresh page
    /// id and extends the page index with its first timestamp.
    pub fn split_at_median(&mut self) -> PageBuffer {
        let mid = self.timestamps.len() / 2;

        let right_timestamps = self.timestamps.split_off(mid);
        let byte_mid = mid * self.value_size as usize;
        let right_values = self.values.split_off(byte_mid);

        PageBuffer {
            value_size: self.value_size,
            timestamps: right_timestamps,
            values: right_values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_read_back() {
        let mut page = PageBuffer::new(4);
        page.append(10, &[1, 2, 3, 4]).unwrap();
        page.append(20, &[5, 6, 7, 8]).unwrap();

        assert_eq!(page.size(), 2);
        assert_eq!(page.get_timestamp(0).unwrap(), 10);
        assert_eq!(page.get_timestamp(1).unwrap(), 20);

        let mut out = [0u8; 4];
        page.get_value(1, &mut out).unwrap();
        assert_eq!(out, [5, 6, 7, 8]);
    }

    #[test]
    fn append_rejects_non_monotonic() {
        let mut page = PageBuffer::new(1);
        page.append(10, &[1]).unwrap();
        assert!(page.append(5, &[2]).is_err());
    }

    #[test]
    fn insert_shifts_subsequent_samples() {
        let mut page = PageBuffer::new(1);
        page.append(10, &[1]).unwrap();
        page.append(30, &[3]).unwrap();
        page.insert(1, 20, &[2]).unwrap();

        assert_eq!(page.size(), 3);
        assert_eq!(page.get_timestamp(0).unwrap(), 10);
        assert_eq!(page.get_timestamp(1).unwrap(), 20);
        assert_eq!(page.get_timestamp(2).unwrap(), 30);
        assert_eq!(page.value_at(1).unwrap(), &[2]);
    }

    #[test]
    fn update_leaves_timestamp_unchanged() {
        let mut page = PageBuffer::new(1);
        page.append(10, &[1]).unwrap();
        page.update(0, &[99]).unwrap();

        assert_eq!(page.get_timestamp(0).unwrap(), 10);
        assert_eq!(page.value_at(0).unwrap(), &[99]);
    }

    #[test]
    fn encode_decode_round_trips() {
        let mut page = PageBuffer::new(8);
        for i in 0..100u64 {
            page.append(i * 10, &i.to_le_bytes()).unwrap();
        }

        let encoded = page.encode();
        assert_eq!(encoded.len(), page.encoded_len());

        let decoded = PageBuffer::decode(&encoded).unwrap();
        assert_eq!(decoded, page);
    }

    #[test]
    fn decode_rejects_truncated_input() {
        let mut page = PageBuffer::new(8);
        page.append(0, &0u64.to_le_bytes()).unwrap();
        let mut encoded = page.encode().to_vec();
        encoded.pop();

        assert!(PageBuffer::decode(&encoded).is_err());
    }

    #[test]
    fn split_at_median_preserves_order() {
        let mut page = PageBuffer::new(1);
        for i in 0..10u8 {
            page.append(i as u64, &[i]).unwrap();
        }

        let right = page.split_at_median();
        assert_eq!(page.size(), 5);
        assert_eq!(right.size(), 5);
        assert_eq!(page.get_timestamp(4).unwrap(), 4);
        assert_eq!(right.get_timestamp(0).unwrap(), 5);
    }
}
