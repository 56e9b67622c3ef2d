//! Wire blobs exchanged between agents.
//!
//! Every cross-agent blob (connection info, packed memory keys) is a
//! sequence of `(tag, length, bytes)` triples: a `u16` little-endian tag
//! length, the UTF-8 tag, a `u32` little-endian value length, the value.
//! Readers consume tags in order and refuse a blob whose next tag is not
//! the expected one, so a peer built against a different layout fails with
//! `Mismatch` instead of misinterpreting bytes.

use crate::error::{FabrixError, Result};

/// Blob writer.
#[derive(Debug, Default)]
pub struct BlobWriter {
    buf: Vec<u8>,
}

impl BlobWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one tagged value.
    pub fn add(&mut self, tag: &str, value: &[u8]) -> &mut Self {
        debug_assert!(tag.len() <= u16::MAX as usize);
        self.buf
            .extend_from_slice(&(tag.len() as u16).to_le_bytes());
        self.buf.extend_from_slice(tag.as_bytes());
        self.buf
            .extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(value);
        self
    }

    pub fn add_u64(&mut self, tag: &str, value: u64) -> &mut Self {
        self.add(tag, &value.to_le_bytes())
    }

    pub fn add_u32(&mut self, tag: &str, value: u32) -> &mut Self {
        self.add(tag, &value.to_le_bytes())
    }

    pub fn add_str(&mut self, tag: &str, value: &str) -> &mut Self {
        self.add(tag, value.as_bytes())
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Blob reader. Tags must be consumed in the order they were written.
pub struct BlobReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BlobReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Whether the whole blob has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                FabrixError::mismatch(format!("truncated blob while reading {what}"))
            })?;
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Read the next entry, requiring its tag to be `tag`.
    pub fn expect(&mut self, tag: &str) -> Result<&'a [u8]> {
        let tag_len = u16::from_le_bytes(self.take(2, "tag length")?.try_into().unwrap()) as usize;
        let found = self.take(tag_len, "tag")?;
        if found != tag.as_bytes() {
            return Err(FabrixError::mismatch(format!(
                "expected tag '{tag}', found '{}'",
                String::from_utf8_lossy(found)
            )));
        }
        let val_len = u32::from_le_bytes(self.take(4, "value length")?.try_into().unwrap()) as usize;
        self.take(val_len, tag)
    }

    pub fn expect_u64(&mut self, tag: &str) -> Result<u64> {
        let v = self.expect(tag)?;
        let arr: [u8; 8] = v
            .try_into()
            .map_err(|_| FabrixError::mismatch(format!("tag '{tag}': expected 8 bytes, got {}", v.len())))?;
        Ok(u64::from_le_bytes(arr))
    }

    pub fn expect_u32(&mut self, tag: &str) -> Result<u32> {
        let v = self.expect(tag)?;
        let arr: [u8; 4] = v
            .try_into()
            .map_err(|_| FabrixError::mismatch(format!("tag '{tag}': expected 4 bytes, got {}", v.len())))?;
        Ok(u32::from_le_bytes(arr))
    }

    pub fn expect_str(&mut self, tag: &str) -> Result<&'a str> {
        std::str::from_utf8(self.expect(tag)?)
            .map_err(|_| FabrixError::mismatch(format!("tag '{tag}': invalid UTF-8")))
    }
}

/// Serialize a list of opaque byte strings under `{prefix}_n` / `{prefix}{i}`.
pub fn write_blob_list(w: &mut BlobWriter, prefix: &str, items: &[Vec<u8>]) {
    w.add_u32(&format!("{prefix}_n"), items.len() as u32);
    for (i, item) in items.iter().enumerate() {
        w.add(&format!("{prefix}{i}"), item);
    }
}

/// Deserialize a list written by [`write_blob_list`], requiring exactly
/// `expected` entries when `expected` is `Some`.
pub fn read_blob_list(
    r: &mut BlobReader<'_>,
    prefix: &str,
    expected: Option<usize>,
) -> Result<Vec<Vec<u8>>> {
    let n = r.expect_u32(&format!("{prefix}_n"))? as usize;
    if let Some(want) = expected {
        if n != want {
            return Err(FabrixError::mismatch(format!(
                "{prefix} list has {n} entries, expected {want}"
            )));
        }
    }
    let mut items = Vec::with_capacity(n);
    for i in 0..n {
        items.push(r.expect(&format!("{prefix}{i}"))?.to_vec());
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_mixed() {
        let mut w = BlobWriter::new();
        w.add_u64("addr", 0xdead_beef_0000_1234)
            .add_u32("mask", 0b1010)
            .add_str("agent", "Agent1")
            .add("key", &[1, 2, 3]);
        let blob = w.finish();

        let mut r = BlobReader::new(&blob);
        assert_eq!(r.expect_u64("addr").unwrap(), 0xdead_beef_0000_1234);
        assert_eq!(r.expect_u32("mask").unwrap(), 0b1010);
        assert_eq!(r.expect_str("agent").unwrap(), "Agent1");
        assert_eq!(r.expect("key").unwrap(), &[1, 2, 3]);
        assert!(r.is_empty());
    }

    #[test]
    fn test_wrong_tag_is_mismatch() {
        let mut w = BlobWriter::new();
        w.add_u64("src_addr", 7);
        let blob = w.finish();

        let mut r = BlobReader::new(&blob);
        let err = r.expect_u64("dest_addr").unwrap_err();
        assert!(matches!(err, FabrixError::Mismatch(_)), "{err}");
    }

    #[test]
    fn test_truncated_blob_is_mismatch() {
        let mut w = BlobWriter::new();
        w.add("k", &[0u8; 16]);
        let mut blob = w.finish();
        blob.truncate(blob.len() - 4);

        let mut r = BlobReader::new(&blob);
        assert!(matches!(
            r.expect("k").unwrap_err(),
            FabrixError::Mismatch(_)
        ));
    }

    #[test]
    fn test_width_disagreement_is_mismatch() {
        let mut w = BlobWriter::new();
        w.add_u32("addr", 1);
        let blob = w.finish();

        let mut r = BlobReader::new(&blob);
        assert!(matches!(
            r.expect_u64("addr").unwrap_err(),
            FabrixError::Mismatch(_)
        ));
    }

    #[test]
    fn test_blob_list_roundtrip() {
        let items = vec![b"aa".to_vec(), b"bbb".to_vec(), Vec::new()];
        let mut w = BlobWriter::new();
        write_blob_list(&mut w, "ep", &items);
        let blob = w.finish();

        let mut r = BlobReader::new(&blob);
        let got = read_blob_list(&mut r, "ep", Some(3)).unwrap();
        assert_eq!(got, items);
    }

    #[test]
    fn test_blob_list_count_mismatch() {
        let mut w = BlobWriter::new();
        write_blob_list(&mut w, "ep", &[b"x".to_vec()]);
        let blob = w.finish();

        let mut r = BlobReader::new(&blob);
        assert!(read_blob_list(&mut r, "ep", Some(2)).is_err());
    }
}
