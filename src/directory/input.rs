use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use memmap2::Mmap;

use crate::error::{SearchError, SearchResult};

/// Backing bytes of an open file. Cloning an input only bumps the refcount;
/// the same mapping serves every cursor over the file.
#[derive(Clone)]
pub(crate) enum InputSource {
    Mapped(Arc<Mmap>),
    Ram(Arc<Vec<u8>>),
}

impl InputSource {
    fn as_slice(&self) -> &[u8] {
        match self {
            InputSource::Mapped(map) => &map[..],
            InputSource::Ram(buf) => buf.as_slice(),
        }
    }
}

/// Random-access cursor over an immutable file, restricted to the
/// `[start, end)` window so compound-file slices reuse the same type.
#[derive(Clone)]
pub struct IndexInput {
    name: String,
    source: InputSource,
    start: usize,
    end: usize,
    pos: usize,
}

impl IndexInput {
    pub(crate) fn new(name: &str, source: InputSource) -> Self {
        let len = source.as_slice().len();
        Self {
            name: name.to_string(),
            source,
            start: 0,
            end: len,
            pos: 0,
        }
    }

    /// Wraps an owned buffer, for decoding staged bytes.
    pub fn from_bytes(name: &str, bytes: Vec<u8>) -> Self {
        Self::new(name, InputSource::Ram(Arc::new(bytes)))
    }

    /// An independent cursor over a sub-range of this file.
    pub fn slice(&self, name: &str, offset: u64, length: u64) -> SearchResult<IndexInput> {
        let start = self.start + offset as usize;
        let end = start + length as usize;
        if end > self.end {
            return Err(SearchError::corrupt(format!(
                "slice [{offset}, +{length}) outside of {} (len {})",
                self.name,
                self.len()
            )));
        }
        Ok(IndexInput {
            name: name.to_string(),
            source: self.source.clone(),
            start,
            end,
            pos: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        (self.end - self.start) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn seek(&mut self, pos: u64) -> SearchResult<()> {
        if pos > self.len() {
            return Err(SearchError::corrupt(format!(
                "seek to {pos} outside of {} (len {})",
                self.name,
                self.len()
            )));
        }
        self.pos = pos as usize;
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.end - self.start - self.pos
    }

    fn take(&mut self, n: usize) -> SearchResult<&[u8]> {
        if self.remaining() < n {
            return Err(SearchError::corrupt(format!(
                "read past end of {} (pos {}, len {}, want {n})",
                self.name,
                self.pos,
                self.len()
            )));
        }
        let abs = self.start + self.pos;
        self.pos += n;
        Ok(&self.source.as_slice()[abs..abs + n])
    }

    pub fn read_byte(&mut self) -> SearchResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bytes(&mut self, buf: &mut [u8]) -> SearchResult<()> {
        let src = self.take(buf.len())?;
        buf.copy_from_slice(src);
        Ok(())
    }

    pub fn read_vec(&mut self, n: usize) -> SearchResult<Vec<u8>> {
        Ok(self.take(n)?.to_vec())
    }

    pub fn read_u16(&mut self) -> SearchResult<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> SearchResult<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> SearchResult<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> SearchResult<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> SearchResult<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// 7-bit variable-length u32, low groups first, high bit marks
    /// continuation.
    pub fn read_vint(&mut self) -> SearchResult<u32> {
        let mut b = self.read_byte()?;
        let mut value = (b & 0x7f) as u32;
        let mut shift = 7;
        while b & 0x80 != 0 {
            if shift > 28 {
                return Err(SearchError::corrupt(format!(
                    "vint too long in {}",
                    self.name
                )));
            }
            b = self.read_byte()?;
            value |= ((b & 0x7f) as u32) << shift;
            shift += 7;
        }
        Ok(value)
    }

    pub fn read_vlong(&mut self) -> SearchResult<u64> {
        let mut b = self.read_byte()?;
        let mut value = (b & 0x7f) as u64;
        let mut shift = 7;
        while b & 0x80 != 0 {
            if shift > 63 {
                return Err(SearchError::corrupt(format!(
                    "vlong too long in {}",
                    self.name
                )));
            }
            b = self.read_byte()?;
            value |= ((b & 0x7f) as u64) << shift;
            shift += 7;
        }
        Ok(value)
    }

    /// Length-prefixed UTF-8. The length counts bytes.
    pub fn read_string(&mut self) -> SearchResult<String> {
        let len = self.read_vint()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SearchError::corrupt(format!("invalid utf-8 string in {}", self.name)))
    }

    /// Length-prefixed string in the legacy modified-UTF-8 encoding (the
    /// length counts CHARS, NUL is the two-byte 0xC0 0x80 form, and
    /// supplementary characters arrive as two three-byte surrogates).
    /// Only readers of segments written by old tooling need this; every
    /// current format writes standard UTF-8.
    pub fn read_modified_utf8_string(&mut self) -> SearchResult<String> {
        let char_count = self.read_vint()? as usize;
        let mut out = String::with_capacity(char_count);
        let mut pending_high: Option<u16> = None;
        let mut chars = 0;
        while chars < char_count {
            let a = self.read_byte()?;
            let unit: u16 = match a {
                0x00..=0x7f => a as u16,
                0xc0..=0xdf => {
                    let b = self.read_byte()?;
                    (((a & 0x1f) as u16) << 6) | (b & 0x3f) as u16
                }
                0xe0..=0xef => {
                    let b = self.read_byte()?;
                    let c = self.read_byte()?;
                    (((a & 0x0f) as u16) << 12) | (((b & 0x3f) as u16) << 6) | (c & 0x3f) as u16
                }
                _ => {
                    return Err(SearchError::corrupt(format!(
                        "invalid modified utf-8 lead byte {a:#x} in {}",
                        self.name
                    )))
                }
            };
            chars += 1;
            match pending_high.take() {
                Some(high) => {
                    if (0xdc00..=0xdfff).contains(&unit) {
                        let code =
                            0x10000 + (((high - 0xd800) as u32) << 10) + (unit - 0xdc00) as u32;
                        out.push(char::from_u32(code).ok_or_else(|| {
                            SearchError::corrupt(format!(
                                "invalid surrogate pair in {}",
                                self.name
                            ))
                        })?);
                    } else {
                        return Err(SearchError::corrupt(format!(
                            "unpaired surrogate in {}",
                            self.name
                        )));
                    }
                }
                None => {
                    if (0xd800..=0xdbff).contains(&unit) {
                        pending_high = Some(unit);
                    } else if (0xdc00..=0xdfff).contains(&unit) {
                        return Err(SearchError::corrupt(format!(
                            "unpaired surrogate in {}",
                            self.name
                        )));
                    } else {
                        out.push(char::from_u32(unit as u32).unwrap_or('\u{fffd}'));
                    }
                }
            }
        }
        if pending_high.is_some() {
            return Err(SearchError::corrupt(format!(
                "truncated surrogate pair in {}",
                self.name
            )));
        }
        Ok(out)
    }

    pub fn read_string_map(&mut self) -> SearchResult<Vec<(String, String)>> {
        let count = self.read_vint()? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let key = self.read_string()?;
            let value = self.read_string()?;
            entries.push((key, value));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram_input(bytes: Vec<u8>) -> IndexInput {
        IndexInput::new("t", InputSource::Ram(Arc::new(bytes)))
    }

    #[test]
    fn vint_round_trip() {
        let mut out = Vec::new();
        for value in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            let mut v = value;
            loop {
                if v & !0x7f == 0 {
                    out.push(v as u8);
                    break;
                }
                out.push((v as u8 & 0x7f) | 0x80);
                v >>= 7;
            }
        }
        let mut input = ram_input(out);
        for value in [0u32, 1, 127, 128, 16383, 16384, u32::MAX] {
            assert_eq!(input.read_vint().unwrap(), value);
        }
    }

    #[test]
    fn read_past_end_is_corrupt() {
        let mut input = ram_input(vec![1, 2, 3]);
        input.seek(2).unwrap();
        assert!(matches!(
            input.read_u32(),
            Err(SearchError::CorruptIndex(_))
        ));
    }

    #[test]
    fn modified_utf8_legacy_strings() {
        // "a<NUL>b" plus a supplementary char as a 6-byte surrogate pair
        let mut bytes = vec![5]; // five utf-16 units
        bytes.extend_from_slice(&[b'a', 0xc0, 0x80, b'b']);
        bytes.extend_from_slice(&[0xed, 0xa0, 0xbd, 0xed, 0xb8, 0x80]); // U+1F600
        let mut input = ram_input(bytes);
        assert_eq!(
            input.read_modified_utf8_string().unwrap(),
            "a\u{0}b\u{1F600}"
        );

        let mut truncated = ram_input(vec![1, 0xed, 0xa0, 0xbd]);
        assert!(matches!(
            truncated.read_modified_utf8_string(),
            Err(SearchError::CorruptIndex(_))
        ));
    }

    #[test]
    fn slice_is_windowed() {
        let mut input = ram_input(vec![0, 1, 2, 3, 4, 5]);
        let mut sliced = input.slice("s", 2, 3).unwrap();
        assert_eq!(sliced.len(), 3);
        assert_eq!(sliced.read_byte().unwrap(), 2);
        assert!(input.slice("s", 4, 3).is_err());
        assert_eq!(input.read_byte().unwrap(), 0);
    }
}
