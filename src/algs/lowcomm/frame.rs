//! Buffer framing for typed messages.
//!
//! All header fields are one native machine word (homogeneous-endianness
//! cluster assumed):
//!
//! ```text
//! word 0           : MAGIC
//! word 1           : component count n
//! words 2 .. 2+3n  : n triples (offset, byte size, entry count)
//! then             : component payloads back to back at the given offsets
//! ```

use std::mem::size_of;

pub const WORD: usize = size_of::<usize>();
pub const MAGIC: usize = 0x1234_D0D0;

/// Location and shape of one component inside a buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkDesc {
    pub offset: usize,
    pub size: usize,
    pub entries: usize,
}

pub const fn header_size(n_components: usize) -> usize {
    2 * WORD + n_components * 3 * WORD
}

/// Assign offsets by running sum after the header; returns the buffer size,
/// or `None` if it does not fit in a `usize`.
pub fn layout(chunks: &mut [ChunkDesc]) -> Option<usize> {
    let mut offset = header_size(chunks.len());
    for c in chunks.iter_mut() {
        c.offset = offset;
        offset = offset.checked_add(c.size)?;
    }
    Some(offset)
}

fn put_word(buf: &mut [u8], word: usize, v: usize) {
    buf[word * WORD..(word + 1) * WORD].copy_from_slice(&v.to_ne_bytes());
}

fn get_word(buf: &[u8], word: usize) -> usize {
    let mut raw = [0u8; WORD];
    raw.copy_from_slice(&buf[word * WORD..(word + 1) * WORD]);
    usize::from_ne_bytes(raw)
}

/// Write the complete header. `buf` must be at least `header_size` long.
pub fn write_header(buf: &mut [u8], chunks: &[ChunkDesc]) {
    put_word(buf, 0, MAGIC);
    put_word(buf, 1, chunks.len());
    for (i, c) in chunks.iter().enumerate() {
        put_word(buf, 2 + 3 * i, c.offset);
        put_word(buf, 3 + 3 * i, c.size);
        put_word(buf, 4 + 3 * i, c.entries);
    }
}

/// Rewrite only the entry count of component `i`.
pub fn write_entries(buf: &mut [u8], i: usize, entries: usize) {
    put_word(buf, 4 + 3 * i, entries);
}

/// Raw header as found on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub magic: usize,
    pub chunks: Vec<ChunkDesc>,
}

/// Parse a header and check that every component lies inside `buf`.
pub fn read_header(buf: &[u8]) -> Result<Header, String> {
    if buf.len() < header_size(0) {
        return Err(format!("{} bytes cannot hold a message header", buf.len()));
    }
    let magic = get_word(buf, 0);
    let n = get_word(buf, 1);
    let needed = n
        .checked_mul(3 * WORD)
        .and_then(|v| v.checked_add(2 * WORD))
        .filter(|&v| v <= buf.len())
        .ok_or_else(|| format!("header for {n} components exceeds {} bytes", buf.len()))?;
    let chunks: Vec<ChunkDesc> = (0..n)
        .map(|i| ChunkDesc {
            offset: get_word(buf, 2 + 3 * i),
            size: get_word(buf, 3 + 3 * i),
            entries: get_word(buf, 4 + 3 * i),
        })
        .collect();
    for (i, c) in chunks.iter().enumerate() {
        let end = c.offset.checked_add(c.size);
        if c.offset < needed || end.is_none_or(|e| e > buf.len()) {
            return Err(format!(
                "component {i} at {}+{} outside buffer of {} bytes",
                c.offset,
                c.size,
                buf.len()
            ));
        }
    }
    Ok(Header { magic, chunks })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_formula() {
        let mut chunks = [
            ChunkDesc {
                size: 3 * 16,
                entries: 3,
                ..Default::default()
            },
            ChunkDesc {
                size: 5,
                ..Default::default()
            },
        ];
        let total = layout(&mut chunks).unwrap();
        assert_eq!(total, 2 * WORD + 3 * WORD * 2 + 48 + 5);
        assert_eq!(chunks[0].offset, header_size(2));
        assert_eq!(chunks[1].offset, header_size(2) + 48);
    }

    #[test]
    fn header_roundtrip_and_entry_rewrite() {
        let mut chunks = [ChunkDesc {
            size: 32,
            entries: 4,
            ..Default::default()
        }];
        let total = layout(&mut chunks).unwrap();
        let mut buf = vec![0u8; total];
        write_header(&mut buf, &chunks);
        write_entries(&mut buf, 0, 2);
        let hdr = read_header(&buf).unwrap();
        assert_eq!(hdr.magic, MAGIC);
        assert_eq!(hdr.chunks.len(), 1);
        assert_eq!(hdr.chunks[0].entries, 2);
        assert_eq!(hdr.chunks[0].size, 32);
    }

    #[test]
    fn oversized_layout_is_rejected() {
        let mut chunks = [
            ChunkDesc {
                size: usize::MAX - 8,
                ..Default::default()
            },
            ChunkDesc {
                size: 16,
                ..Default::default()
            },
        ];
        assert_eq!(layout(&mut chunks), None);
    }

    #[test]
    fn truncated_buffer_is_rejected() {
        let mut chunks = [ChunkDesc {
            size: 8,
            ..Default::default()
        }];
        let total = layout(&mut chunks).unwrap();
        let mut buf = vec![0u8; total];
        write_header(&mut buf, &chunks);
        assert!(read_header(&buf[..total - 1]).is_err());
        assert!(read_header(&buf[..WORD]).is_err());
    }
}
