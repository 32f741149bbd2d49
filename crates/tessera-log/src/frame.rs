use crc32fast::Hasher;

use crate::error::LogError;

pub(crate) const HEADER_LEN: usize = 8;

pub(crate) fn checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

pub(crate) fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&checksum(payload).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Result of scanning a log image.
pub(crate) struct Scan<'a> {
    pub payloads: Vec<&'a [u8]>,
    /// Length of the prefix made of complete, valid frames.
    pub valid_len: usize,
}

impl Scan<'_> {
    pub fn is_torn(&self, total_len: usize) -> bool {
        self.valid_len < total_len
    }
}

/// Split `bytes` into frames. An incomplete or mismatching final frame is a
/// torn write and ends the scan; a mismatch followed by more data is
/// corruption.
pub(crate) fn scan_frames(bytes: &[u8]) -> Result<Scan<'_>, LogError> {
    let mut payloads = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < HEADER_LEN {
            break;
        }
        let len = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
        let crc = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]);
        let end = HEADER_LEN + len;
        if rest.len() < end {
            break;
        }
        let payload = &rest[HEADER_LEN..end];
        if checksum(payload) != crc {
            if offset + end == bytes.len() {
                break;
            }
            return Err(LogError::Corrupt {
                offset: offset as u64,
            });
        }
        payloads.push(payload);
        offset += end;
    }
    Ok(Scan {
        payloads,
        valid_len: offset,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_reads_back_frames() {
        let mut image = encode_frame(b"one");
        image.extend(encode_frame(b"two"));
        let scan = scan_frames(&image).unwrap();
        assert_eq!(scan.payloads, vec![&b"one"[..], &b"two"[..]]);
        assert!(!scan.is_torn(image.len()));
    }

    #[test]
    fn short_tail_is_torn() {
        let mut image = encode_frame(b"one");
        let good = image.len();
        image.extend(&encode_frame(b"two")[..5]);
        let scan = scan_frames(&image).unwrap();
        assert_eq!(scan.payloads.len(), 1);
        assert_eq!(scan.valid_len, good);
        assert!(scan.is_torn(image.len()));
    }

    #[test]
    fn bad_checksum_in_last_frame_is_torn() {
        let mut image = encode_frame(b"one");
        let mut last = encode_frame(b"two");
        let n = last.len();
        last[n - 1] ^= 0xFF;
        image.extend(last);
        let scan = scan_frames(&image).unwrap();
        assert_eq!(scan.payloads.len(), 1);
    }

    #[test]
    fn bad_checksum_mid_log_is_corruption() {
        let mut first = encode_frame(b"one");
        first[HEADER_LEN] ^= 0xFF;
        let mut image = first;
        image.extend(encode_frame(b"two"));
        assert!(matches!(
            scan_frames(&image),
            Err(LogError::Corrupt { offset: 0 })
        ));
    }
}
