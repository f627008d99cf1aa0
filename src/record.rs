use std::io::{self, Read};

use bytes::{Buf, BufMut};
use crc32fast::Hasher;

/// Length of the fixed frame header: payload length and payload checksum,
/// both big-endian `u32`.
pub(crate) const FRAME_HEADER_LEN: u64 = 8;

// Upper bound on the payload capacity allocated before any payload byte has
// been read.  A torn header can declare an absurd length; the actual bytes on
// disk bound the allocation from there.
const EAGER_PAYLOAD_CAPACITY: usize = 64 * 1024;

/// Result of checking a frame payload against its stored checksum.
pub(crate) enum RecordStatus {
    /// The payload matches the checksum that was stored with it.
    Valid,
    /// The payload does not match the stored checksum.
    Corrupted { calculated: u32, actual: u32 },
}

/// Result of reading one frame from a log file.
pub(crate) enum FrameRead {
    /// A complete frame: the payload bytes and the checksum stored alongside
    /// them.  The checksum has not been verified yet.
    Frame {
        payload: Vec<u8>,
        stored_checksum: u32,
    },
    /// The reader is positioned exactly at the end of the file.
    Eof,
    /// The file ends partway through a frame.
    ///
    /// At the tail of a head file this is a torn write from a crash and is
    /// truncated away at open time; anywhere else it indicates corruption.
    Partial,
}

enum ReadOutcome {
    Full,
    Empty,
    Short,
}

pub(crate) fn payload_checksum(payload: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    hasher.finalize()
}

/// Verifies a frame payload against the checksum stored in its header.
pub(crate) fn verify_payload(payload: &[u8], stored: u32) -> RecordStatus {
    let calculated = payload_checksum(payload);
    if calculated == stored {
        RecordStatus::Valid
    } else {
        RecordStatus::Corrupted {
            calculated,
            actual: stored,
        }
    }
}

/// Frames a record payload: `payload_len: u32 | crc32(payload): u32 | payload`.
///
/// Both header fields are big-endian.  Records never span files, so one frame
/// is always contiguous within a single log file.
pub(crate) fn write_frame<B: BufMut>(payload: &[u8], buffer: &mut B) {
    buffer.put_u32(payload.len() as u32);
    buffer.put_u32(payload_checksum(payload));
    buffer.put_slice(payload);
}

/// Reads one frame from `reader`.
///
/// Distinguishes a clean end of file from a frame that stops short of its
/// declared length, so that callers can tell "no more records" apart from a
/// torn or corrupted tail.
pub(crate) fn read_frame<R: Read>(reader: &mut R) -> io::Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN as usize];
    match read_full(reader, &mut header)? {
        ReadOutcome::Empty => return Ok(FrameRead::Eof),
        ReadOutcome::Short => return Ok(FrameRead::Partial),
        ReadOutcome::Full => {}
    }

    let mut header = &header[..];
    let payload_len = header.get_u32() as usize;
    let stored_checksum = header.get_u32();

    let mut payload = Vec::with_capacity(payload_len.min(EAGER_PAYLOAD_CAPACITY));
    let read = reader
        .by_ref()
        .take(payload_len as u64)
        .read_to_end(&mut payload)?;
    if read < payload_len {
        return Ok(FrameRead::Partial);
    }
    Ok(FrameRead::Frame {
        payload,
        stored_checksum,
    })
}

fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<ReadOutcome> {
    if buf.is_empty() {
        return Ok(ReadOutcome::Full);
    }

    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(if filled == 0 {
        ReadOutcome::Empty
    } else if filled == buf.len() {
        ReadOutcome::Full
    } else {
        ReadOutcome::Short
    })
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use bytes::BytesMut;

    use super::*;

    #[test]
    fn frame_round_trips() {
        let mut buf = BytesMut::new();
        write_frame(b"some payload", &mut buf);

        let mut reader = Cursor::new(buf.to_vec());
        match read_frame(&mut reader).expect("read should not fail") {
            FrameRead::Frame {
                payload,
                stored_checksum,
            } => {
                assert_eq!(payload, b"some payload");
                assert!(matches!(
                    verify_payload(&payload, stored_checksum),
                    RecordStatus::Valid
                ));
            }
            _ => panic!("expected a complete frame"),
        }

        assert!(matches!(
            read_frame(&mut reader).expect("read should not fail"),
            FrameRead::Eof
        ));
    }

    #[test]
    fn checksum_detects_flipped_bit() {
        let mut buf = BytesMut::new();
        write_frame(b"some payload", &mut buf);

        let mut bytes = buf.to_vec();
        bytes[FRAME_HEADER_LEN as usize] ^= 0x01;

        let mut reader = Cursor::new(bytes);
        match read_frame(&mut reader).expect("read should not fail") {
            FrameRead::Frame {
                payload,
                stored_checksum,
            } => assert!(matches!(
                verify_payload(&payload, stored_checksum),
                RecordStatus::Corrupted { .. }
            )),
            _ => panic!("expected a complete frame"),
        }
    }

    #[test]
    fn truncated_frame_reads_as_partial() {
        let mut buf = BytesMut::new();
        write_frame(b"some payload", &mut buf);

        let bytes = buf.to_vec();

        // Cut within the header.
        let mut reader = Cursor::new(bytes[..5].to_vec());
        assert!(matches!(
            read_frame(&mut reader).expect("read should not fail"),
            FrameRead::Partial
        ));

        // Cut within the payload.
        let mut reader = Cursor::new(bytes[..bytes.len() - 3].to_vec());
        assert!(matches!(
            read_frame(&mut reader).expect("read should not fail"),
            FrameRead::Partial
        ));
    }
}
