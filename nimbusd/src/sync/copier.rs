use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

use thiserror::Error;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum CopyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("destination stopped accepting bytes")]
    StalledSink,
}

/// Move all bytes from `source` to `destination` in bounded chunks. A write
/// that accepts zero bytes is a failure, not something to spin on.
pub fn copy(source: &mut impl Read, destination: &mut impl Write) -> Result<u64, CopyError> {
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let read = source.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let mut offset = 0;
        while offset < read {
            let written = destination.write(&buffer[offset..read])?;
            if written == 0 {
                return Err(CopyError::StalledSink);
            }
            offset += written;
        }
        total += read as u64;
    }
    destination.flush()?;
    Ok(total)
}

/// File-to-file variant; parent directories of the destination are created
/// before the first write. Synchronous: callers on an async timeline run this
/// under `spawn_blocking`.
pub fn copy_to_path(source: &Path, destination: &Path) -> Result<u64, CopyError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut input = File::open(source)?;
    let mut output = File::create(destination)?;
    copy(&mut input, &mut output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor};
    use tempfile::tempdir;

    struct StalledWriter;

    impl Write for StalledWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("disk fell off"))
        }
    }

    struct ShortWriter {
        out: Vec<u8>,
    }

    impl Write for ShortWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            // accept at most three bytes per call
            let take = buf.len().min(3);
            self.out.extend_from_slice(&buf[..take]);
            Ok(take)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn copies_payload_larger_than_one_chunk() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let mut source = Cursor::new(payload.clone());
        let mut destination = Vec::new();

        let copied = copy(&mut source, &mut destination).unwrap();

        assert_eq!(copied, payload.len() as u64);
        assert_eq!(destination, payload);
    }

    #[test]
    fn partial_writes_are_retried_until_the_chunk_drains() {
        let mut source = Cursor::new(b"0123456789".to_vec());
        let mut destination = ShortWriter { out: Vec::new() };

        copy(&mut source, &mut destination).unwrap();

        assert_eq!(destination.out, b"0123456789");
    }

    #[test]
    fn zero_byte_write_fails_instead_of_spinning() {
        let mut source = Cursor::new(b"payload".to_vec());
        let err = copy(&mut source, &mut StalledWriter).unwrap_err();
        assert!(matches!(err, CopyError::StalledSink));
    }

    #[test]
    fn read_errors_propagate_immediately() {
        let mut destination = Vec::new();
        let err = copy(&mut FailingReader, &mut destination).unwrap_err();
        assert!(matches!(err, CopyError::Io(_)));
    }

    #[test]
    fn copy_to_path_creates_missing_parents() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("in.bin");
        fs::write(&source, b"hello").unwrap();
        let destination = dir.path().join("nested/deep/out.bin");

        copy_to_path(&source, &destination).unwrap();

        assert_eq!(fs::read(destination).unwrap(), b"hello");
    }
}
