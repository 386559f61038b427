//! Resumable raw payload transfer
//!
//! Both directions share one shape: the receiver compares what it already has
//! against the sender's (size, md5) and answers with a `ResumeStatus`; the
//! sender then streams the remaining bytes unframed, in `CHUNK_SIZE` pieces.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::checksum::md5_file;
use crate::error::{FerryError, Result};
use crate::progress::ProgressSink;
use crate::protocol::{ResumeStatus, CHUNK_SIZE};

/// Decide where a transfer of `(size, md5)` into `local` should start.
pub fn resume_status(local: &Path, size: u64, md5: &str) -> Result<ResumeStatus> {
    let md = match fs::metadata(local) {
        Ok(md) if md.is_file() => md,
        Ok(_) => {
            return Err(FerryError::PathViolation(format!(
                "{} exists and is not a file",
                local.display()
            )))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ResumeStatus::Fresh),
        Err(e) => return Err(e.into()),
    };

    let have = md.len();
    if have != size {
        // A local copy larger than the source still reports its size; the
        // sender refuses such an offset.
        return Ok(ResumeStatus::Resume(have));
    }
    if md5_file(local)?.eq_ignore_ascii_case(md5) {
        Ok(ResumeStatus::Skip)
    } else {
        Ok(ResumeStatus::Fresh)
    }
}

/// Stream `file[offset..size]` to `stream`. Nothing is written when the
/// receiver claims more bytes than the file has.
pub fn send_range<W: Write>(
    file: &mut File,
    offset: u64,
    size: u64,
    stream: &mut W,
    progress: &mut dyn ProgressSink,
) -> Result<u64> {
    if offset > size {
        return Err(FerryError::OffsetBeyondEnd { offset, size });
    }
    file.seek(SeekFrom::Start(offset)).map_err(FerryError::LocalIo)?;

    let mut remaining = size - offset;
    let mut sent = 0u64;
    let mut buf = [0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = match file.read(&mut buf[..want]) {
            Ok(0) => {
                // Shrunk underneath us; the receiver will notice the short read
                break;
            }
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(FerryError::LocalIo(e)),
        };
        stream.write_all(&buf[..n])?;
        remaining -= n as u64;
        sent += n as u64;
        progress.advance(n as u64);
    }
    stream.flush()?;
    Ok(sent)
}

/// Open `path` and send from `offset`, sized by the file's current length.
pub fn send_file<W: Write>(
    path: &Path,
    offset: u64,
    stream: &mut W,
    progress: &mut dyn ProgressSink,
) -> Result<u64> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    send_range(&mut file, offset, size, stream, progress)
}

/// Receive the bytes a peer sends after `status` was agreed for a `size`-byte
/// file. Returns the number of bytes written.
///
/// Failures on the local file come back as `LocalIo`, failures on `stream`
/// as `Io` or `ShortRead`. Either way the unread rest of the payload is still
/// on the wire.
pub fn receive_into<R: Read>(
    path: &Path,
    status: ResumeStatus,
    size: u64,
    stream: &mut R,
    progress: &mut dyn ProgressSink,
) -> Result<u64> {
    let offset = match status.offset() {
        Some(offset) => offset,
        None => return Ok(0),
    };
    let mut file = match status {
        ResumeStatus::Resume(_) => OpenOptions::new().create(true).append(true).open(path),
        _ => File::create(path),
    }
    .map_err(FerryError::LocalIo)?;

    let expected = size.saturating_sub(offset);
    let mut remaining = expected;
    let mut buf = [0u8; CHUNK_SIZE];
    while remaining > 0 {
        let want = remaining.min(CHUNK_SIZE as u64) as usize;
        let n = match stream.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                file.flush().map_err(FerryError::LocalIo)?;
                return Err(e.into());
            }
        };
        if n == 0 {
            file.flush().map_err(FerryError::LocalIo)?;
            return Err(FerryError::ShortRead {
                expected,
                received: expected - remaining,
            });
        }
        file.write_all(&buf[..n]).map_err(FerryError::LocalIo)?;
        remaining -= n as u64;
        progress.advance(n as u64);
    }
    file.flush().map_err(FerryError::LocalIo)?;
    Ok(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::md5_hex;
    use crate::progress::NoProgress;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn status_for_missing_partial_identical_and_corrupt() {
        let dir = TempDir::new().unwrap();
        let data = payload(2500);
        let md5 = md5_hex(&data);
        let p = dir.path().join("a.bin");

        assert_eq!(resume_status(&p, 2500, &md5).unwrap(), ResumeStatus::Fresh);

        fs::write(&p, &data[..1200]).unwrap();
        assert_eq!(resume_status(&p, 2500, &md5).unwrap(), ResumeStatus::Resume(1200));

        fs::write(&p, &data).unwrap();
        assert_eq!(resume_status(&p, 2500, &md5).unwrap(), ResumeStatus::Skip);

        let mut corrupt = data.clone();
        corrupt[10] ^= 0xff;
        fs::write(&p, &corrupt).unwrap();
        assert_eq!(resume_status(&p, 2500, &md5).unwrap(), ResumeStatus::Fresh);
    }

    #[test]
    fn larger_local_copy_is_refused_by_sender() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src.bin");
        fs::write(&src, payload(100)).unwrap();
        let dst = dir.path().join("dst.bin");
        fs::write(&dst, payload(300)).unwrap();

        let status = resume_status(&dst, 100, "whatever").unwrap();
        assert_eq!(status, ResumeStatus::Resume(300));

        let mut wire = Vec::new();
        let err = send_file(&src, 300, &mut wire, &mut NoProgress).unwrap_err();
        assert!(matches!(err, FerryError::OffsetBeyondEnd { offset: 300, size: 100 }));
        assert!(wire.is_empty());
    }

    #[test]
    fn interrupted_transfer_resumes_to_identical_file() {
        let dir = TempDir::new().unwrap();
        let data = payload(2500);
        let src = dir.path().join("src.bin");
        fs::write(&src, &data).unwrap();
        let dst = dir.path().join("dst.bin");

        // First attempt: the connection drops after 1200 bytes
        let mut wire = Vec::new();
        send_file(&src, 0, &mut wire, &mut NoProgress).unwrap();
        wire.truncate(1200);
        let err = receive_into(&dst, ResumeStatus::Fresh, 2500, &mut Cursor::new(wire), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, FerryError::ShortRead { expected: 2500, received: 1200 }));
        assert_eq!(fs::metadata(&dst).unwrap().len(), 1200);

        // Second attempt picks up from what is on disk
        let status = resume_status(&dst, 2500, &md5_hex(&data)).unwrap();
        assert_eq!(status, ResumeStatus::Resume(1200));
        let mut wire = Vec::new();
        let sent = send_file(&src, 1200, &mut wire, &mut NoProgress).unwrap();
        assert_eq!(sent, 1300);
        let got = receive_into(&dst, status, 2500, &mut Cursor::new(wire), &mut NoProgress).unwrap();
        assert_eq!(got, 1300);

        assert_eq!(fs::read(&dst).unwrap(), data);
        assert_eq!(resume_status(&dst, 2500, &md5_hex(&data)).unwrap(), ResumeStatus::Skip);
    }

    #[test]
    fn fresh_overwrites_corrupt_copy() {
        let dir = TempDir::new().unwrap();
        let data = payload(3000);
        let dst = dir.path().join("dst.bin");
        fs::write(&dst, vec![0u8; 3000]).unwrap();

        let got = receive_into(&dst, ResumeStatus::Fresh, 3000, &mut Cursor::new(data.clone()), &mut NoProgress)
            .unwrap();
        assert_eq!(got, 3000);
        assert_eq!(fs::read(&dst).unwrap(), data);
    }

    #[test]
    fn skip_moves_nothing() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("dst.bin");
        let got = receive_into(&dst, ResumeStatus::Skip, 10, &mut Cursor::new(vec![1u8; 10]), &mut NoProgress)
            .unwrap();
        assert_eq!(got, 0);
        assert!(!dst.exists());
    }

    #[test]
    fn unwritable_target_is_a_local_error() {
        let dir = TempDir::new().unwrap();
        let dst = dir.path().join("gone").join("dst.bin");
        let err = receive_into(&dst, ResumeStatus::Fresh, 10, &mut Cursor::new(vec![1u8; 10]), &mut NoProgress)
            .unwrap_err();
        assert!(matches!(err, FerryError::LocalIo(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn empty_file_round_trip() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("empty");
        fs::write(&src, b"").unwrap();
        let dst = dir.path().join("copy");

        let mut wire = Vec::new();
        assert_eq!(send_file(&src, 0, &mut wire, &mut NoProgress).unwrap(), 0);
        receive_into(&dst, ResumeStatus::Fresh, 0, &mut Cursor::new(wire), &mut NoProgress).unwrap();
        assert_eq!(fs::metadata(&dst).unwrap().len(), 0);
    }
}
