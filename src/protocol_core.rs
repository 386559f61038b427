//! Envelope framing and path confinement shared by the server and the client.
//!
//! Every command travels as `[4-byte LE i32 length][UTF-8 JSON object]`.
//! Single-value replies (status codes, listings) are plain unframed text.

use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FerryError, Result};
use crate::protocol::{Envelope, HEADER_LEN, LISTING_RULE_WIDTH, MAX_ENVELOPE_SIZE};

/// Validate envelope payload size against protocol::MAX_ENVELOPE_SIZE
pub fn validate_envelope_size(size: usize) -> Result<()> {
    if size > MAX_ENVELOPE_SIZE {
        return Err(FerryError::Protocol(format!(
            "envelope too large: {} bytes (max: {})",
            size, MAX_ENVELOPE_SIZE
        )));
    }
    Ok(())
}

/// Build the 4-byte envelope header
pub fn build_envelope_header(payload_len: usize) -> Result<[u8; HEADER_LEN]> {
    validate_envelope_size(payload_len)?;
    Ok((payload_len as i32).to_le_bytes())
}

/// Parse the 4-byte envelope header into a payload length
pub fn parse_envelope_header(header: &[u8; HEADER_LEN]) -> Result<usize> {
    let len = i32::from_le_bytes(*header);
    if len < 0 {
        return Err(FerryError::Protocol(format!("negative envelope length: {}", len)));
    }
    let len = len as usize;
    validate_envelope_size(len)?;
    Ok(len)
}

/// Serialize `message` as JSON and write it as one envelope.
pub fn write_envelope<W: Write, T: Serialize>(stream: &mut W, message: &T) -> Result<()> {
    let payload = serde_json::to_vec(message)?;
    let header = build_envelope_header(payload.len())?;
    stream.write_all(&header)?;
    stream.write_all(&payload)?;
    stream.flush()?;
    Ok(())
}

/// Read one envelope. `Ok(None)` means the peer closed the connection
/// cleanly before sending anything.
pub fn read_envelope<R: Read>(stream: &mut R) -> Result<Option<Envelope>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match stream.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(FerryError::Protocol(format!(
                    "truncated envelope header ({} of {} bytes)",
                    filled, HEADER_LEN
                )))
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    let len = parse_envelope_header(&header)?;
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).map_err(|e| {
        if e.kind() == ErrorKind::UnexpectedEof {
            FerryError::Protocol(format!("truncated envelope payload (expected {} bytes)", len))
        } else {
            FerryError::Io(e)
        }
    })?;

    let text = std::str::from_utf8(&payload)
        .map_err(|e| FerryError::Protocol(format!("envelope is not UTF-8: {}", e)))?;
    let envelope: Envelope = serde_json::from_str(text)?;
    Ok(Some(envelope))
}

/// Read one envelope and decode it into `T`. End of stream is an error here:
/// callers use this when a reply is mandatory.
pub fn read_message<R: Read, T: DeserializeOwned>(stream: &mut R) -> Result<T> {
    let envelope = read_envelope(stream)?
        .ok_or_else(|| FerryError::Protocol("connection closed while waiting for a reply".into()))?;
    Ok(serde_json::from_value(serde_json::Value::Object(envelope))?)
}

/// Send an unframed text reply.
pub fn send_reply<W: Write>(stream: &mut W, reply: &str) -> Result<()> {
    stream.write_all(reply.as_bytes())?;
    stream.flush()?;
    Ok(())
}

/// Read one unframed text reply with a single read of at most `max` bytes.
pub fn read_reply<R: Read>(stream: &mut R, max: usize) -> Result<String> {
    let mut buf = vec![0u8; max];
    let n = loop {
        match stream.read(&mut buf) {
            Ok(n) => break n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    };
    if n == 0 {
        return Err(FerryError::Protocol("connection closed while waiting for a reply".into()));
    }
    buf.truncate(n);
    String::from_utf8(buf).map_err(|e| FerryError::Protocol(format!("reply is not UTF-8: {}", e)))
}

/// Read an `ls` reply: either a bare status code or a listing closed by a
/// rule line. A listing may arrive over any number of reads.
pub fn read_listing<R: Read>(stream: &mut R, max: usize) -> Result<String> {
    let closing = format!("\n{}", "-".repeat(LISTING_RULE_WIDTH));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = match stream.read(&mut chunk) {
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        if n == 0 {
            return Err(FerryError::Protocol(format!(
                "connection closed after {} bytes of a listing",
                buf.len()
            )));
        }
        buf.extend_from_slice(&chunk[..n]);

        let is_code = buf.len() == 2 && buf[0] == b'-' && buf[1].is_ascii_digit();
        if is_code || buf.ends_with(closing.as_bytes()) {
            break;
        }
        if buf.len() > max {
            return Err(FerryError::Protocol(format!("listing exceeds {} bytes", max)));
        }
    }
    String::from_utf8(buf).map_err(|e| FerryError::Protocol(format!("listing is not UTF-8: {}", e)))
}

/// Resolve `rel` against `base` and make sure the result stays under `root`.
///
/// Rejects NUL bytes, absolute paths, `..` and prefix components, then
/// canonicalizes whatever exists so symlinks cannot lead out of `root`.
/// `root` must already be canonical.
pub fn confine_under(root: &Path, base: &Path, rel: &str) -> Result<PathBuf> {
    if rel.contains('\0') {
        return Err(FerryError::PathViolation("path contains NUL byte".into()));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(FerryError::PathViolation(format!(
                    "path contains disallowed component: {:?}",
                    component
                )));
            }
        }
    }
    if safe.as_os_str().is_empty() {
        return Err(FerryError::PathViolation("empty path".into()));
    }

    let joined = base.join(&safe);
    let final_path = if joined.exists() {
        joined.canonicalize()?
    } else if let Some(parent) = joined.parent().filter(|p| p.exists()) {
        let canonical_parent = parent.canonicalize()?;
        match joined.file_name() {
            Some(name) => canonical_parent.join(name),
            None => canonical_parent,
        }
    } else {
        joined
    };

    if !final_path.starts_with(root) {
        return Err(FerryError::PathViolation(format!("{:?} escapes {:?}", rel, root)));
    }
    Ok(final_path)
}

/// A file name usable for `put`/`get`: one plain component, no separators.
pub fn validate_file_name(name: &str) -> Result<()> {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) if !name.contains('\0') && !name.contains('/') && !name.contains('\\') => Ok(()),
        _ => Err(FerryError::PathViolation(format!("invalid file name: {:?}", name))),
    }
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
