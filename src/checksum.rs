//! Checksum and hashing utilities
//!
//! MD5 is what the wire protocol carries for transfer descriptors and what
//! the credential file stores for passwords. It detects corruption, it is
//! not a security boundary.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::Result;

const HASH_BUF: usize = 64 * 1024;

/// Lowercase hex MD5 of an in-memory buffer
pub fn md5_hex(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// Lowercase hex MD5 of a reader's full contents
pub fn md5_reader<R: Read>(reader: &mut R) -> Result<String> {
    let mut ctx = md5::Context::new();
    let mut buf = vec![0u8; HASH_BUF];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        ctx.consume(&buf[..n]);
    }
    Ok(format!("{:x}", ctx.compute()))
}

/// Lowercase hex MD5 of a file, streamed
pub fn md5_file(path: &Path) -> Result<String> {
    let mut f = File::open(path)?;
    md5_reader(&mut f)
}
