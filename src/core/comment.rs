//! Package comment record

use crate::codec::FieldReader;
use crate::error::{PackageError, Result};

/// Maximum comment length in bytes, terminating NUL included
pub const MAX_COMMENT_LEN: usize = 1_048_575;

const RESERVED_LEN: usize = 3;

/// Encode `text` as `len u32, bytes.., NUL, reserved[3]`
pub fn encode_comment(text: &str) -> Result<Vec<u8>> {
    if text.contains('\0') {
        return Err(PackageError::invalid(
            "PackageComment",
            "comment cannot contain NUL",
        ));
    }
    let len = text.len() + 1;
    if len > MAX_COMMENT_LEN {
        return Err(PackageError::invalid(
            "PackageComment",
            format!("comment of {} bytes exceeds {}", len, MAX_COMMENT_LEN),
        ));
    }
    let mut out = Vec::with_capacity(4 + len + RESERVED_LEN);
    out.extend_from_slice(&(len as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
    out.push(0);
    out.extend_from_slice(&[0u8; RESERVED_LEN]);
    Ok(out)
}

pub fn encoded_comment_size(text: &str) -> usize {
    4 + text.len() + 1 + RESERVED_LEN
}

/// Decode a comment record occupying exactly `bytes`
pub fn decode_comment(bytes: &[u8]) -> Result<String> {
    let mut r = FieldReader::new(bytes, "PackageComment");
    let len = r.u32("CommentLength")? as usize;
    if len == 0 || len > MAX_COMMENT_LEN {
        return Err(PackageError::malformed(
            "PackageComment",
            "CommentLength",
            format!("length {} outside 1..={}", len, MAX_COMMENT_LEN),
        ));
    }
    let raw = r.bytes(len, "Comment")?;
    let (terminator, body) = raw
        .split_last()
        .ok_or_else(|| PackageError::malformed("PackageComment", "Comment", "empty comment"))?;
    if *terminator != 0 {
        return Err(PackageError::malformed(
            "PackageComment",
            "Comment",
            "comment is not NUL terminated",
        ));
    }
    if body.contains(&0) {
        return Err(PackageError::malformed(
            "PackageComment",
            "Comment",
            "comment contains an embedded NUL",
        ));
    }
    let text = std::str::from_utf8(body)
        .map_err(|_| PackageError::malformed("PackageComment", "Comment", "not valid UTF-8"))?;

    let reserved = r.bytes(RESERVED_LEN, "Reserved")?;
    if reserved.iter().any(|b| *b != 0) {
        return Err(PackageError::ReservedNotZero {
            structure: "PackageComment",
            field: "Reserved",
            value: reserved.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64),
        });
    }
    if r.remaining() != 0 {
        return Err(PackageError::malformed(
            "PackageComment",
            "CommentLength",
            format!("{} trailing bytes after comment", r.remaining()),
        ));
    }
    Ok(text.to_string())
}
