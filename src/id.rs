//! Module `id` implements the 160-bit image identifier: SHA-1 of the
//! image bytes, hex-encoded as a 40-character lowercase string for the
//! wire/SQL form.
//!
//! Grounded on `otama_id.c`/`otama_id.h` from the original library: a
//! hand-rolled hex table instead of pulling in a `hex` crate, since the
//! original keeps this conversion inline and it is a handful of lines.

use sha1::{Digest, Sha1};
use std::{fmt, fs, io::Read, path::Path};

use crate::error::{Error, Result};

/// Number of bytes in an [`Id`].
pub const ID_LEN: usize = 20;
/// Number of characters in the hex-encoded form, not counting a NUL.
pub const ID_HEXSTR_LEN: usize = ID_LEN * 2;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A 160-bit image identifier: the SHA-1 digest of the image bytes (or
/// of externally supplied data). Equality on `Id` is what duplicate
/// suppression at insert is built on.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Wrap a raw 20-byte digest.
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Id {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// `id_of_data(bytes) = SHA1(bytes)`.
    pub fn of_data(data: &[u8]) -> Id {
        let mut hasher = Sha1::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest);
        Id(out)
    }

    /// `id_of_file(path) = SHA1(bytes(path))`.
    pub fn of_file<P: AsRef<Path>>(path: P) -> Result<Id> {
        let mut file = fs::File::open(path.as_ref())
            .map_err(|err| Error::SystemError(format!("open {:?}: {}", path.as_ref(), err)))?;
        let mut hasher = Sha1::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest);
        Ok(Id(out))
    }

    /// Lowercase, 40-char, no-separator hex encoding.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(ID_HEXSTR_LEN);
        for byte in self.0.iter() {
            s.push(HEX_DIGITS[(byte >> 4) as usize] as char);
            s.push(HEX_DIGITS[(byte & 0xf) as usize] as char);
        }
        s
    }

    /// Decode a 40-char lowercase hex string. Fails with
    /// [`Error::InvalidArguments`] on length mismatch or non-hex chars.
    pub fn from_hex(hexstr: &str) -> Result<Id> {
        if hexstr.len() != ID_HEXSTR_LEN {
            return Err(err_at!(
                InvalidArguments,
                "id hex length {} != {}",
                hexstr.len(),
                ID_HEXSTR_LEN
            ));
        }
        let bytes = hexstr.as_bytes();
        let mut out = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            let hi = hex_nibble(bytes[i * 2])?;
            let lo = hex_nibble(bytes[i * 2 + 1])?;
            out[i] = (hi << 4) | lo;
        }
        Ok(Id(out))
    }
}

fn hex_nibble(c: u8) -> Result<u8> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(err_at!(InvalidArguments, "non-hex character {:?}", c as char)),
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod id_test {
    use super::*;

    #[test]
    fn test_of_data_deterministic() {
        let data = b"the quick brown fox jumps over the lazy dog";
        let a = Id::of_data(data);
        let b = Id::of_data(data);
        assert!(a == b);
    }

    #[test]
    fn test_of_data_known_vector() {
        // SHA1("abc") is a well-known test vector.
        let id = Id::of_data(b"abc");
        assert_eq!(id.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
    }

    #[test]
    fn test_hex_round_trip() {
        let id = Id::of_data(b"round trip me");
        let hex = id.to_hex();
        let back = Id::from_hex(&hex).unwrap();
        assert!(id == back);
        assert_eq!(back.to_hex(), hex);
    }

    #[test]
    fn test_hex_rejects_bad_length() {
        assert!(Id::from_hex("abcd").is_err());
    }

    #[test]
    fn test_hex_rejects_non_hex() {
        let bad = "g".repeat(ID_HEXSTR_LEN);
        assert!(Id::from_hex(&bad).is_err());
    }
}
