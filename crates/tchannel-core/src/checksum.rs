//! Chained per-fragment checksums.
//!
//! Every fragment of a call digests the argument bytes it carries, seeded by
//! the previous fragment's digest (seed 0 for the first fragment). For the
//! CRC family this makes the final fragment's digest equal the CRC of the
//! whole concatenated argument stream.

use std::fmt;

/// Checksum algorithm named by the wire's checksum type byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ChecksumType {
    /// No checksum; the 4-byte checksum field is absent.
    #[default]
    None = 0x00,
    /// CRC-32 (IEEE).
    Crc32 = 0x01,
    /// FarmHash fingerprint32.
    Farmhash32 = 0x02,
    /// CRC-32C (Castagnoli).
    Crc32c = 0x03,
}

impl ChecksumType {
    pub fn from_u8(val: u8) -> Option<Self> {
        Some(match val {
            0x00 => ChecksumType::None,
            0x01 => ChecksumType::Crc32,
            0x02 => ChecksumType::Farmhash32,
            0x03 => ChecksumType::Crc32c,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Wire size of the checksum type byte plus the checksum field.
    pub fn field_len(self) -> usize {
        match self {
            ChecksumType::None => 1,
            _ => 5,
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumType::None => "none",
            ChecksumType::Crc32 => "crc32",
            ChecksumType::Farmhash32 => "farmhash32",
            ChecksumType::Crc32c => "crc32c",
        };
        f.write_str(name)
    }
}

/// Running checksum across the fragments of one call.
///
/// `digest` folds one fragment's argument bytes into the chain and returns
/// the value to put on (or compare against) that fragment's checksum field.
#[derive(Clone, Copy, Debug)]
pub struct ChecksumStream {
    ty: ChecksumType,
    seed: u32,
}

impl ChecksumStream {
    pub fn new(ty: ChecksumType) -> Self {
        Self { ty, seed: 0 }
    }

    pub fn checksum_type(&self) -> ChecksumType {
        self.ty
    }

    /// Digest one fragment's argument byte runs, in emission order.
    pub fn digest<'a>(&mut self, parts: impl IntoIterator<Item = &'a [u8]>) -> u32 {
        let digest = match self.ty {
            ChecksumType::None => 0,
            ChecksumType::Crc32 => {
                let mut hasher = crc32fast::Hasher::new_with_initial(self.seed);
                for part in parts {
                    hasher.update(part);
                }
                hasher.finalize()
            }
            ChecksumType::Crc32c => {
                let mut crc = self.seed;
                for part in parts {
                    crc = crc32c::crc32c_append(crc, part);
                }
                crc
            }
            ChecksumType::Farmhash32 => {
                // farmhash is one-shot, so a multi-chunk fragment is digested
                // through a scratch buffer.
                let mut parts = parts.into_iter();
                let first = parts.next().unwrap_or(&[]);
                match parts.next() {
                    None => farmhash::hash32_with_seed(first, self.seed),
                    Some(second) => {
                        let mut scratch = Vec::with_capacity(first.len() + second.len());
                        scratch.extend_from_slice(first);
                        scratch.extend_from_slice(second);
                        for part in parts {
                            scratch.extend_from_slice(part);
                        }
                        farmhash::hash32_with_seed(&scratch, self.seed)
                    }
                }
            }
        };
        self.seed = digest;
        digest
    }

    /// Digest one fragment and compare against the checksum it carried.
    pub fn verify<'a>(
        &mut self,
        parts: impl IntoIterator<Item = &'a [u8]>,
        expected: u32,
    ) -> Result<(), u32> {
        if self.ty == ChecksumType::None {
            return Ok(());
        }
        let computed = self.digest(parts);
        if computed == expected { Ok(()) } else { Err(computed) }
    }
}
