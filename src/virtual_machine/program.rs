//! Assembled program images and their on-disk format.
//!
//! A [`Program`] is the output of the assembler: a block of little-endian
//! instruction and data words meant to be copied into main memory at a fixed
//! origin, plus the label table the assembler resolved. [`Program::to_bytes`]
//! serializes it behind a magic header and format version, which is what the
//! `assembler` binary writes and the `terranvm` runner loads.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::vm::IVT_END;
use std::collections::BTreeMap;

/// Magic bytes identifying a serialized program image.
const MAGIC: &[u8; 6] = b"TVM_BC";

/// Current image format version.
const CURRENT_VERSION: Version = Version::new(0, 1, 0);

/// Semantic version for image format compatibility.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Version {
    major: u8,
    minor: u8,
    patch: u8,
}

impl Version {
    const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

/// Little-endian field writers for the image format.
trait Encode {
    fn encode(&self, out: &mut Vec<u8>);
}

/// Little-endian field readers that advance the input slice.
trait Decode: Sized {
    fn decode(input: &mut &[u8]) -> Result<Self, VMError>;
}

fn truncated() -> VMError {
    VMError::DecodeError {
        reason: "truncated".to_string(),
    }
}

fn take<'a>(input: &mut &'a [u8], len: usize) -> Result<&'a [u8], VMError> {
    if input.len() < len {
        return Err(truncated());
    }
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

impl Encode for u8 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }
}

impl Decode for u8 {
    fn decode(input: &mut &[u8]) -> Result<Self, VMError> {
        Ok(take(input, 1)?[0])
    }
}

impl Encode for u32 {
    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
}

impl Decode for u32 {
    fn decode(input: &mut &[u8]) -> Result<Self, VMError> {
        let b = take(input, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

impl Encode for [u8] {
    fn encode(&self, out: &mut Vec<u8>) {
        (self.len() as u32).encode(out);
        out.extend_from_slice(self);
    }
}

impl Decode for Vec<u8> {
    fn decode(input: &mut &[u8]) -> Result<Self, VMError> {
        let len = u32::decode(input)? as usize;
        Ok(take(input, len)?.to_vec())
    }
}

impl Encode for Version {
    fn encode(&self, out: &mut Vec<u8>) {
        self.major.encode(out);
        self.minor.encode(out);
        self.patch.encode(out);
    }
}

impl Decode for Version {
    fn decode(input: &mut &[u8]) -> Result<Self, VMError> {
        Ok(Version::new(
            u8::decode(input)?,
            u8::decode(input)?,
            u8::decode(input)?,
        ))
    }
}

/// An assembled program image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Program {
    /// Byte address the image was assembled for.
    pub origin: u32,
    /// Byte address execution starts at.
    pub entry: u32,
    /// Call-stack capacity requested by a `.stack` section.
    pub stack_size: Option<u32>,
    /// Instruction and data words, little-endian.
    pub bytes: Vec<u8>,
    /// Resolved labels, lower-cased, to byte addresses.
    pub labels: BTreeMap<String, u32>,
}

impl Default for Program {
    fn default() -> Self {
        Self::new(IVT_END)
    }
}

impl Program {
    /// Empty program starting at `origin`.
    pub fn new(origin: u32) -> Self {
        Self {
            origin,
            entry: origin,
            stack_size: None,
            bytes: Vec::new(),
            labels: BTreeMap::new(),
        }
    }

    /// Image size in bytes.
    pub fn len(&self) -> u32 {
        self.bytes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// First byte address past the image.
    pub fn end(&self) -> u32 {
        self.origin + self.len()
    }

    /// Address of `name`, case-insensitively.
    pub fn label(&self, name: &str) -> Option<u32> {
        self.labels.get(&name.to_ascii_lowercase()).copied()
    }

    /// The image as instruction words.
    pub fn words(&self) -> impl Iterator<Item = u32> + '_ {
        self.bytes
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Serializes the program to its binary image format.
    ///
    /// The output includes a magic header and version for compatibility checking.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes.len() + 64);
        out.extend_from_slice(MAGIC);
        CURRENT_VERSION.encode(&mut out);
        self.origin.encode(&mut out);
        self.entry.encode(&mut out);
        self.stack_size.unwrap_or(0).encode(&mut out);
        self.bytes.encode(&mut out);
        (self.labels.len() as u32).encode(&mut out);
        for (name, address) in &self.labels {
            name.as_bytes().encode(&mut out);
            address.encode(&mut out);
        }
        out
    }

    /// Deserializes a program from its binary image format.
    ///
    /// Validates the magic header and version, rejecting images written by a
    /// different format version.
    pub fn from_bytes(mut input: &[u8]) -> Result<Self, VMError> {
        if take(&mut input, MAGIC.len())? != MAGIC {
            return Err(VMError::DecodeError {
                reason: "bad magic".to_string(),
            });
        }

        if Version::decode(&mut input)? != CURRENT_VERSION {
            return Err(VMError::DecodeError {
                reason: "unsupported version".to_string(),
            });
        }

        let origin = u32::decode(&mut input)?;
        let entry = u32::decode(&mut input)?;
        let stack_size = Some(u32::decode(&mut input)?).filter(|&s| s != 0);
        let bytes = Vec::<u8>::decode(&mut input)?;
        if origin % 4 != 0 || bytes.len() % 4 != 0 {
            return Err(VMError::DecodeError {
                reason: "image is not word-aligned".to_string(),
            });
        }

        let count = u32::decode(&mut input)?;
        let mut labels = BTreeMap::new();
        for _ in 0..count {
            let name = String::from_utf8(Vec::<u8>::decode(&mut input)?).map_err(|_| {
                VMError::DecodeError {
                    reason: "label is not valid UTF-8".to_string(),
                }
            })?;
            labels.insert(name, u32::decode(&mut input)?);
        }

        if !input.is_empty() {
            return Err(VMError::DecodeError {
                reason: "trailing bytes".to_string(),
            });
        }
        Ok(Program {
            origin,
            entry,
            stack_size,
            bytes,
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Program {
        let mut p = Program::new(IVT_END);
        p.bytes = vec![1, 0, 0, 0, 0, 0, 0, 0];
        p.stack_size = Some(16);
        p.labels.insert("loop".into(), IVT_END + 4);
        p
    }

    #[test]
    fn image_survives_serialization() {
        let p = sample();
        assert_eq!(Program::from_bytes(&p.to_bytes()).unwrap(), p);
    }

    #[test]
    fn rejects_bad_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        assert!(matches!(
            Program::from_bytes(&bytes),
            Err(VMError::DecodeError { reason }) if reason == "bad magic"
        ));
    }

    #[test]
    fn rejects_other_versions() {
        let mut bytes = sample().to_bytes();
        bytes[MAGIC.len()] = 9;
        assert!(matches!(
            Program::from_bytes(&bytes),
            Err(VMError::DecodeError { reason }) if reason == "unsupported version"
        ));
    }

    #[test]
    fn rejects_trailing_and_truncated_input() {
        let mut bytes = sample().to_bytes();
        bytes.push(0);
        assert!(Program::from_bytes(&bytes).is_err());
        let bytes = sample().to_bytes();
        assert!(matches!(
            Program::from_bytes(&bytes[..bytes.len() - 1]),
            Err(VMError::DecodeError { reason }) if reason == "truncated"
        ));
    }

    #[test]
    fn labels_are_case_insensitive() {
        let p = sample();
        assert_eq!(p.label("LOOP"), Some(IVT_END + 4));
        assert_eq!(p.label("missing"), None);
        assert_eq!(p.end(), IVT_END + 8);
        assert_eq!(p.words().collect::<Vec<_>>(), vec![1, 0]);
    }
}
