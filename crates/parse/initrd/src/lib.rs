//! Boot ramdisk container.
//!
//! The loader hands the kernel one blob: a 32-byte header followed by two
//! block streams, one carrying directory/file descriptors and one carrying
//! file contents. Each block is prefixed by a header with a CRC32 over its
//! stored payload; the default uncompressed block size is 64 KiB and a
//! record may span block boundaries.
//!
//! Directory descriptors point at a child table in the descriptor stream
//! (their `length` is the child count); file descriptors point at the
//! contents in the data stream (their `length` is the byte size).
//!
//! Only stored (uncompressed) blocks are supported; any other compression
//! type reports [`InitrdError::UnsupportedCompression`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

/// Container magic (`MRD1` little-endian).
pub const FS_MAGIC: u32 = 0x3144_524D;

/// Supported container version.
pub const FS_VERSION: u32 = 0x0001_0000;

/// Per-block magic.
pub const BLOCK_MAGIC: u32 = 0xAE30_5532;

/// Uncompressed block size.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Container header size.
pub const HEADER_SIZE: usize = 32;

/// Block header size.
pub const BLOCK_HEADER_SIZE: usize = 16;

/// Descriptor record size: type (2) + length (4) + name (64) + position (6).
pub const DESCRIPTOR_SIZE: usize = 76;

/// Descriptor type tag: regular file.
pub const DESCRIPTOR_FILE: u16 = 0x01;

/// Descriptor type tag: directory.
pub const DESCRIPTOR_DIRECTORY: u16 = 0x02;

#[cfg(any(test, feature = "testing"))]
pub mod build;

/// Errors from image parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitrdError {
    /// Container or block magic mismatch.
    BadMagic,
    /// Unknown container version.
    UnsupportedVersion,
    /// Block payload does not match its CRC.
    ChecksumMismatch,
    /// The block uses a compression type this kernel does not carry.
    UnsupportedCompression,
    /// The blob ends inside a structure.
    Truncated,
    /// Path lookup failed.
    NotFound,
    /// The descriptor is not of the expected type.
    WrongType,
}

impl fmt::Display for InitrdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadMagic => write!(f, "bad ramdisk magic"),
            Self::UnsupportedVersion => write!(f, "unsupported ramdisk version"),
            Self::ChecksumMismatch => write!(f, "ramdisk block checksum mismatch"),
            Self::UnsupportedCompression => write!(f, "unsupported block compression"),
            Self::Truncated => write!(f, "truncated ramdisk"),
            Self::NotFound => write!(f, "path not found in ramdisk"),
            Self::WrongType => write!(f, "descriptor type mismatch"),
        }
    }
}

/// Position inside a block stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPosition {
    /// Block index within the stream.
    pub block: u16,
    /// Byte offset within the uncompressed block.
    pub offset: u32,
}

/// Descriptor kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
}

/// One parsed descriptor record.
#[derive(Debug, Clone)]
pub struct Descriptor {
    /// UTF-8 name (NUL-padded on disk).
    pub name: String,
    /// File or directory.
    pub kind: DescriptorKind,
    /// File byte size, or directory child count.
    pub length: u32,
    /// Contents position (data stream for files, descriptor stream for
    /// directories).
    pub position: BlockPosition,
}

fn read_u16(data: &[u8], offset: usize) -> Result<u16, InitrdError> {
    data.get(offset..offset + 2)
        .and_then(|b| b.try_into().ok())
        .map(u16::from_le_bytes)
        .ok_or(InitrdError::Truncated)
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32, InitrdError> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(InitrdError::Truncated)
}

/// One validated stream of blocks (borrowed payload slices).
#[derive(Debug)]
struct BlockStream<'a> {
    blocks: Vec<&'a [u8]>,
}

impl<'a> BlockStream<'a> {
    /// Walks `[start, end)` of the blob, validating each block header and
    /// payload CRC.
    fn parse(data: &'a [u8], start: usize, end: usize) -> Result<Self, InitrdError> {
        let mut blocks = Vec::new();
        let mut cursor = start;
        while cursor < end {
            if read_u32(data, cursor)? != BLOCK_MAGIC {
                return Err(InitrdError::BadMagic);
            }
            let length = read_u32(data, cursor + 4)? as usize;
            let crc = read_u32(data, cursor + 8)?;
            let compression = read_u16(data, cursor + 12)?;

            let payload_start = cursor + BLOCK_HEADER_SIZE;
            let payload = data
                .get(payload_start..payload_start + length)
                .ok_or(InitrdError::Truncated)?;
            if compression != 0 {
                return Err(InitrdError::UnsupportedCompression);
            }
            if crc32fast::hash(payload) != crc {
                return Err(InitrdError::ChecksumMismatch);
            }
            blocks.push(payload);
            cursor = payload_start + length;
        }
        Ok(Self { blocks })
    }

    /// Copies `buf.len()` bytes starting at `pos`, crossing block
    /// boundaries as needed. Short-copies at end of stream.
    fn read_at(&self, pos: BlockPosition, skip: u64, buf: &mut [u8]) -> Result<usize, InitrdError> {
        let mut block = pos.block as usize;
        let mut offset = pos.offset as u64 + skip;
        // Skip whole blocks the offset crosses.
        while block < self.blocks.len() && offset >= self.blocks[block].len() as u64 {
            offset -= self.blocks[block].len() as u64;
            block += 1;
        }

        let mut copied = 0;
        while copied < buf.len() && block < self.blocks.len() {
            let source = &self.blocks[block][offset as usize..];
            let count = source.len().min(buf.len() - copied);
            buf[copied..copied + count].copy_from_slice(&source[..count]);
            copied += count;
            offset = 0;
            block += 1;
        }
        Ok(copied)
    }
}

/// A parsed, validated ramdisk image.
#[derive(Debug)]
pub struct Image<'a> {
    /// Architecture tag recorded by the build tool.
    pub architecture: u32,
    descriptors: BlockStream<'a>,
    data: BlockStream<'a>,
    root: BlockPosition,
    root_count: u32,
}

impl<'a> Image<'a> {
    /// Parses and validates an image blob.
    ///
    /// # Errors
    ///
    /// Any [`InitrdError`] from header or block validation.
    pub fn parse(data: &'a [u8]) -> Result<Self, InitrdError> {
        if read_u32(data, 0)? != FS_MAGIC {
            return Err(InitrdError::BadMagic);
        }
        if read_u32(data, 4)? != FS_VERSION {
            return Err(InitrdError::UnsupportedVersion);
        }
        let architecture = read_u32(data, 8)?;
        let descriptor_offset = read_u32(data, 12)? as usize;
        let data_offset = read_u32(data, 16)? as usize;
        let root = BlockPosition {
            block: read_u16(data, 20)?,
            offset: read_u32(data, 22)?,
        };
        let root_count = read_u32(data, 26)?;
        if descriptor_offset < HEADER_SIZE || data_offset < descriptor_offset {
            return Err(InitrdError::Truncated);
        }

        let descriptors = BlockStream::parse(data, descriptor_offset, data_offset)?;
        let stream = BlockStream::parse(data, data_offset, data.len())?;
        Ok(Self {
            architecture,
            descriptors,
            data: stream,
            root,
            root_count,
        })
    }

    fn read_descriptor(&self, pos: BlockPosition, index: u32) -> Result<Descriptor, InitrdError> {
        let mut record = [0u8; DESCRIPTOR_SIZE];
        let skip = u64::from(index) * DESCRIPTOR_SIZE as u64;
        if self.descriptors.read_at(pos, skip, &mut record)? != DESCRIPTOR_SIZE {
            return Err(InitrdError::Truncated);
        }

        let kind = match read_u16(&record, 0)? {
            DESCRIPTOR_FILE => DescriptorKind::File,
            DESCRIPTOR_DIRECTORY => DescriptorKind::Directory,
            _ => return Err(InitrdError::WrongType),
        };
        let length = read_u32(&record, 2)?;
        let name_bytes = &record[6..70];
        let name_len = name_bytes.iter().position(|&b| b == 0).unwrap_or(64);
        let name = core::str::from_utf8(&name_bytes[..name_len])
            .map_err(|_| InitrdError::WrongType)?;
        let position = BlockPosition {
            block: read_u16(&record, 70)?,
            offset: read_u32(&record, 72)?,
        };
        Ok(Descriptor {
            name: String::from(name),
            kind,
            length,
            position,
        })
    }

    /// Lists the children of a directory descriptor.
    ///
    /// # Errors
    ///
    /// [`InitrdError::WrongType`] for file descriptors.
    pub fn read_dir(&self, dir: &Descriptor) -> Result<Vec<Descriptor>, InitrdError> {
        if dir.kind != DescriptorKind::Directory {
            return Err(InitrdError::WrongType);
        }
        (0..dir.length)
            .map(|i| self.read_descriptor(dir.position, i))
            .collect()
    }

    /// The root directory descriptor.
    #[must_use]
    pub fn root(&self) -> Descriptor {
        Descriptor {
            name: String::new(),
            kind: DescriptorKind::Directory,
            length: self.root_count,
            position: self.root,
        }
    }

    /// Resolves a `/`-separated path to a descriptor.
    ///
    /// # Errors
    ///
    /// [`InitrdError::NotFound`] when a component is missing.
    pub fn find(&self, path: &str) -> Result<Descriptor, InitrdError> {
        let mut current = self.root();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            let children = self.read_dir(&current)?;
            current = children
                .into_iter()
                .find(|d| d.name == component)
                .ok_or(InitrdError::NotFound)?;
        }
        Ok(current)
    }

    /// Reads file contents at `offset` into `buf`; returns the bytes read
    /// (clamped to the file size).
    ///
    /// # Errors
    ///
    /// [`InitrdError::WrongType`] for directory descriptors.
    pub fn read_file(
        &self,
        file: &Descriptor,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<usize, InitrdError> {
        if file.kind != DescriptorKind::File {
            return Err(InitrdError::WrongType);
        }
        if offset >= u64::from(file.length) {
            return Ok(0);
        }
        let available = (u64::from(file.length) - offset) as usize;
        let want = buf.len().min(available);
        self.data.read_at(file.position, offset, &mut buf[..want])
    }
}
