//! Ramdisk image builder.
//!
//! Produces blobs the [`Image`](crate::Image) reader accepts; used by
//! tests and by host-side packing tools. Streams are chunked into 64 KiB
//! stored blocks with CRC32 headers.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::{
    BLOCK_MAGIC, BLOCK_SIZE, BlockPosition, DESCRIPTOR_DIRECTORY, DESCRIPTOR_FILE,
    DESCRIPTOR_SIZE, FS_MAGIC, FS_VERSION, HEADER_SIZE,
};

#[derive(Default)]
struct DirNode {
    dirs: BTreeMap<String, DirNode>,
    files: BTreeMap<String, Vec<u8>>,
}

/// Builds a ramdisk image in memory.
pub struct ImageBuilder {
    architecture: u32,
    root: DirNode,
}

impl ImageBuilder {
    /// Creates a builder tagged with an architecture id.
    #[must_use]
    pub fn new(architecture: u32) -> Self {
        Self {
            architecture,
            root: DirNode::default(),
        }
    }

    /// Adds a file at a `/`-separated path, creating directories as
    /// needed. Later additions overwrite earlier ones.
    pub fn add_file(&mut self, path: &str, contents: &[u8]) {
        let mut parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        let Some(file_name) = parts.pop() else {
            return;
        };
        let mut node = &mut self.root;
        for dir in parts {
            node = node.dirs.entry(String::from(dir)).or_default();
        }
        node.files.insert(String::from(file_name), Vec::from(contents));
    }

    fn linear_to_position(linear: usize) -> BlockPosition {
        BlockPosition {
            block: (linear / BLOCK_SIZE) as u16,
            offset: (linear % BLOCK_SIZE) as u32,
        }
    }

    fn write_record(
        stream: &mut Vec<u8>,
        kind: u16,
        length: u32,
        name: &str,
        position: BlockPosition,
    ) {
        let start = stream.len();
        stream.resize(start + DESCRIPTOR_SIZE, 0);
        let record = &mut stream[start..];
        record[0..2].copy_from_slice(&kind.to_le_bytes());
        record[2..6].copy_from_slice(&length.to_le_bytes());
        let name_bytes = name.as_bytes();
        let copy = name_bytes.len().min(63);
        record[6..6 + copy].copy_from_slice(&name_bytes[..copy]);
        record[70..72].copy_from_slice(&position.block.to_le_bytes());
        record[72..76].copy_from_slice(&position.offset.to_le_bytes());
    }

    /// Chunks a stream into stored blocks with CRC headers.
    fn chunk(stream: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for piece in stream.chunks(BLOCK_SIZE) {
            out.extend_from_slice(&BLOCK_MAGIC.to_le_bytes());
            out.extend_from_slice(&(piece.len() as u32).to_le_bytes());
            out.extend_from_slice(&crc32fast::hash(piece).to_le_bytes());
            out.extend_from_slice(&0u16.to_le_bytes()); // stored
            out.extend_from_slice(&0u16.to_le_bytes()); // flags
            out.extend_from_slice(piece);
        }
        out
    }

    /// Serializes the image.
    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        // Directories in breadth-first order; children of a directory get
        // consecutive indices, recorded per parent.
        let mut dirs: Vec<&DirNode> = alloc::vec![&self.root];
        let mut children_of: Vec<Vec<usize>> = alloc::vec![Vec::new()];
        let mut next = 0;
        while next < dirs.len() {
            let current = dirs[next];
            let mut child_indices = Vec::new();
            for child in current.dirs.values() {
                child_indices.push(dirs.len());
                dirs.push(child);
                children_of.push(Vec::new());
            }
            children_of[next] = child_indices;
            next += 1;
        }

        // Each directory's child table position in the descriptor stream.
        let mut table_position = Vec::with_capacity(dirs.len());
        let mut cursor = 0;
        for dir in &dirs {
            table_position.push(cursor);
            cursor += (dir.dirs.len() + dir.files.len()) * DESCRIPTOR_SIZE;
        }

        // Data stream: concatenated file contents.
        let mut data_stream = Vec::new();
        let mut file_positions: Vec<Vec<usize>> = Vec::with_capacity(dirs.len());
        for dir in &dirs {
            let mut positions = Vec::new();
            for contents in dir.files.values() {
                positions.push(data_stream.len());
                data_stream.extend_from_slice(contents);
            }
            file_positions.push(positions);
        }

        // Descriptor stream: one child table per directory.
        let mut descriptor_stream = Vec::new();
        for (index, dir) in dirs.iter().enumerate() {
            debug_assert_eq!(descriptor_stream.len(), table_position[index]);
            for (child_slot, (name, child)) in dir.dirs.iter().enumerate() {
                let child_index = children_of[index][child_slot];
                Self::write_record(
                    &mut descriptor_stream,
                    DESCRIPTOR_DIRECTORY,
                    (child.dirs.len() + child.files.len()) as u32,
                    name,
                    Self::linear_to_position(table_position[child_index]),
                );
            }
            for (file_slot, (name, contents)) in dir.files.iter().enumerate() {
                Self::write_record(
                    &mut descriptor_stream,
                    DESCRIPTOR_FILE,
                    contents.len() as u32,
                    name,
                    Self::linear_to_position(file_positions[index][file_slot]),
                );
            }
        }

        let descriptor_blocks = Self::chunk(&descriptor_stream);
        let data_blocks = Self::chunk(&data_stream);

        let descriptor_offset = HEADER_SIZE as u32;
        let data_offset = descriptor_offset + descriptor_blocks.len() as u32;

        let mut image = Vec::with_capacity(
            HEADER_SIZE + descriptor_blocks.len() + data_blocks.len(),
        );
        image.extend_from_slice(&FS_MAGIC.to_le_bytes());
        image.extend_from_slice(&FS_VERSION.to_le_bytes());
        image.extend_from_slice(&self.architecture.to_le_bytes());
        image.extend_from_slice(&descriptor_offset.to_le_bytes());
        image.extend_from_slice(&data_offset.to_le_bytes());
        // Root descriptor position and child count.
        image.extend_from_slice(&0u16.to_le_bytes());
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(
            &((self.root.dirs.len() + self.root.files.len()) as u32).to_le_bytes(),
        );
        image.extend_from_slice(&[0u8; HEADER_SIZE - 30]);
        image.extend_from_slice(&descriptor_blocks);
        image.extend_from_slice(&data_blocks);
        image
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_image_parses() {
        let builder = ImageBuilder::new(7);
        let blob = builder.build();
        let image = crate::Image::parse(&blob).unwrap();
        assert_eq!(image.architecture, 7);
        assert_eq!(image.read_dir(&image.root()).unwrap().len(), 0);
    }

    #[test]
    fn name_truncated_to_63_bytes() {
        let mut builder = ImageBuilder::new(1);
        let long = "x".repeat(100);
        builder.add_file(&long, b"data");
        let blob = builder.build();
        let image = crate::Image::parse(&blob).unwrap();
        let children = image.read_dir(&image.root()).unwrap();
        assert_eq!(children[0].name.len(), 63);
    }
}
