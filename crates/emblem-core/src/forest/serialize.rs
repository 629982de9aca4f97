//! .eft Forest Artifact Format
//!
//! One immutable file per built forest: the indexed vectors in dense
//! position order followed by every tree's node arena. The vectors region
//! sits at a fixed 64-byte offset so loaders can memory-map the file and
//! read rows zero-copy while the (small) tree section is parsed once.
//!
//! # File Structure
//!
//! ```text
//! Offset   Size       Description
//! ─────────────────────────────────────────────────────────────
//! 0x00     8          Magic: "EMFRST01"
//! 0x08     4          Version: u32 LE (currently 1)
//! 0x0C     4          D: Dimensions, u32 LE
//! 0x10     4          N: Item count, u32 LE
//! 0x14     4          T: Tree count, u32 LE
//! 0x18     8          Build seed, u64 LE
//! 0x20     8          Vectors offset, u64 LE (= 64)
//! 0x28     8          Trees offset, u64 LE
//! 0x30     16         Reserved (zero)
//! 0x40     N*D*4      Vectors, f32 LE, position order
//! ...      ...        T trees:
//!                       node_count u32, root u32, then nodes:
//!                       tag u8 (0 = split, 1 = leaf)
//!                       split: left u32, right u32, bias f32, normal D*f32
//!                       leaf:  item_count u32, items u32 each
//! ```

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use thiserror::Error;

use super::{Node, RpForest, Tree};

/// Magic bytes identifying a .eft file: "EMFRST01"
pub const MAGIC: [u8; 8] = *b"EMFRST01";

/// Fixed header size; the vectors region starts here
pub const HEADER_SIZE: usize = 64;

pub const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum ForestFileError {
    #[error("invalid magic bytes: expected EMFRST01")]
    InvalidMagic,

    #[error("unsupported forest format version {0}")]
    UnsupportedVersion(u32),

    #[error("file truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("malformed tree section: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Parsed .eft file header
#[derive(Debug, Clone, Copy)]
pub struct ForestHeader {
    pub version: u32,
    pub dimensions: u32,
    pub count: u32,
    pub tree_count: u32,
    pub seed: u64,
    pub vectors_offset: u64,
    pub trees_offset: u64,
}

impl ForestHeader {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ForestFileError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ForestFileError::Truncated {
                expected: HEADER_SIZE,
                actual: bytes.len(),
            });
        }
        if bytes[0..8] != MAGIC {
            return Err(ForestFileError::InvalidMagic);
        }

        let version = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if version != FORMAT_VERSION {
            return Err(ForestFileError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            dimensions: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            count: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            tree_count: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
            seed: u64::from_le_bytes(bytes[24..32].try_into().unwrap()),
            vectors_offset: u64::from_le_bytes(bytes[32..40].try_into().unwrap()),
            trees_offset: u64::from_le_bytes(bytes[40..48].try_into().unwrap()),
        })
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        buf[12..16].copy_from_slice(&self.dimensions.to_le_bytes());
        buf[16..20].copy_from_slice(&self.count.to_le_bytes());
        buf[20..24].copy_from_slice(&self.tree_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.seed.to_le_bytes());
        buf[32..40].copy_from_slice(&self.vectors_offset.to_le_bytes());
        buf[40..48].copy_from_slice(&self.trees_offset.to_le_bytes());
        buf
    }

    /// Byte range of the dense vectors region
    pub fn vectors_range(&self) -> std::ops::Range<usize> {
        let start = self.vectors_offset as usize;
        start..start + self.count as usize * self.dimensions as usize * 4
    }
}

/// Write a forest plus its dense vectors to one .eft file and sync it
pub fn write_forest<P: AsRef<Path>>(
    path: P,
    forest: &RpForest,
    dense: &[f32],
) -> Result<(), ForestFileError> {
    let vectors_bytes = dense.len() * 4;
    let header = ForestHeader {
        version: FORMAT_VERSION,
        dimensions: forest.dim() as u32,
        count: forest.len() as u32,
        tree_count: forest.tree_count() as u32,
        seed: forest.seed(),
        vectors_offset: HEADER_SIZE as u64,
        trees_offset: (HEADER_SIZE + vectors_bytes) as u64,
    };

    let file = File::create(path)?;
    let mut w = BufWriter::new(file);
    w.write_all(&header.to_bytes())?;

    for &v in dense {
        w.write_all(&v.to_le_bytes())?;
    }

    for tree in forest.trees() {
        w.write_all(&(tree.nodes.len() as u32).to_le_bytes())?;
        w.write_all(&tree.root.to_le_bytes())?;
        for node in &tree.nodes {
            match node {
                Node::Split {
                    left,
                    right,
                    bias,
                    normal,
                } => {
                    w.write_all(&[0u8])?;
                    w.write_all(&left.to_le_bytes())?;
                    w.write_all(&right.to_le_bytes())?;
                    w.write_all(&bias.to_le_bytes())?;
                    for &c in normal {
                        w.write_all(&c.to_le_bytes())?;
                    }
                }
                Node::Leaf { items } => {
                    w.write_all(&[1u8])?;
                    w.write_all(&(items.len() as u32).to_le_bytes())?;
                    for &item in items {
                        w.write_all(&item.to_le_bytes())?;
                    }
                }
            }
        }
    }

    w.flush()?;
    w.get_ref().sync_all()?;
    Ok(())
}

/// Parse header and trees from the raw bytes of a .eft file.
///
/// The caller keeps the bytes (typically a memory map) alive and reads
/// vector rows straight out of `header.vectors_range()`.
pub fn read_forest(bytes: &[u8]) -> Result<(ForestHeader, RpForest), ForestFileError> {
    let header = ForestHeader::from_bytes(bytes)?;

    let vectors_end = header.vectors_range().end;
    if bytes.len() < vectors_end {
        return Err(ForestFileError::Truncated {
            expected: vectors_end,
            actual: bytes.len(),
        });
    }

    let dim = header.dimensions as usize;
    let mut cursor = Cursor {
        bytes,
        pos: header.trees_offset as usize,
    };

    let mut trees = Vec::with_capacity(header.tree_count as usize);
    for _ in 0..header.tree_count {
        let node_count = cursor.read_u32()? as usize;
        let root = cursor.read_u32()?;
        if root as usize >= node_count {
            return Err(ForestFileError::Malformed(format!(
                "root {root} out of range for {node_count} nodes"
            )));
        }

        let mut nodes = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            match cursor.read_u8()? {
                0 => {
                    let left = cursor.read_u32()?;
                    let right = cursor.read_u32()?;
                    let bias = cursor.read_f32()?;
                    let mut normal = Vec::with_capacity(dim);
                    for _ in 0..dim {
                        normal.push(cursor.read_f32()?);
                    }
                    if left as usize >= node_count || right as usize >= node_count {
                        return Err(ForestFileError::Malformed(format!(
                            "split child {left}/{right} out of range"
                        )));
                    }
                    nodes.push(Node::Split {
                        left,
                        right,
                        bias,
                        normal,
                    });
                }
                1 => {
                    let item_count = cursor.read_u32()? as usize;
                    let mut items = Vec::with_capacity(item_count);
                    for _ in 0..item_count {
                        let item = cursor.read_u32()?;
                        if item >= header.count {
                            return Err(ForestFileError::Malformed(format!(
                                "leaf item {item} out of range for {} items",
                                header.count
                            )));
                        }
                        items.push(item);
                    }
                    nodes.push(Node::Leaf { items });
                }
                tag => {
                    return Err(ForestFileError::Malformed(format!("unknown node tag {tag}")));
                }
            }
        }
        trees.push(Tree { nodes, root });
    }

    let forest = RpForest::from_parts(
        dim,
        header.count as usize,
        header.seed,
        trees,
    );
    Ok((header, forest))
}

/// Bounds-checked little-endian reader over a byte slice
struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], ForestFileError> {
        if self.pos + n > self.bytes.len() {
            return Err(ForestFileError::Truncated {
                expected: self.pos + n,
                actual: self.bytes.len(),
            });
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_u8(&mut self) -> Result<u8, ForestFileError> {
        Ok(self.take(1)?[0])
    }

    fn read_u32(&mut self) -> Result<u32, ForestFileError> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn read_f32(&mut self) -> Result<f32, ForestFileError> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forest::ForestParams;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::AtomicBool;
    use tempfile::tempdir;

    fn sample_forest(dim: usize, count: usize) -> (RpForest, Vec<f32>) {
        let mut rng = StdRng::seed_from_u64(21);
        let dense: Vec<f32> = (0..count * dim).map(|_| rng.gen::<f32>() * 4.0).collect();
        let forest = RpForest::build(
            dim,
            &dense,
            ForestParams::new(3, 77),
            &AtomicBool::new(false),
        )
        .unwrap();
        (forest, dense)
    }

    #[test]
    fn test_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.eft");
        let (forest, dense) = sample_forest(6, 64);

        write_forest(&path, &forest, &dense).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        let (header, loaded) = read_forest(&bytes).unwrap();

        assert_eq!(header.dimensions, 6);
        assert_eq!(header.count, 64);
        assert_eq!(header.tree_count, 3);
        assert_eq!(header.seed, 77);
        assert_eq!(loaded.trees(), forest.trees());

        // Vectors region reproduces the dense input bit-for-bit.
        let region = &bytes[header.vectors_range()];
        let floats: Vec<f32> = region
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        assert_eq!(floats, dense);

        // And traversal over the reloaded trees is identical.
        let query = vec![1.0; 6];
        assert_eq!(
            loaded.candidates(&query, 16),
            forest.candidates(&query, 16)
        );
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[0..8].copy_from_slice(b"NOTAFRST");
        assert!(matches!(
            read_forest(&bytes),
            Err(ForestFileError::InvalidMagic)
        ));
    }

    #[test]
    fn test_truncated_trees_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.eft");
        let (forest, dense) = sample_forest(4, 32);
        write_forest(&path, &forest, &dense).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        let cut = &bytes[..bytes.len() - 16];
        assert!(matches!(
            read_forest(cut),
            Err(ForestFileError::Truncated { .. })
        ));
    }

    #[test]
    fn test_unsupported_version() {
        let (forest, dense) = sample_forest(4, 8);
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.eft");
        write_forest(&path, &forest, &dense).unwrap();

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8..12].copy_from_slice(&9u32.to_le_bytes());
        assert!(matches!(
            read_forest(&bytes),
            Err(ForestFileError::UnsupportedVersion(9))
        ));
    }
}
