//! Memory-mapped token storage
//!
//! A split is a flat file of 16-bit token ids in little-endian order, no
//! header: `<data_dir>/train.bin` and `<data_dir>/val.bin`. Files are mapped
//! read-only and viewed as `&[u16]` without copying.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use memmap2::{Mmap, MmapOptions};

use crate::error::{MeshError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

impl Split {
    pub fn file_name(self) -> &'static str {
        match self {
            Split::Train => "train.bin",
            Split::Val => "val.bin",
        }
    }

    pub fn path(self, data_dir: &Path) -> PathBuf {
        data_dir.join(self.file_name())
    }
}

pub struct TokenFile {
    mmap: Mmap,
    path: PathBuf,
}

impl TokenFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len == 0 || len % 2 != 0 {
            return Err(MeshError::Config(format!(
                "{} is not a u16 token file ({} bytes)",
                path.display(),
                len
            )));
        }
        // Read-only mapping; the file is not expected to change during training.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        tracing::debug!("mapped {} tokens from {}", len / 2, path.display());
        Ok(Self {
            mmap,
            path: path.to_path_buf(),
        })
    }

    pub fn open_split(data_dir: &Path, split: Split) -> Result<Self> {
        Self::open(&split.path(data_dir))
    }

    /// Zero-copy view of the tokens.
    pub fn tokens(&self) -> &[u16] {
        // Mappings are page aligned and the length is even.
        bytemuck::cast_slice(&self.mmap[..])
    }

    pub fn len(&self) -> usize {
        self.mmap.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write a token file readable by [`TokenFile::open`].
pub fn write_tokens(path: &Path, tokens: &[u16]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    if cfg!(target_endian = "little") {
        writer.write_all(bytemuck::cast_slice(tokens))?;
    } else {
        for token in tokens {
            writer.write_all(&token.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}
