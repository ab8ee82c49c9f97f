//! Atomic publication of index artifacts.
//!
//! Every artifact is written to a temp file in the destination directory,
//! fsynced, then renamed over the final name. Readers therefore see either
//! the previous file or the complete new one. A dropped [`StagedFile`]
//! removes its temp file, so a failed write leaves nothing behind.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::error::{ErrorContext, IndexError, IndexResult};

/// A file being written that becomes visible only once committed.
#[derive(Debug)]
pub struct StagedFile {
    dir: PathBuf,
    target: Option<PathBuf>,
    tmp: NamedTempFile,
}

impl StagedFile {
    /// Creates the temp file next to `target`, creating parent directories.
    pub fn create(target: &Path) -> IndexResult<Self> {
        let dir = match target.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut staged = Self::create_in(dir)?;
        staged.target = Some(target.to_path_buf());
        Ok(staged)
    }

    /// Creates a temp file in `dir` whose final name is chosen at
    /// [`commit_as`](Self::commit_as), once the contents are known.
    pub fn create_in(dir: &Path) -> IndexResult<Self> {
        std::fs::create_dir_all(dir).write_context(dir)?;
        let tmp = tempfile::Builder::new()
            .prefix(".staged-")
            .tempfile_in(dir)
            .write_context(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            target: None,
            tmp,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        self.tmp.as_file_mut()
    }

    /// Flushes to disk and renames over the target given at creation.
    pub fn commit(self) -> IndexResult<()> {
        match self.target.clone() {
            Some(target) => self.persist(target),
            None => Err(IndexError::FileWrite {
                path: self.dir.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "staged file has no target name",
                ),
            }),
        }
    }

    /// Flushes to disk and renames to `file_name` inside the staging directory.
    pub fn commit_as(self, file_name: &str) -> IndexResult<()> {
        let target = self.dir.join(file_name);
        self.persist(target)
    }

    fn persist(self, target: PathBuf) -> IndexResult<()> {
        self.tmp.as_file().sync_all().write_context(&target)?;
        self.tmp
            .persist(&target)
            .map_err(|e| IndexError::FileWrite {
                path: target.clone(),
                source: e.error,
            })?;
        Ok(())
    }
}

/// Writes `target` through a buffered writer and publishes it atomically.
pub fn write_atomically<F>(target: &Path, write: F) -> IndexResult<()>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> std::io::Result<()>,
{
    let mut staged = StagedFile::create(target)?;
    {
        let mut writer = BufWriter::new(staged.file_mut());
        write(&mut writer).write_context(target)?;
        writer.flush().write_context(target)?;
    }
    staged.commit()
}
