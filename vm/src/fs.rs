use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[derive(Error, Debug)]
pub enum FsError {
    #[error("Cannot create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Directory '{path}' already exists")]
    DirExists { path: PathBuf },

    #[error("Cannot remove directory '{path}': {source}")]
    RemoveDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot create file '{path}': {source}")]
    CreateFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot open file '{path}': {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot remove file '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Cannot copy into '{path}': {source}")]
    CopyInto {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub async fn create_dir_all<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::create_dir_all(p)
        .await
        .map_err(|source| FsError::CreateDir {
            path: p.to_path_buf(),
            source,
        })
}

/// Creates the leaf directory, failing with [`FsError::DirExists`] if it is
/// already there. The existence check and creation are one atomic operation.
pub async fn create_new_dir<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::create_dir(p).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::AlreadyExists {
            FsError::DirExists {
                path: p.to_path_buf(),
            }
        } else {
            FsError::CreateDir {
                path: p.to_path_buf(),
                source,
            }
        }
    })
}

pub async fn remove_dir_all<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::remove_dir_all(p)
        .await
        .map_err(|source| FsError::RemoveDir {
            path: p.to_path_buf(),
            source,
        })
}

/// Creates the file if absent, leaving existing contents untouched.
pub async fn ensure_file<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })?;
    Ok(())
}

pub async fn open_ro<P: AsRef<Path>>(path: P) -> Result<std::fs::File, FsError> {
    let p = path.as_ref();
    let file = fs::File::open(p).await.map_err(|source| FsError::OpenFile {
        path: p.to_path_buf(),
        source,
    })?;
    Ok(file.into_std().await)
}

pub async fn open_rw<P: AsRef<Path>>(path: P) -> Result<std::fs::File, FsError> {
    let p = path.as_ref();
    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(p)
        .await
        .map_err(|source| FsError::OpenFile {
            path: p.to_path_buf(),
            source,
        })?;
    Ok(file.into_std().await)
}

pub async fn remove_file<P: AsRef<Path>>(path: P) -> Result<(), FsError> {
    let p = path.as_ref();
    fs::remove_file(p)
        .await
        .map_err(|source| FsError::RemoveFile {
            path: p.to_path_buf(),
            source,
        })
}

pub async fn read<P: AsRef<Path>>(path: P) -> Result<Vec<u8>, FsError> {
    let p = path.as_ref();
    fs::read(p).await.map_err(|source| FsError::ReadFile {
        path: p.to_path_buf(),
        source,
    })
}

pub async fn write<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<(), FsError> {
    let p = path.as_ref();
    let mut file = fs::File::create(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })?;
    file.write_all(data)
        .await
        .map_err(|source| FsError::WriteFile {
            path: p.to_path_buf(),
            source,
        })?;
    file.sync_all().await.map_err(|source| FsError::WriteFile {
        path: p.to_path_buf(),
        source,
    })
}

/// Byte-copies `source` (from its current position) into a fresh file at
/// `dest`.
pub async fn copy_into<P: AsRef<Path>>(source: std::fs::File, dest: P) -> Result<(), FsError> {
    let p = dest.as_ref();
    let mut reader = fs::File::from_std(source);
    let mut writer = fs::File::create(p)
        .await
        .map_err(|source| FsError::CreateFile {
            path: p.to_path_buf(),
            source,
        })?;
    tokio::io::copy(&mut reader, &mut writer)
        .await
        .map_err(|source| FsError::CopyInto {
            path: p.to_path_buf(),
            source,
        })?;
    writer.sync_all().await.map_err(|source| FsError::CopyInto {
        path: p.to_path_buf(),
        source,
    })
}

/// Rollback scope for a freshly created VM directory: unless [`commit`] is
/// called, dropping the scope removes the directory and everything created
/// under it, leaving no orphaned state.
///
/// [`commit`]: DirScope::commit
pub struct DirScope {
    path: Option<PathBuf>,
}

impl DirScope {
    pub fn new(path: PathBuf) -> Self {
        Self { path: Some(path) }
    }

    pub fn commit(mut self) {
        self.path = None;
    }
}

impl Drop for DirScope {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            if let Err(err) = std::fs::remove_dir_all(&path) {
                tracing::warn!(path = %path.display(), error = %err, "rollback cleanup failed");
            }
        }
    }
}
