//! Disk image preparation for VMs.
//!
//! Each VM owns the directory `<image_dir>/<name>/`. Names are validated
//! before they are reserved and cannot contain a path separator, so two VMs
//! never share a file. Every operation is safe to
//! retry: an image that already matches what was asked for is reused.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::ImageError;
use crate::model::{DiskImage, ProvisionRequest};
use crate::qcow2::{self, Backing, GIB};

#[derive(Debug, Clone)]
pub struct ImageProvisioner {
    image_dir: PathBuf,
}

impl ImageProvisioner {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
        }
    }

    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    /// `<image_dir>/<name>/`
    pub fn vm_dir(&self, name: &str) -> PathBuf {
        self.image_dir.join(name)
    }

    /// `<image_dir>/<name>/root.qcow2`
    pub fn root_path(&self, name: &str) -> PathBuf {
        self.vm_dir(name).join("root.qcow2")
    }

    /// `<image_dir>/<name>/data<index>.qcow2`, `index` starting at 1.
    pub fn data_path(&self, name: &str, index: usize) -> PathBuf {
        self.vm_dir(name).join(format!("data{index}.qcow2"))
    }

    /// Prepare the root disk: a copy-on-write clone of `imageSourcePath` when
    /// one is given, otherwise a fresh sparse image of `diskSizeGiB`.
    pub async fn prepare_image(&self, request: &ProvisionRequest) -> Result<DiskImage, ImageError> {
        let target = self.root_path(&request.name);
        let size_gib = request.disk_size_gib;
        let source = request.image_source_path.clone();
        blocking("preparing root image", move || match source {
            Some(source) => prepare_clone(&target, &source, size_gib),
            None => prepare_fresh(&target, size_gib, "vda"),
        })
        .await
    }

    /// Prepare blank data disk number `index` (1 → `vdb`).
    pub async fn prepare_data_disk(
        &self,
        name: &str,
        index: usize,
        size_gib: u64,
    ) -> Result<DiskImage, ImageError> {
        let target = self.data_path(name, index);
        let device = data_disk_target(index);
        blocking("preparing data disk", move || {
            prepare_fresh(&target, size_gib, &device)
        })
        .await
    }

    /// Delete an image. A missing file counts as removed. The VM's
    /// directory goes with its last image.
    pub async fn remove(&self, disk: &DiskImage) -> Result<(), ImageError> {
        let path = disk.path.clone();
        let image_dir = self.image_dir.clone();
        blocking("removing image", move || {
            remove_file(&path)?;
            if let Some(parent) = path.parent()
                && parent != image_dir
            {
                remove_dir_if_empty(parent);
            }
            Ok(())
        })
        .await
    }

    /// Check that an image still exists and, for clones, that the backing
    /// source is byte-identical to what it was cloned from.
    pub async fn verify(&self, disk: &DiskImage) -> Result<(), ImageError> {
        let disk = disk.clone();
        blocking("verifying image", move || verify_disk(&disk)).await
    }
}

/// Guest device name for data disk `index`: 1 → `vdb`, 2 → `vdc`, ...
pub fn data_disk_target(index: usize) -> String {
    let letter = (b'a' + (index % 26) as u8) as char;
    format!("vd{letter}")
}

async fn blocking<T, F>(what: &'static str, f: F) -> Result<T, ImageError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, ImageError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ImageError::Io {
            context: format!("{what}: worker task failed"),
            source: std::io::Error::other(e.to_string()),
        })?
}

fn prepare_fresh(target: &Path, size_gib: u64, device: &str) -> Result<DiskImage, ImageError> {
    let virtual_size = size_gib * GIB;
    if target.exists() {
        check_existing(target, virtual_size, None)?;
        tracing::info!(path = %target.display(), "reusing existing image");
    } else {
        qcow2::create_qcow2(target, virtual_size, None)?;
    }
    Ok(DiskImage {
        path: target.to_path_buf(),
        size_gib,
        target: device.to_string(),
        backing_source: None,
        checksum: None,
    })
}

fn prepare_clone(target: &Path, source: &Path, size_gib: u64) -> Result<DiskImage, ImageError> {
    let source = std::fs::canonicalize(source).map_err(|e| ImageError::Io {
        context: format!("resolving image source {}", source.display()),
        source: e,
    })?;
    let source_str = source.to_str().ok_or_else(|| ImageError::Conflict {
        path: source.display().to_string(),
        reason: "image source path is not valid UTF-8".into(),
    })?;

    let (format, source_size) = match qcow2::read_header(&source)? {
        Some(header) => ("qcow2", header.virtual_size),
        None => {
            let len = std::fs::metadata(&source)
                .map_err(|e| ImageError::Io {
                    context: format!("reading size of {}", source.display()),
                    source: e,
                })?
                .len();
            ("raw", len)
        }
    };

    // An overlay can grow past its backing file but never shrink below it.
    let size_gib = size_gib.max(source_size.div_ceil(GIB));
    let virtual_size = size_gib * GIB;

    if target.exists() {
        check_existing(target, virtual_size, Some(source_str))?;
        tracing::info!(path = %target.display(), "reusing existing clone");
    } else {
        let backing = Backing {
            path: source_str,
            format,
        };
        qcow2::create_qcow2(target, virtual_size, Some(&backing))?;
    }

    let checksum = sha256_file(&source)?;
    Ok(DiskImage {
        path: target.to_path_buf(),
        size_gib,
        target: "vda".into(),
        backing_source: Some(source),
        checksum: Some(checksum),
    })
}

fn check_existing(
    target: &Path,
    virtual_size: u64,
    backing: Option<&str>,
) -> Result<(), ImageError> {
    let conflict = |reason: String| ImageError::Conflict {
        path: target.display().to_string(),
        reason,
    };
    let header = qcow2::read_header(target)?
        .ok_or_else(|| conflict("existing file is not a qcow2 image".into()))?;
    if header.virtual_size != virtual_size {
        return Err(conflict(format!(
            "existing image is {} bytes, expected {virtual_size}",
            header.virtual_size
        )));
    }
    if header.backing_file.as_deref() != backing {
        return Err(conflict(format!(
            "existing image is backed by {:?}, expected {:?}",
            header.backing_file, backing
        )));
    }
    Ok(())
}

fn remove_file(path: &Path) -> Result<(), ImageError> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::info!(path = %path.display(), "removed image");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ImageError::Io {
            context: format!("removing {}", path.display()),
            source: e,
        }),
    }
}

fn remove_dir_if_empty(dir: &Path) {
    match std::fs::remove_dir(dir) {
        Ok(()) => tracing::debug!(path = %dir.display(), "removed image directory"),
        Err(e) if matches!(
            e.kind(),
            std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
        ) => {}
        Err(e) => tracing::warn!(path = %dir.display(), error = %e, "failed to remove image directory"),
    }
}

fn verify_disk(disk: &DiskImage) -> Result<(), ImageError> {
    if !disk.path.exists() {
        return Err(ImageError::Conflict {
            path: disk.path.display().to_string(),
            reason: "image is missing".into(),
        });
    }
    if let (Some(source), Some(expected)) = (&disk.backing_source, &disk.checksum) {
        let actual = sha256_file(source)?;
        if &actual != expected {
            return Err(ImageError::Conflict {
                path: disk.path.display().to_string(),
                reason: format!(
                    "backing source {} changed since the clone was made",
                    source.display()
                ),
            });
        }
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, ImageError> {
    let mut file = std::fs::File::open(path).map_err(|e| ImageError::Io {
        context: format!("opening {}", path.display()),
        source: e,
    })?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let n = file.read(&mut buf).map_err(|e| ImageError::Io {
            context: format!("hashing {}", path.display()),
            source: e,
        })?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
