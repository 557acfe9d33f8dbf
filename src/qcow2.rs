//! Minimal QCOW2 v3 image writer and header reader.
//!
//! # Background
//!
//! QCOW2 is the native disk image format for QEMU/KVM.  A "20 GiB" QCOW2
//! file with no data written only occupies a few hundred KiB on disk; space is
//! allocated as the guest writes.  A QCOW2 image may also name a *backing
//! file*: reads of clusters the image has not written fall through to the
//! backing file, which is how a VM's root disk is cloned from a shared base
//! image without copying it.
//!
//! # Scope
//!
//! This module writes **empty** images, optionally with a backing file, and
//! reads back the handful of header fields the image provisioner needs to
//! recognise an image it wrote earlier.  No encryption, compression,
//! snapshots or data clusters.
//!
//! # Layout
//!
//! ```text
//! ┌───────────────┬────────────────────────────────────────────────────┐
//! │  Cluster      │ Contents                                           │
//! ├───────────────┼────────────────────────────────────────────────────┤
//! │  0            │ Header (104 bytes) + extensions + backing filename │
//! │  1 ..= n      │ L1 table (all zeros, n = ceil(l1 bytes / cluster)) │
//! │  n + 1        │ Refcount table (one entry → cluster n + 2)         │
//! │  n + 2        │ Refcount block (marks clusters 0 ..= n + 2 used)   │
//! └───────────────┴────────────────────────────────────────────────────┘
//! ```
//!
//! Header extensions are `(type: u32, length: u32, data, pad to 8)` records
//! ended by a zero type.  We emit one, the backing-format extension, so QEMU
//! never has to probe the backing file's format.
//!
//! # References
//!
//! - QEMU QCOW2 spec: <https://github.com/qemu/qemu/blob/master/docs/interop/qcow2.txt>

use std::io::{Read, Write};
use std::path::Path;

use crate::error::ImageError;

/// 64 KiB clusters, the `qemu-img create` default.
const CLUSTER_BITS: u32 = 16;
const CLUSTER_SIZE: usize = 1 << CLUSTER_BITS;

/// ASCII `QFI` followed by `0xFB`.
const QCOW2_MAGIC: u32 = 0x514649FB;
const QCOW2_VERSION: u32 = 3;

/// Fixed v3 header length.
const HEADER_LENGTH: usize = 104;
/// 16-bit refcounts.
const REFCOUNT_ORDER: u32 = 4;

const EXT_END: u32 = 0;
const EXT_BACKING_FORMAT: u32 = 0xE279_2ACA;

pub const GIB: u64 = 1024 * 1024 * 1024;

/// The backing file an image reads through to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backing<'a> {
    /// Absolute path, stored verbatim in the header.
    pub path: &'a str,
    /// `qcow2` or `raw`.
    pub format: &'a str,
}

/// The header fields we read back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Qcow2Header {
    pub version: u32,
    pub virtual_size: u64,
    pub backing_file: Option<String>,
    pub backing_format: Option<String>,
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> ImageError {
    move |source| ImageError::Io { context, source }
}

/// Write an empty QCOW2 image of `virtual_size` bytes at `path`.
///
/// The image is written to a sibling temp file and renamed into place, so
/// `path` either holds a complete image or nothing.
pub fn create_qcow2(
    path: &Path,
    virtual_size: u64,
    backing: Option<&Backing<'_>>,
) -> Result<(), ImageError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(io_err(format!("creating directory {}", parent.display())))?;
    }

    let image = build_qcow2(virtual_size, backing)?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);

    let mut file = std::fs::File::create(&tmp)
        .map_err(io_err(format!("creating qcow2 image {}", tmp.display())))?;
    file.write_all(&image)
        .map_err(io_err(format!("writing qcow2 image {}", tmp.display())))?;
    file.sync_all()
        .map_err(io_err(format!("syncing qcow2 image {}", tmp.display())))?;
    std::fs::rename(&tmp, path)
        .map_err(io_err(format!("moving qcow2 image into {}", path.display())))?;

    tracing::info!(
        path = %path.display(),
        virtual_size,
        backing = backing.map(|b| b.path),
        "created qcow2 image"
    );
    Ok(())
}

/// Whether `path` starts with the QCOW2 magic.
pub fn is_qcow2(path: &Path) -> Result<bool, ImageError> {
    let mut file =
        std::fs::File::open(path).map_err(io_err(format!("opening {}", path.display())))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(u32::from_be_bytes(magic) == QCOW2_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(ImageError::Io {
            context: format!("reading {}", path.display()),
            source: e,
        }),
    }
}

/// Read the header of the QCOW2 image at `path`.
///
/// Returns `None` when the file is not a QCOW2 image.
pub fn read_header(path: &Path) -> Result<Option<Qcow2Header>, ImageError> {
    let file =
        std::fs::File::open(path).map_err(io_err(format!("opening {}", path.display())))?;
    let mut buf = Vec::with_capacity(CLUSTER_SIZE);
    file.take(CLUSTER_SIZE as u64)
        .read_to_end(&mut buf)
        .map_err(io_err(format!("reading {}", path.display())))?;
    Ok(parse_header(&buf))
}

fn parse_header(buf: &[u8]) -> Option<Qcow2Header> {
    if buf.len() < 72 || read_be32(buf, 0)? != QCOW2_MAGIC {
        return None;
    }
    let version = read_be32(buf, 4)?;
    let backing_offset = read_be64(buf, 8)? as usize;
    let backing_len = read_be32(buf, 16)? as usize;
    let virtual_size = read_be64(buf, 24)?;

    let backing_file = if backing_offset != 0 && backing_len != 0 {
        let bytes = buf.get(backing_offset..backing_offset + backing_len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    } else {
        None
    };

    let mut backing_format = None;
    if version >= 3 {
        let mut pos = read_be32(buf, 100)? as usize;
        loop {
            let ext_type = read_be32(buf, pos)?;
            let ext_len = read_be32(buf, pos + 4)? as usize;
            if ext_type == EXT_END {
                break;
            }
            if ext_type == EXT_BACKING_FORMAT {
                let data = buf.get(pos + 8..pos + 8 + ext_len)?;
                backing_format = Some(String::from_utf8_lossy(data).into_owned());
            }
            pos += 8 + ext_len.next_multiple_of(8);
        }
    }

    Some(Qcow2Header {
        version,
        virtual_size,
        backing_file,
        backing_format,
    })
}

/// Build a complete empty QCOW2 v3 image as a byte vector.
fn build_qcow2(virtual_size: u64, backing: Option<&Backing<'_>>) -> Result<Vec<u8>, ImageError> {
    let l1_entries = l1_table_entries(virtual_size);
    let l1_clusters = (l1_entries as usize * 8).div_ceil(CLUSTER_SIZE).max(1);
    let refcount_table_cluster = 1 + l1_clusters;
    let refcount_block_cluster = refcount_table_cluster + 1;
    let total_clusters = refcount_block_cluster + 1;

    // One refcount block holds CLUSTER_SIZE / 2 sixteen-bit entries.
    if total_clusters > CLUSTER_SIZE / 2 {
        return Err(ImageError::Conflict {
            path: String::new(),
            reason: format!("virtual size {virtual_size} is too large for a single refcount block"),
        });
    }

    let mut image = vec![0u8; CLUSTER_SIZE * total_clusters];

    // ── Cluster 0: header ───────────────────────────────────────────
    //
    //   Offset  Size  Field
    //     0       4   Magic
    //     4       4   Version (3)
    //     8       8   Backing file name offset (0 = none)
    //    16       4   Backing file name length
    //    20       4   Cluster bits
    //    24       8   Virtual size in bytes
    //    32       4   Encryption method (0)
    //    36       4   L1 table entry count
    //    40       8   L1 table offset
    //    48       8   Refcount table offset
    //    56       4   Refcount table clusters
    //    60       4   Number of snapshots (0)
    //    64       8   Snapshots offset (0)
    //    72       8   Incompatible features (0)
    //    80       8   Compatible features (0)
    //    88       8   Autoclear features (0)
    //    96       4   Refcount order
    //   100       4   Header length

    write_be32(&mut image, 0, QCOW2_MAGIC);
    write_be32(&mut image, 4, QCOW2_VERSION);
    write_be32(&mut image, 20, CLUSTER_BITS);
    write_be64(&mut image, 24, virtual_size);
    write_be32(&mut image, 36, l1_entries);
    write_be64(&mut image, 40, CLUSTER_SIZE as u64);
    write_be64(&mut image, 48, (refcount_table_cluster * CLUSTER_SIZE) as u64);
    write_be32(&mut image, 56, 1);
    write_be32(&mut image, 96, REFCOUNT_ORDER);
    write_be32(&mut image, 100, HEADER_LENGTH as u32);

    let mut pos = HEADER_LENGTH;
    if let Some(backing) = backing {
        let format = backing.format.as_bytes();
        let name = backing.path.as_bytes();
        let needed = pos + 8 + format.len().next_multiple_of(8) + 8 + name.len();
        if needed > CLUSTER_SIZE {
            return Err(ImageError::Conflict {
                path: backing.path.to_string(),
                reason: "backing file path does not fit in the image header".into(),
            });
        }

        write_be32(&mut image, pos, EXT_BACKING_FORMAT);
        write_be32(&mut image, pos + 4, format.len() as u32);
        image[pos + 8..pos + 8 + format.len()].copy_from_slice(format);
        pos += 8 + format.len().next_multiple_of(8);

        // end-of-extensions marker is already zero
        pos += 8;

        image[pos..pos + name.len()].copy_from_slice(name);
        write_be64(&mut image, 8, pos as u64);
        write_be32(&mut image, 16, name.len() as u32);
    }

    // ── L1 table: all zeros, nothing allocated ──────────────────────

    // ── Refcount table: one entry pointing at the refcount block ────
    write_be64(
        &mut image,
        refcount_table_cluster * CLUSTER_SIZE,
        (refcount_block_cluster * CLUSTER_SIZE) as u64,
    );

    // ── Refcount block: every metadata cluster has refcount 1 ───────
    let rb_start = refcount_block_cluster * CLUSTER_SIZE;
    for i in 0..total_clusters {
        write_be16(&mut image, rb_start + i * 2, 1);
    }

    Ok(image)
}

/// Number of L1 entries needed for `virtual_size`.
///
/// With 64 KiB clusters an L2 table has 8192 entries, so one L1 entry covers
/// 8192 × 64 KiB = 512 MiB.
fn l1_table_entries(virtual_size: u64) -> u32 {
    let l2_entries = CLUSTER_SIZE as u64 / 8;
    let bytes_per_l1 = l2_entries * CLUSTER_SIZE as u64;
    virtual_size.div_ceil(bytes_per_l1) as u32
}

// ── big-endian helpers ──────────────────────────────────────────────

fn write_be16(buf: &mut [u8], offset: usize, val: u16) {
    buf[offset..offset + 2].copy_from_slice(&val.to_be_bytes());
}

fn write_be32(buf: &mut [u8], offset: usize, val: u32) {
    buf[offset..offset + 4].copy_from_slice(&val.to_be_bytes());
}

fn write_be64(buf: &mut [u8], offset: usize, val: u64) {
    buf[offset..offset + 8].copy_from_slice(&val.to_be_bytes());
}

fn read_be32(buf: &[u8], offset: usize) -> Option<u32> {
    Some(u32::from_be_bytes(buf.get(offset..offset + 4)?.try_into().ok()?))
}

fn read_be64(buf: &[u8], offset: usize) -> Option<u64> {
    Some(u64::from_be_bytes(buf.get(offset..offset + 8)?.try_into().ok()?))
}
