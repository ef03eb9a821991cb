use std::fs;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::image::{Image, is_image_name};
use crate::package::is_regular_file;

/// An image present in both snapshots whose new content needs a patch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaPair {
    pub old: Image,
    pub new: Image,
}

/// Outcome of comparing two firmware snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    pub deltas: Vec<DeltaPair>,
    /// ota-type images present in both snapshots; always shipped whole.
    pub full_copies: Vec<Image>,
    pub new_partitions: Vec<Image>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty() && self.full_copies.is_empty() && self.new_partitions.is_empty()
    }
}

/// Regular files (or symlinks to one) directly inside `dir`, sorted by file name.
pub fn list_files(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(Error::config(format!(
            "firmware directory does not exist: {}",
            dir.display()
        )));
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry?;
        if is_regular_file(&entry) {
            out.push(entry.into_path());
        }
    }
    Ok(out)
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|s| s.to_str()).unwrap_or_default()
}

/// Images of a single snapshot, for a full package.
pub fn scan_full(dir: &Path) -> Result<Vec<Image>> {
    let mut out = Vec::new();
    for path in list_files(dir)? {
        if !is_image_name(file_name(&path)) {
            debug!("skip {}", path.display());
            continue;
        }
        out.push(Image::load(&path)?);
    }
    if out.is_empty() {
        return Err(Error::config(format!(
            "no vela_*.bin or vela_*.elf images in {}",
            dir.display()
        )));
    }
    Ok(out)
}

/// Compares the snapshot in `old_dir` against `new_dir`.
pub fn classify_dirs(old_dir: &Path, new_dir: &Path, include_new: bool) -> Result<Classification> {
    let old_files = list_files(old_dir)?;
    let new_files = list_files(new_dir)?;
    if old_files.is_empty() || new_files.is_empty() {
        return Err(Error::config(format!(
            "no file in {}",
            if old_files.is_empty() {
                old_dir.display()
            } else {
                new_dir.display()
            }
        )));
    }

    let load = |paths: &[PathBuf]| -> Result<Vec<Image>> {
        paths
            .iter()
            .filter(|p| is_image_name(file_name(p)))
            .map(|p| Image::load(p))
            .collect()
    };
    let old = load(&old_files)?;
    let new = load(&new_files)?;
    classify(&old, &new, include_new, same_content)
}

/// Pairs old and new images by exact file name.
///
/// Every old/new pair is visited, so each equal-name pair is considered
/// exactly once regardless of listing order.
pub fn classify<F>(
    old: &[Image],
    new: &[Image],
    include_new: bool,
    mut same: F,
) -> Result<Classification>
where
    F: FnMut(&Image, &Image) -> Result<bool>,
{
    let mut old = old.to_vec();
    let mut new = new.to_vec();
    old.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    new.sort_by(|a, b| a.file_name.cmp(&b.file_name));

    let mut out = Classification::default();
    for o in &old {
        for n in &new {
            if o.file_name != n.file_name {
                continue;
            }
            if n.is_ota() {
                debug!("{} is ota-type, shipping whole", n.file_name);
                out.full_copies.push(n.clone());
            } else if !same(o, n)? {
                out.deltas.push(DeltaPair {
                    old: o.clone(),
                    new: n.clone(),
                });
            } else {
                debug!("{} unchanged", n.file_name);
            }
        }
    }

    if include_new {
        for n in &new {
            if old.iter().any(|o| o.file_name == n.file_name) {
                continue;
            }
            if out.new_partitions.iter().any(|p| p.file_name == n.file_name) {
                continue;
            }
            debug!("{} is a new partition", n.file_name);
            out.new_partitions.push(n.clone());
        }
    }
    Ok(out)
}

/// Byte-for-byte comparison of two image files.
pub fn same_content(a: &Image, b: &Image) -> Result<bool> {
    if a.size != b.size {
        return Ok(false);
    }
    let open = |p: &Path| {
        fs::File::open(p)
            .map(BufReader::new)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", p.display())))
    };
    let mut ra = open(&a.path)?;
    let mut rb = open(&b.path)?;
    let mut buf_a = vec![0u8; 64 * 1024];
    let mut buf_b = vec![0u8; 64 * 1024];
    loop {
        let n = ra.read(&mut buf_a)?;
        if n == 0 {
            // Sizes matched, so b is exhausted too.
            return Ok(true);
        }
        rb.read_exact(&mut buf_b[..n])?;
        if buf_a[..n] != buf_b[..n] {
            return Ok(false);
        }
    }
}
