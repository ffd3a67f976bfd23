use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use flate2::read::GzDecoder;
use tar::Archive;

/// Accept only relative, "normal" components; strip any leading "./".
/// Absolute paths, prefixes and `..` traversal are rejected.
pub fn sanitize_tar_rel_path(p: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => continue,
            Component::Normal(s) => out.push(s),
            _ => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Gzip files start with 1F 8B.
pub fn looks_like_gzip(path: &Path) -> Result<bool, String> {
    let mut f = File::open(path).map_err(|e| e.to_string())?;
    let mut header = [0u8; 2];
    let n = f.read(&mut header).map_err(|e| e.to_string())?;
    Ok(n == 2 && header == [0x1f, 0x8b])
}

/// Extracts a `.tar.gz` into `dest_dir`, reporting `(entries_done, detail)`.
///
/// Entries are unpacked one by one so unsafe paths (Tar Slip) can be skipped.
/// Stops with `Err("cancelled")` once `cancel` is raised.
pub fn extract_tar_gz_with_progress<F>(
    archive_path: &Path,
    dest_dir: &Path,
    cancel: &AtomicBool,
    mut on_progress: F,
) -> Result<u64, String>
where
    F: FnMut(u64, Option<String>),
{
    let f = File::open(archive_path).map_err(|e| e.to_string())?;
    let mut archive = Archive::new(GzDecoder::new(f));
    std::fs::create_dir_all(dest_dir).map_err(|e| e.to_string())?;

    let mut extracted: u64 = 0;
    for entry in archive.entries().map_err(|e| e.to_string())? {
        if cancel.load(Ordering::Relaxed) {
            return Err("cancelled".to_string());
        }
        let mut entry = entry.map_err(|e| e.to_string())?;
        let raw_path = entry.path().map_err(|e| e.to_string())?.to_path_buf();
        let Some(rel) = sanitize_tar_rel_path(&raw_path) else {
            log::warn!("Skipped unsafe tar path: {}", raw_path.to_string_lossy());
            continue;
        };

        let out_path = dest_dir.join(&rel);
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        entry.unpack(&out_path).map_err(|e| e.to_string())?;

        extracted = extracted.saturating_add(1);
        on_progress(extracted, Some(rel.to_string_lossy().to_string()));
    }

    Ok(extracted)
}

/// Lists the top-level directories of an extracted tree, ignoring files.
pub fn top_level_dirs(root: &Path) -> Vec<PathBuf> {
    let Ok(rd) = std::fs::read_dir(root) else {
        return vec![];
    };
    let mut out: Vec<PathBuf> = rd
        .flatten()
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect();
    out.sort();
    out
}
