//! Crash-safe whole-file writes.

use std::io::Write;
use std::path::Path;

/// Replace `path` with `data` via write-temp then rename.
///
/// The temp file lives in the target's directory so the rename stays on one
/// filesystem. A crash at any point leaves either the old file or the new one,
/// never a partial write. Unpersisted temp files are removed on drop.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
  let parent = match path.parent() {
    Some(p) if !p.as_os_str().is_empty() => p,
    _ => Path::new("."),
  };
  std::fs::create_dir_all(parent)?;

  let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
  tmp.write_all(data)?;
  tmp.as_file().sync_all()?;
  tmp.persist(path).map_err(|e| e.error)?;

  Ok(())
}
