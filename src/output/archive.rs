use crate::error::{MattingError, MattingResult};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

/// Compress every file of `dir` into a flat zip archive at `archive`
///
/// Entries keep their file names and are added in name order. Returns the
/// number of entries.
pub fn write_archive(dir: &Path, archive: &Path) -> MattingResult<usize> {
    let _span = tracing::debug_span!("write_archive").entered();

    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(|e| MattingError::io(dir, e))? {
        let path = entry.map_err(|e| MattingError::io(dir, e))?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();

    let zip_err = |e: zip::result::ZipError| {
        MattingError::unexpected(format!("failed to write archive {}: {e}", archive.display()))
    };

    let file = File::create(archive).map_err(|e| MattingError::io(archive, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in &files {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let bytes = std::fs::read(path).map_err(|e| MattingError::io(path, e))?;
        writer.start_file(name, options).map_err(zip_err)?;
        writer.write_all(&bytes).map_err(|e| MattingError::io(archive, e))?;
    }
    writer.finish().map_err(zip_err)?;

    tracing::debug!("Archived {} files into {}", files.len(), archive.display());
    Ok(files.len())
}
