use crate::error::{MattingError, MattingResult};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// SHA-256 hex digest over the contents of `paths`, in order
pub fn content_hash<P: AsRef<Path>>(paths: &[P]) -> MattingResult<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    for path in paths {
        let path = path.as_ref();
        let mut file = std::fs::File::open(path).map_err(|e| MattingError::io(path, e))?;
        loop {
            let n = file.read(&mut buf).map_err(|e| MattingError::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(format!("{:x}", hasher.finalize()))
}
