mod archive;
mod artifacts;

pub use archive::write_archive;
pub use artifacts::ArtifactDir;

use crate::error::MattingResult;
use crate::matting::MatteResult;

/// Destination for the refined frames of one request
pub trait MatteSink {
    /// Persist one frame
    fn write(&mut self, result: &MatteResult) -> MattingResult<()>;

    /// Number of frames written so far
    fn written(&self) -> usize;
}

/// Drain `results` into `sink`, stopping at the first failure
///
/// Frames already written stay on disk when a later frame fails.
pub fn persist<I, S>(results: I, sink: &mut S) -> MattingResult<usize>
where
    I: IntoIterator<Item = MattingResult<MatteResult>>,
    S: MatteSink + ?Sized,
{
    for result in results {
        sink.write(&result?)?;
    }
    Ok(sink.written())
}
