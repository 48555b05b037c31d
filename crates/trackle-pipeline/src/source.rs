//! Frame sources: where the pipeline gets its images.
//!
//! Video decoding is a collaborator concern; the trait below is the
//! whole contract. An image-sequence directory source and an in-memory
//! source ship here so batch runs and tests work without one.

use std::path::{Path, PathBuf};

use image::GrayImage;

/// Errors raised while producing frames.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The sequence location could not be read.
    #[error("failed to read frame source {path}: {source}")]
    Io {
        /// Source directory or file.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// A frame file exists but does not decode.
    #[error("failed to decode frame {path}: {source}")]
    Decode {
        /// Frame file path.
        path: PathBuf,
        /// Underlying decode failure.
        #[source]
        source: image::ImageError,
    },

    /// The requested frame index is beyond the sequence.
    #[error("frame {index} requested from a {len}-frame sequence")]
    OutOfRange {
        /// Requested index.
        index: u64,
        /// Sequence length.
        len: u64,
    },
}

/// A fixed-length sequence of grayscale frames.
pub trait FrameSource {
    /// Number of frames in the sequence.
    fn len(&self) -> u64;

    /// Whether the sequence has no frames.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Produce one frame.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] for out-of-range indices or frames that
    /// cannot be produced.
    fn frame(&self, index: u64) -> Result<GrayImage, SourceError>;
}

/// Frame file extensions recognised by [`ImageSequence`].
const FRAME_EXTENSIONS: [&str; 6] = ["png", "jpg", "jpeg", "bmp", "tif", "tiff"];

/// A directory of image files, ordered by file name.
pub struct ImageSequence {
    files: Vec<PathBuf>,
}

impl ImageSequence {
    /// Scan a directory for frame files.
    ///
    /// Files are ordered lexicographically by name — the usual layout of
    /// an exported clip (`frame_0001.png`, …). Unrecognised extensions
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Io`] when the directory cannot be listed.
    pub fn open(dir: &Path) -> Result<Self, SourceError> {
        let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let recognised = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| {
                    FRAME_EXTENSIONS
                        .iter()
                        .any(|known| known.eq_ignore_ascii_case(ext))
                });
            if recognised {
                files.push(path);
            }
        }
        files.sort();
        Ok(Self { files })
    }

    /// The ordered frame files.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }
}

impl FrameSource for ImageSequence {
    fn len(&self) -> u64 {
        u64::try_from(self.files.len()).unwrap_or(u64::MAX)
    }

    fn frame(&self, index: u64) -> Result<GrayImage, SourceError> {
        let path = usize::try_from(index)
            .ok()
            .and_then(|i| self.files.get(i))
            .ok_or(SourceError::OutOfRange {
                index,
                len: self.len(),
            })?;
        let image = image::open(path).map_err(|source| SourceError::Decode {
            path: path.clone(),
            source,
        })?;
        Ok(image.to_luma8())
    }
}

/// An already-decoded sequence held in memory (embedding and tests).
pub struct MemorySequence {
    frames: Vec<GrayImage>,
}

impl MemorySequence {
    /// Wrap decoded frames.
    #[must_use]
    pub const fn new(frames: Vec<GrayImage>) -> Self {
        Self { frames }
    }
}

impl FrameSource for MemorySequence {
    fn len(&self) -> u64 {
        u64::try_from(self.frames.len()).unwrap_or(u64::MAX)
    }

    fn frame(&self, index: u64) -> Result<GrayImage, SourceError> {
        usize::try_from(index)
            .ok()
            .and_then(|i| self.frames.get(i))
            .cloned()
            .ok_or(SourceError::OutOfRange {
                index,
                len: self.len(),
            })
    }
}
