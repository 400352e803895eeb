use std::{io, path::PathBuf};

use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeneratorError>;

#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("image error at {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to parse annotations {path}: {source}")]
    Annotations {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported image format `{0}`")]
    UnsupportedFormat(String),
    #[error("image index {index} out of range ({len} images)")]
    OutOfRange { index: usize, len: usize },
    #[error("failed to download {url}: {source}")]
    Download {
        url: String,
        #[source]
        source: Box<ureq::Error>,
    },
    #[error("failed to extract {path}: {source}")]
    Archive {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("{archive} does not contain {expected}")]
    MissingFromArchive { archive: PathBuf, expected: PathBuf },
}

impl GeneratorError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub(crate) fn image(path: impl Into<PathBuf>) -> impl FnOnce(image::ImageError) -> Self {
        let path = path.into();
        move |source| Self::Image { path, source }
    }

    pub(crate) fn archive(path: impl Into<PathBuf>) -> impl FnOnce(zip::result::ZipError) -> Self {
        let path = path.into();
        move |source| Self::Archive { path, source }
    }
}
