use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TacoError {
    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),
    #[error("Image error: {0}")]
    ImageError(#[from] image::ImageError),
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("Json deser error: {0}")]
    JsonDeserError(#[from] serde_json::Error),
    #[error("HTTP error: {0}")]
    HttpError(#[from] Box<ureq::Error>),
    #[error("Thread pool error: {0}")]
    ThreadPoolError(#[from] rayon::ThreadPoolBuildError),
    #[error("annotation {annotation_id} references image {image_id}, but only {image_count} images are listed")]
    AnnotationImageOutOfRange {
        annotation_id: u64,
        image_id: i64,
        image_count: usize,
    },
    #[error("annotation {annotation_id} references unknown category {category_id}")]
    UnknownCategory { annotation_id: u64, category_id: u64 },
    #[error("sample index {index} out of range for dataset of length {len}")]
    SampleOutOfRange { index: usize, len: usize },
    #[error("detector output is not index-aligned: {boxes} boxes, {logits} logits, {phrases} phrases")]
    MisalignedDetections {
        boxes: usize,
        logits: usize,
        phrases: usize,
    },
    #[error("prediction file has {predictions} entries but the dataset has {samples} samples")]
    PredictionCountMismatch { predictions: usize, samples: usize },
    #[error("prediction {index} was made for '{found}' but sample {index} is '{expected}'")]
    SampleOrderMismatch {
        index: usize,
        expected: String,
        found: String,
    },
    #[error("ground truth for '{file_name}' has {boxes} boxes but {labels} labels")]
    MisalignedGroundTruth {
        file_name: String,
        boxes: usize,
        labels: usize,
    },
    #[error("incomplete download: expected {expected} bytes, got {written}")]
    IncompleteDownload { expected: u64, written: u64 },
    #[error("annotation file not found: {0}")]
    MissingAnnotations(PathBuf),
    #[error("Detector error: {0}")]
    DetectorError(String),
}

impl From<ureq::Error> for TacoError {
    fn from(err: ureq::Error) -> Self {
        Self::HttpError(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TacoError>;
