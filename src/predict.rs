//! Prompted detection over a dataset, persisted as one JSON file per prompt

use crate::bbox::CenterBox;
use crate::dataset::TacoDataset;
use crate::error::{Result, TacoError};
use candle_core::Tensor;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// output of one detector call; the three lists are index-aligned
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    /// normalized (cx, cy, w, h) boxes
    pub boxes: Vec<CenterBox>,
    /// confidence per box
    pub logits: Vec<f32>,
    /// caption phrase per box
    pub phrases: Vec<String>,
}

impl Detections {
    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn validate(&self) -> Result<()> {
        if self.logits.len() != self.boxes.len() || self.phrases.len() != self.boxes.len() {
            return Err(TacoError::MisalignedDetections {
                boxes: self.boxes.len(),
                logits: self.logits.len(),
                phrases: self.phrases.len(),
            });
        }
        Ok(())
    }
}

/// an open-vocabulary detector such as GroundingDINO
pub trait Detector {
    /// detect the phrases of `caption` in a normalized (3, h, w) `image` tensor, keeping boxes
    /// whose score reaches `box_threshold` and phrase tokens whose score reaches `text_threshold`
    fn predict(
        &self,
        image: &Tensor,
        caption: &str,
        box_threshold: f32,
        text_threshold: f32,
    ) -> Result<Detections>;
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelParams {
    pub box_threshold: f32,
    pub text_threshold: f32,
}

pub struct Predictor<D> {
    detector: D,
    pub box_threshold: f32,
    pub text_threshold: f32,
}

impl<D: Detector> Predictor<D> {
    pub fn new(detector: D) -> Self {
        Self::with_thresholds(detector, 0.35, 0.25)
    }

    pub fn with_thresholds(detector: D, box_threshold: f32, text_threshold: f32) -> Self {
        Self {
            detector,
            box_threshold,
            text_threshold,
        }
    }

    pub fn detector(&self) -> &D {
        &self.detector
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            box_threshold: self.box_threshold,
            text_threshold: self.text_threshold,
        }
    }

    pub fn predict(&self, image: &Tensor, prompt: &str) -> Result<Detections> {
        let detections =
            self.detector
                .predict(image, prompt, self.box_threshold, self.text_threshold)?;
        detections.validate()?;
        Ok(detections)
    }
}

/// caption text sent to the detector and the name its results are stored under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub text: String,
    pub name: String,
}

impl Prompt {
    pub fn new(text: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            name: name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    /// image the prediction was made for; absent in files written without it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub boxes: Vec<CenterBox>,
    pub logits: Vec<f32>,
    pub phrases: Vec<String>,
}

impl PredictionRecord {
    pub fn from_detections(file_name: Option<String>, detections: Detections) -> Self {
        Self {
            file_name,
            boxes: detections.boxes,
            logits: detections.logits,
            phrases: detections.phrases,
        }
    }
}

/// all predictions made for one prompt, in dataset order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionFile {
    pub model_params: ModelParams,
    pub prompt: String,
    pub predictions: Vec<PredictionRecord>,
}

impl PredictionFile {
    pub fn path<P: AsRef<Path>>(results_dir: P, prompt_name: &str) -> PathBuf {
        results_dir.as_ref().join(format!("{prompt_name}.json"))
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }

    /// write pretty-printed with 4-space indentation, replacing any existing file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut writer, formatter);
        self.serialize(&mut ser)?;
        writer.flush()?;
        Ok(())
    }
}

/// run every prompt over every sample, writing `{results_dir}/{prompt.name}.json` per prompt;
/// a failing sample aborts without writing that prompt's file
pub fn batch_predict<D: Detector, P: AsRef<Path>>(
    predictor: &Predictor<D>,
    dataset: &TacoDataset,
    prompts: &[Prompt],
    results_dir: P,
) -> Result<Vec<PathBuf>> {
    let results_dir = results_dir.as_ref();
    fs::create_dir_all(results_dir)?;
    let mut written = Vec::with_capacity(prompts.len());
    for prompt in prompts {
        info!("running inference for {}", prompt.name);
        let now = Instant::now();
        let mut predictions = Vec::with_capacity(dataset.len());
        for (index, sample) in dataset.iter().enumerate() {
            let sample = sample?;
            let detections = predictor.predict(&sample.image, &prompt.text)?;
            debug!(
                "{} [{}/{}]: {} detections",
                prompt.name,
                index + 1,
                dataset.len(),
                detections.len()
            );
            predictions.push(PredictionRecord::from_detections(
                Some(sample.ground_truth.file_name),
                detections,
            ));
        }
        let file = PredictionFile {
            model_params: predictor.model_params(),
            prompt: prompt.text.clone(),
            predictions,
        };
        let path = PredictionFile::path(results_dir, &prompt.name);
        file.save(&path)?;
        info!(
            "{} predictions for {} written to {:?} in {:.3}s",
            file.predictions.len(),
            prompt.name,
            path,
            now.elapsed().as_secs_f32()
        );
        written.push(path);
    }
    Ok(written)
}
