//! Box matching between predictions and ground truth, accumulated into a label confusion matrix

use crate::bbox::{iou_matrix, CornerBox};
use crate::dataset::{GroundTruth, TacoDataset};
use crate::error::{Result, TacoError};
use crate::predict::{PredictionFile, PredictionRecord};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// match counts keyed by ground-truth label, then predicted phrase
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConfusionMatrix {
    counts: BTreeMap<String, BTreeMap<String, usize>>,
}

impl ConfusionMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    /// count for the pair, inserting a zero entry on first use
    pub fn entry_mut(&mut self, gt_label: &str, pred_label: &str) -> &mut usize {
        self.counts
            .entry(gt_label.to_string())
            .or_default()
            .entry(pred_label.to_string())
            .or_insert(0)
    }

    pub fn increment(&mut self, gt_label: &str, pred_label: &str) {
        *self.entry_mut(gt_label, pred_label) += 1;
    }

    pub fn get(&self, gt_label: &str, pred_label: &str) -> usize {
        self.counts
            .get(gt_label)
            .and_then(|row| row.get(pred_label))
            .copied()
            .unwrap_or(0)
    }

    pub fn row(&self, gt_label: &str) -> Option<&BTreeMap<String, usize>> {
        self.counts.get(gt_label)
    }

    /// (ground-truth label, predicted phrase, count) triples in label order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, usize)> {
        self.counts.iter().flat_map(|(gt, row)| {
            row.iter()
                .map(move |(pred, &count)| (gt.as_str(), pred.as_str(), count))
        })
    }

    pub fn row_totals(&self) -> BTreeMap<&str, usize> {
        self.counts
            .iter()
            .map(|(gt, row)| (gt.as_str(), row.values().sum()))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.counts.values().flat_map(BTreeMap::values).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MatchStrategy {
    /// every (prediction, ground truth) pair at or above the threshold counts, so one box may
    /// match several boxes on the other side
    #[default]
    AllPairs,
    /// pairs are taken in descending IoU order and each box is used at most once
    GreedyOneToOne,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchOptions {
    pub iou_threshold: f32,
    pub strategy: MatchStrategy,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            iou_threshold: 0.5,
            strategy: MatchStrategy::AllPairs,
        }
    }
}

/// matched (prediction index, ground-truth index) pairs
pub fn match_boxes(
    predicted: &[CornerBox],
    ground_truth: &[CornerBox],
    options: &MatchOptions,
) -> Vec<(usize, usize)> {
    let ious = iou_matrix(predicted, ground_truth);
    let mut candidates: Vec<(usize, usize, f32)> = ious
        .iter()
        .enumerate()
        .flat_map(|(i, row)| row.iter().enumerate().map(move |(j, &iou)| (i, j, iou)))
        .filter(|&(_, _, iou)| iou >= options.iou_threshold)
        .collect();

    match options.strategy {
        MatchStrategy::AllPairs => candidates.into_iter().map(|(i, j, _)| (i, j)).collect(),
        MatchStrategy::GreedyOneToOne => {
            candidates.sort_by(|a, b| b.2.total_cmp(&a.2));
            let mut pred_used = vec![false; predicted.len()];
            let mut gt_used = vec![false; ground_truth.len()];
            let mut pairs = Vec::new();
            for (i, j, _) in candidates {
                if !pred_used[i] && !gt_used[j] {
                    pred_used[i] = true;
                    gt_used[j] = true;
                    pairs.push((i, j));
                }
            }
            pairs
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub confusion: ConfusionMatrix,
    /// predicted phrases found verbatim among their image's ground-truth labels
    pub matching_phrases: usize,
    pub samples: usize,
}

impl Evaluation {
    pub fn add_sample(
        &mut self,
        ground_truth: &GroundTruth,
        prediction: &PredictionRecord,
        options: &MatchOptions,
    ) -> Result<()> {
        if ground_truth.boxes.len() != ground_truth.labels.len() {
            return Err(TacoError::MisalignedGroundTruth {
                file_name: ground_truth.file_name.clone(),
                boxes: ground_truth.boxes.len(),
                labels: ground_truth.labels.len(),
            });
        }
        if prediction.boxes.len() != prediction.phrases.len() {
            return Err(TacoError::MisalignedDetections {
                boxes: prediction.boxes.len(),
                logits: prediction.logits.len(),
                phrases: prediction.phrases.len(),
            });
        }
        self.samples += 1;
        self.matching_phrases += prediction
            .phrases
            .iter()
            .filter(|phrase| ground_truth.labels.contains(*phrase))
            .count();

        if prediction.boxes.is_empty() {
            return Ok(());
        }

        let predicted: Vec<CornerBox> = prediction
            .boxes
            .iter()
            .map(|b| b.to_pixel_corners(ground_truth.image_size))
            .collect();
        let pairs = match_boxes(&predicted, &ground_truth.corner_boxes(), options);
        debug!(
            "{}: {} predictions, {} ground truth boxes, {} matches",
            ground_truth.file_name,
            predicted.len(),
            ground_truth.boxes.len(),
            pairs.len()
        );
        for (i, j) in pairs {
            self.confusion
                .increment(&ground_truth.labels[j], &prediction.phrases[i]);
        }
        Ok(())
    }
}

/// pair ground truth with predictions by position; lengths must agree, and a prediction that
/// names its image must name the ground truth's image
pub fn evaluate_predictions<I>(
    ground_truth: I,
    predictions: &[PredictionRecord],
    options: &MatchOptions,
) -> Result<Evaluation>
where
    I: IntoIterator<Item = Result<GroundTruth>>,
{
    let mut evaluation = Evaluation::default();
    let mut ground_truth = ground_truth.into_iter();
    for (index, prediction) in predictions.iter().enumerate() {
        let Some(gt) = ground_truth.next() else {
            return Err(TacoError::PredictionCountMismatch {
                predictions: predictions.len(),
                samples: index,
            });
        };
        let gt = gt?;
        if let Some(file_name) = &prediction.file_name {
            if *file_name != gt.file_name {
                return Err(TacoError::SampleOrderMismatch {
                    index,
                    expected: gt.file_name,
                    found: file_name.clone(),
                });
            }
        }
        evaluation.add_sample(&gt, prediction, options)?;
    }
    let remaining = ground_truth.count();
    if remaining > 0 {
        return Err(TacoError::PredictionCountMismatch {
            predictions: predictions.len(),
            samples: predictions.len() + remaining,
        });
    }
    info!(
        "# prediction phrases matching ground truth labels: {}",
        evaluation.matching_phrases
    );
    Ok(evaluation)
}

pub struct Evaluator<'a> {
    dataset: &'a TacoDataset,
    result_dir: PathBuf,
    options: MatchOptions,
}

impl<'a> Evaluator<'a> {
    pub fn new<P: AsRef<Path>>(dataset: &'a TacoDataset, result_dir: P) -> Self {
        Self {
            dataset,
            result_dir: result_dir.as_ref().to_path_buf(),
            options: MatchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: MatchOptions) -> Self {
        self.options = options;
        self
    }

    /// load `{result_dir}/{prompt_name}.json` and match it against the dataset
    pub fn evaluate(&self, prompt_name: &str) -> Result<Evaluation> {
        let path = PredictionFile::path(&self.result_dir, prompt_name);
        let file = PredictionFile::load(&path)?;
        info!(
            "evaluating {} predictions for prompt '{}' from {:?}",
            file.predictions.len(),
            file.prompt,
            path
        );
        self.evaluate_file(&file)
    }

    pub fn evaluate_file(&self, file: &PredictionFile) -> Result<Evaluation> {
        if file.predictions.len() != self.dataset.len() {
            return Err(TacoError::PredictionCountMismatch {
                predictions: file.predictions.len(),
                samples: self.dataset.len(),
            });
        }
        let ground_truth = (0..self.dataset.len()).map(|index| self.dataset.ground_truth(index));
        evaluate_predictions(ground_truth, &file.predictions, &self.options)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::bbox::{CenterBox, XywhBox};
    use crate::dataset::test::write_fixture;
    use crate::predict::test::CenterDetector;
    use crate::predict::{batch_predict, ModelParams, Predictor, Prompt};

    fn ground_truth(boxes: &[[f32; 4]], labels: &[&str], image_size: (u32, u32)) -> GroundTruth {
        GroundTruth {
            file_name: "img.jpg".to_string(),
            image_size,
            boxes: boxes.iter().map(|&b| XywhBox::from(b)).collect(),
            labels: labels.iter().map(|l| l.to_string()).collect(),
        }
    }

    fn prediction(boxes: &[[f32; 4]], phrases: &[&str]) -> PredictionRecord {
        PredictionRecord {
            file_name: None,
            boxes: boxes.iter().map(|&b| CenterBox::from(b)).collect(),
            logits: vec![0.5; boxes.len()],
            phrases: phrases.iter().map(|p| p.to_string()).collect(),
        }
    }

    #[test]
    fn test_confusion_matrix_get_or_insert() {
        let mut confusion = ConfusionMatrix::new();
        assert_eq!(confusion.get("Bottle", "bottle"), 0);
        assert!(confusion.is_empty());
        assert_eq!(*confusion.entry_mut("Bottle", "bottle"), 0);
        confusion.increment("Bottle", "bottle");
        confusion.increment("Bottle", "bottle");
        confusion.increment("Bottle", "can");
        confusion.increment("Can", "can");
        assert_eq!(confusion.get("Bottle", "bottle"), 2);
        assert_eq!(confusion.total(), 4);
        assert_eq!(confusion.row_totals()["Bottle"], 3);
        assert_eq!(confusion.row("Can").unwrap().len(), 1);
        let triples: Vec<_> = confusion.iter().collect();
        assert_eq!(
            triples,
            vec![("Bottle", "bottle", 2), ("Bottle", "can", 1), ("Can", "can", 1)]
        );
        assert_eq!(
            serde_json::to_value(&confusion).unwrap(),
            serde_json::json!({"Bottle": {"bottle": 2, "can": 1}, "Can": {"can": 1}})
        );
    }

    #[test]
    fn test_exact_match_counts_once() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["plastic"], (100, 100));
        // center form of corners (0, 0, 10, 10) on a 100x100 image
        let pred = prediction(&[[0.05, 0.05, 0.1, 0.1]], &["plastic bottle"]);
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap();
        assert_eq!(evaluation.confusion.get("plastic", "plastic bottle"), 1);
        assert_eq!(evaluation.confusion.total(), 1);
        assert_eq!(evaluation.matching_phrases, 0);
        assert_eq!(evaluation.samples, 1);
    }

    #[test]
    fn test_ground_truth_is_xywh() {
        // gt (50, 20, 30, 60) spans corners (50, 20)..(80, 80)
        let gt = ground_truth(&[[50.0, 20.0, 30.0, 60.0]], &["Can"], (100, 100));
        let pred = prediction(&[[0.65, 0.5, 0.3, 0.6]], &["can"]);
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap();
        assert_eq!(evaluation.confusion.get("Can", "can"), 1);
    }

    #[test]
    fn test_denormalize_uses_width_and_height() {
        // corners (0, 0, 50, 100) on a 200x100 image
        let gt = ground_truth(&[[0.0, 0.0, 50.0, 100.0]], &["Paper"], (200, 100));
        let pred = prediction(&[[0.125, 0.5, 0.25, 1.0]], &["paper"]);
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap();
        assert_eq!(evaluation.confusion.get("Paper", "paper"), 1);

        // same prediction on a transposed image no longer overlaps enough
        let gt = ground_truth(&[[0.0, 0.0, 50.0, 100.0]], &["Paper"], (100, 200));
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap();
        assert!(evaluation.confusion.is_empty());
    }

    #[test]
    fn test_below_threshold_does_not_match() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["Bottle"], (100, 100));
        // corners (5, 0, 15, 10): IoU 50 / 150
        let pred = prediction(&[[0.1, 0.05, 0.1, 0.1]], &["bottle"]);
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap();
        assert!(evaluation.confusion.is_empty());

        let lenient = MatchOptions {
            iou_threshold: 0.3,
            ..Default::default()
        };
        evaluation.add_sample(&gt, &pred, &lenient).unwrap();
        assert_eq!(evaluation.confusion.get("Bottle", "bottle"), 1);
    }

    #[test]
    fn test_all_pairs_counts_many_to_many() {
        let gt = ground_truth(
            &[[0.0, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 10.0]],
            &["Bottle", "Can"],
            (100, 100),
        );
        let pred = prediction(
            &[[0.05, 0.05, 0.1, 0.1], [0.05, 0.05, 0.1, 0.1]],
            &["bottle", "can"],
        );
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap();
        assert_eq!(evaluation.confusion.total(), 4);
        assert_eq!(evaluation.confusion.get("Bottle", "can"), 1);
        assert_eq!(evaluation.confusion.get("Can", "bottle"), 1);
    }

    #[test]
    fn test_greedy_one_to_one_uses_each_box_once() {
        let gt = ground_truth(
            &[[0.0, 0.0, 10.0, 10.0], [0.0, 0.0, 10.0, 12.0]],
            &["Bottle", "Can"],
            (100, 100),
        );
        // first prediction fits gt 0 exactly, second fits gt 1 exactly
        let pred = prediction(
            &[[0.05, 0.05, 0.1, 0.1], [0.05, 0.06, 0.1, 0.12]],
            &["bottle", "can"],
        );
        let options = MatchOptions {
            strategy: MatchStrategy::GreedyOneToOne,
            ..Default::default()
        };
        let mut evaluation = Evaluation::default();
        evaluation.add_sample(&gt, &pred, &options).unwrap();
        assert_eq!(evaluation.confusion.total(), 2);
        assert_eq!(evaluation.confusion.get("Bottle", "bottle"), 1);
        assert_eq!(evaluation.confusion.get("Can", "can"), 1);
    }

    #[test]
    fn test_match_boxes_strategies() {
        let a: CornerBox = [0.0, 0.0, 10.0, 10.0].into();
        let b: CornerBox = [1.0, 0.0, 11.0, 10.0].into();
        let all = match_boxes(&[a], &[a, b], &MatchOptions::default());
        assert_eq!(all, vec![(0, 0), (0, 1)]);
        let greedy = MatchOptions {
            strategy: MatchStrategy::GreedyOneToOne,
            ..Default::default()
        };
        assert_eq!(match_boxes(&[a], &[b, a], &greedy), vec![(0, 1)]);
        assert!(match_boxes(&[], &[a], &greedy).is_empty());
    }

    #[test]
    fn test_empty_prediction_still_counted() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["Bottle"], (100, 100));
        let mut evaluation = Evaluation::default();
        evaluation
            .add_sample(&gt, &prediction(&[], &[]), &MatchOptions::default())
            .unwrap();
        assert!(evaluation.confusion.is_empty());
        assert_eq!(evaluation.samples, 1);
    }

    #[test]
    fn test_matching_phrases_accumulate_across_samples() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["Bottle"], (100, 100));
        let far = [0.9, 0.9, 0.1, 0.1];
        let predictions = vec![
            prediction(&[far, far, far], &["Bottle", "can", "Bottle"]),
            prediction(&[far], &["Bottle"]),
        ];
        let evaluation = evaluate_predictions(
            vec![Ok(gt.clone()), Ok(gt)],
            &predictions,
            &MatchOptions::default(),
        )
        .unwrap();
        assert_eq!(evaluation.matching_phrases, 3);
        assert!(evaluation.confusion.is_empty());
        assert_eq!(evaluation.samples, 2);
    }

    #[test]
    fn test_misaligned_prediction_rejected() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["Bottle"], (100, 100));
        let mut pred = prediction(&[[0.05, 0.05, 0.1, 0.1]], &["bottle"]);
        pred.phrases.clear();
        let err = Evaluation::default()
            .add_sample(&gt, &pred, &MatchOptions::default())
            .unwrap_err();
        assert!(matches!(err, TacoError::MisalignedDetections { .. }));
    }

    #[test]
    fn test_sample_order_mismatch_fails_fast() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["Bottle"], (100, 100));
        let mut pred = prediction(&[], &[]);
        pred.file_name = Some("other.jpg".to_string());
        let err = evaluate_predictions(vec![Ok(gt)], &[pred], &MatchOptions::default())
            .unwrap_err();
        match err {
            TacoError::SampleOrderMismatch {
                index,
                expected,
                found,
            } => {
                assert_eq!(index, 0);
                assert_eq!(expected, "img.jpg");
                assert_eq!(found, "other.jpg");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_count_mismatch_fails_fast() {
        let gt = ground_truth(&[[0.0, 0.0, 10.0, 10.0]], &["Bottle"], (100, 100));
        let err = evaluate_predictions(
            vec![Ok(gt.clone()), Ok(gt.clone())],
            &[prediction(&[], &[])],
            &MatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TacoError::PredictionCountMismatch {
                predictions: 1,
                samples: 2
            }
        ));
        let err = evaluate_predictions(
            vec![Ok(gt)],
            &[prediction(&[], &[]), prediction(&[], &[])],
            &MatchOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TacoError::PredictionCountMismatch {
                predictions: 2,
                samples: 1
            }
        ));
    }

    #[test]
    fn test_evaluator_reads_prediction_file() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = write_fixture(dir.path());
        let dataset = TacoDataset::new(json_path, dir.path().join("images"), None).unwrap();
        let results_dir = dir.path().join("results");
        std::fs::create_dir_all(&results_dir).unwrap();

        // first sample: a 40x30 image with a box at corners (0, 0, 10, 10)
        let mut hit = prediction(&[[0.125, 1.0 / 6.0, 0.25, 1.0 / 3.0]], &["bottle"]);
        hit.file_name = Some("batch_1/000000.png".to_string());
        PredictionFile {
            model_params: ModelParams {
                box_threshold: 0.35,
                text_threshold: 0.25,
            },
            prompt: "bottle .".to_string(),
            predictions: vec![hit, prediction(&[], &[])],
        }
        .save(PredictionFile::path(&results_dir, "bottle"))
        .unwrap();

        let evaluator = Evaluator::new(&dataset, &results_dir);
        let evaluation = evaluator.evaluate("bottle").unwrap();
        assert_eq!(evaluation.confusion.get("Bottle", "bottle"), 1);
        assert_eq!(evaluation.confusion.total(), 1);
        assert_eq!(evaluation.samples, 2);

        let err = evaluator.evaluate("missing").unwrap_err();
        assert!(
            matches!(err, TacoError::IoError(ref e) if e.kind() == std::io::ErrorKind::NotFound)
        );
    }

    #[test]
    fn test_predict_then_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        let json_path = write_fixture(dir.path());
        let dataset = TacoDataset::new(json_path, dir.path().join("images"), None)
            .unwrap()
            .with_resize(None);
        let results_dir = dir.path().join("results");
        let predictor = Predictor::new(CenterDetector::new());
        batch_predict(
            &predictor,
            &dataset,
            &[Prompt::new("Bottle", "bottle")],
            &results_dir,
        )
        .unwrap();

        let evaluation = Evaluator::new(&dataset, &results_dir)
            .evaluate("bottle")
            .unwrap();
        // the phrase "Bottle" is a label of the first image only
        assert_eq!(evaluation.matching_phrases, 1);
        assert_eq!(evaluation.samples, 2);
        assert!(evaluation.confusion.is_empty());
    }
}
