//! TACO dataset adapter: ground-truth boxes and supercategory labels grouped per image

use crate::annotations::AnnotationFile;
use crate::bbox::{CornerBox, XywhBox};
use crate::error::{Result, TacoError};
use crate::preprocess::{load_image_tensor, read_image, read_image_size, resize_image, Resize};
use candle_core::{Device, Tensor};
use image::GenericImageView;
use log::{debug, error, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// ground truth of one image; `boxes[i]` is labeled `labels[i]`
#[derive(Debug, Clone, PartialEq)]
pub struct GroundTruth {
    pub file_name: String,
    /// decoded (width, height) of the source image in pixels
    pub image_size: (u32, u32),
    pub boxes: Vec<XywhBox>,
    pub labels: Vec<String>,
}

impl GroundTruth {
    pub fn corner_boxes(&self) -> Vec<CornerBox> {
        self.boxes.iter().map(XywhBox::to_corners).collect()
    }

    /// boxes stacked into an (n, 4) tensor of x, y, w, h rows
    pub fn boxes_tensor(&self, device: &Device) -> candle_core::Result<Tensor> {
        let flat: Vec<f32> = self
            .boxes
            .iter()
            .flat_map(|b| <[f32; 4]>::from(*b))
            .collect();
        Tensor::from_vec(flat, (self.boxes.len(), 4), device)
    }
}

/// a dataset item: the detector-ready image tensor plus its ground truth
#[derive(Debug, Clone)]
pub struct Sample {
    pub image: Tensor,
    pub ground_truth: GroundTruth,
}

#[derive(Debug, Clone)]
struct ImageAnnotations {
    file_name: String,
    boxes: Vec<XywhBox>,
    labels: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TacoDataset {
    imgs_path: PathBuf,
    categories: Vec<String>,
    supercategories: Vec<String>,
    image_file_names: Vec<String>,
    annotated: Vec<ImageAnnotations>,
    resize: Option<Resize>,
    device: Device,
}

impl TacoDataset {
    /// parse `json_path` and group the first `sample_count` annotations (all when `None`) by image
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(
        json_path: P,
        imgs_path: Q,
        sample_count: Option<usize>,
    ) -> Result<Self> {
        let file = AnnotationFile::from_path(json_path.as_ref())?;
        debug!("loaded annotation file {:?}", json_path.as_ref());
        Self::from_annotation_file(file, imgs_path, sample_count)
    }

    pub fn from_annotation_file<Q: AsRef<Path>>(
        file: AnnotationFile,
        imgs_path: Q,
        sample_count: Option<usize>,
    ) -> Result<Self> {
        let mut categories = Vec::with_capacity(file.categories.len());
        let mut supercategories: Vec<String> = Vec::new();
        let mut supercategory_by_id = HashMap::with_capacity(file.categories.len());
        for category in &file.categories {
            categories.push(category.name.clone());
            if !supercategories.contains(&category.supercategory) {
                supercategories.push(category.supercategory.clone());
            }
            supercategory_by_id.insert(category.id, category.supercategory.as_str());
        }
        info!(
            "processed {} categories in {} supercategories",
            categories.len(),
            supercategories.len()
        );

        let image_file_names: Vec<String> =
            file.images.iter().map(|img| img.file_name.clone()).collect();

        let annotations = match sample_count {
            Some(count) => &file.annotations[..count.min(file.annotations.len())],
            None => &file.annotations[..],
        };

        let mut annotated: Vec<ImageAnnotations> = Vec::new();
        let mut position_by_image: HashMap<usize, usize> = HashMap::new();
        for annotation in annotations {
            let image_index = usize::try_from(annotation.image_id).ok();
            let Some((image_index, file_name)) = image_index
                .and_then(|i| image_file_names.get(i).map(|name| (i, name)))
            else {
                error!(
                    "annotation {} references missing image {}",
                    annotation.id, annotation.image_id
                );
                return Err(TacoError::AnnotationImageOutOfRange {
                    annotation_id: annotation.id,
                    image_id: annotation.image_id,
                    image_count: image_file_names.len(),
                });
            };
            let Some(label) = supercategory_by_id.get(&annotation.category_id) else {
                error!(
                    "annotation {} references unknown category {}",
                    annotation.id, annotation.category_id
                );
                return Err(TacoError::UnknownCategory {
                    annotation_id: annotation.id,
                    category_id: annotation.category_id,
                });
            };
            let position = *position_by_image
                .entry(image_index)
                .or_insert_with(|| {
                    annotated.push(ImageAnnotations {
                        file_name: file_name.clone(),
                        boxes: Vec::new(),
                        labels: Vec::new(),
                    });
                    annotated.len() - 1
                });
            let entry = &mut annotated[position];
            entry.boxes.push(annotation.bbox);
            entry.labels.push(label.to_string());
        }
        info!(
            "processed {} annotations over {} images",
            annotations.len(),
            annotated.len()
        );

        Ok(Self {
            imgs_path: imgs_path.as_ref().to_path_buf(),
            categories,
            supercategories,
            image_file_names,
            annotated,
            resize: Some(Resize::default()),
            device: Device::Cpu,
        })
    }

    /// resize applied to images before they become tensors, `None` keeps the source size
    pub fn with_resize(mut self, resize: Option<Resize>) -> Self {
        self.resize = resize;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// number of images with at least one annotation
    pub fn len(&self) -> usize {
        self.annotated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.annotated.is_empty()
    }

    pub fn categories(&self) -> &[String] {
        &self.categories
    }

    pub fn supercategories(&self) -> &[String] {
        &self.supercategories
    }

    /// every image listed in the annotation file, annotated or not
    pub fn image_file_names(&self) -> &[String] {
        &self.image_file_names
    }

    pub fn image_path(&self, index: usize) -> Result<PathBuf> {
        Ok(self.imgs_path.join(&self.entry(index)?.file_name))
    }

    /// ground truth for the sample at `index`, reading only the image header for its size
    pub fn ground_truth(&self, index: usize) -> Result<GroundTruth> {
        let image_size = read_image_size(self.image_path(index)?)?;
        self.ground_truth_with_size(index, image_size)
    }

    pub fn get(&self, index: usize) -> Result<Sample> {
        let path = self.image_path(index)?;
        debug!("loading sample {} from {:?}", index, path);
        let image = read_image(&path)?;
        let ground_truth = self.ground_truth_with_size(index, image.dimensions())?;
        let image = load_image_tensor(resize_image(image, self.resize), &self.device)?;
        Ok(Sample {
            image,
            ground_truth,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Result<Sample>> + '_ {
        (0..self.len()).map(move |index| self.get(index))
    }

    fn entry(&self, index: usize) -> Result<&ImageAnnotations> {
        self.annotated.get(index).ok_or(TacoError::SampleOutOfRange {
            index,
            len: self.annotated.len(),
        })
    }

    fn ground_truth_with_size(&self, index: usize, image_size: (u32, u32)) -> Result<GroundTruth> {
        let entry = self.entry(index)?;
        Ok(GroundTruth {
            file_name: entry.file_name.clone(),
            image_size,
            boxes: entry.boxes.clone(),
            labels: entry.labels.clone(),
        })
    }
}
