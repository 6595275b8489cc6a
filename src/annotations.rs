//! COCO-style annotation file as published by TACO

use crate::bbox::XywhBox;
use crate::error::Result;
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct AnnotationFile {
    pub categories: Vec<Category>,
    pub images: Vec<ImageRecord>,
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub id: u64,
    pub name: String,
    pub supercategory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageRecord {
    pub file_name: String,
    #[serde(default)]
    pub flickr_url: Option<String>,
    #[serde(default)]
    pub flickr_640_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Annotation {
    pub id: u64,
    /// position of the image in [AnnotationFile::images]; may be out of range in malformed files
    pub image_id: i64,
    pub category_id: u64,
    pub bbox: XywhBox,
}

impl AnnotationFile {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

impl ImageRecord {
    /// remote location of the image, either the original upload or the 640px rendition
    pub fn url(&self, full_resolution: bool) -> Option<&str> {
        let url = if full_resolution {
            self.flickr_url.as_deref()
        } else {
            self.flickr_640_url.as_deref()
        };
        url.filter(|u| !u.trim().is_empty())
    }
}
