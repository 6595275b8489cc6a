//! Best-effort bulk image download over HTTP

use crate::annotations::AnnotationFile;
use crate::error::{Result, TacoError};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::NamedTempFile;

/// a remote file and the path, relative to the output directory, it is saved under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: Option<String>,
    pub file_name: String,
}

impl DownloadRequest {
    pub fn new(url: Option<String>, file_name: impl Into<String>) -> Self {
        Self {
            url,
            file_name: file_name.into(),
        }
    }

    fn valid_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadConfig {
    /// number of concurrent downloads
    pub workers: usize,
    /// bytes read from the response per chunk while streaming to disk
    pub chunk_size: usize,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            chunk_size: 8192,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub successful: Vec<PathBuf>,
    pub failed: Vec<String>,
    /// requests dropped for lacking a usable URL
    pub skipped: usize,
    /// set when no request had a usable URL, in which case nothing was attempted
    pub no_valid_urls: bool,
}

pub struct Downloader {
    agent: ureq::Agent,
    config: DownloadConfig,
}

impl Default for Downloader {
    fn default() -> Self {
        Self::new(DownloadConfig::default())
    }
}

impl Downloader {
    pub fn new(config: DownloadConfig) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().build(),
            config,
        }
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    /// download every request with a usable URL into `output_dir`; individual failures are
    /// recorded in the report rather than returned
    pub fn download_all<P: AsRef<Path>>(
        &self,
        requests: &[DownloadRequest],
        output_dir: P,
    ) -> Result<DownloadReport> {
        let output_dir = output_dir.as_ref();
        fs::create_dir_all(output_dir)?;

        let valid: Vec<(&str, &str)> = requests
            .iter()
            .filter_map(|r| r.valid_url().map(|url| (url, r.file_name.as_str())))
            .collect();
        let mut report = DownloadReport {
            skipped: requests.len() - valid.len(),
            ..Default::default()
        };
        if valid.is_empty() {
            warn!("no valid URLs found to download");
            report.no_valid_urls = true;
            return Ok(report);
        }
        info!(
            "downloading {} files with {} workers ({} skipped)",
            valid.len(),
            self.config.workers,
            report.skipped
        );

        let total = valid.len();
        let done = AtomicUsize::new(0);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.workers.max(1))
            .build()?;
        let outcomes: Vec<std::result::Result<PathBuf, String>> = pool.install(|| {
            valid
                .par_iter()
                .map(|&(url, file_name)| {
                    let output_path = output_dir.join(file_name);
                    let outcome = self
                        .download_one(url, &output_path)
                        .map(|()| output_path)
                        .map_err(|e| format!("{url}: {e}"));
                    let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
                    match &outcome {
                        Ok(_) => debug!("[{}/{}] downloaded {}", finished, total, file_name),
                        Err(e) => debug!("[{}/{}] failed {}: {}", finished, total, file_name, e),
                    }
                    outcome
                })
                .collect()
        });

        for outcome in outcomes {
            match outcome {
                Ok(path) => report.successful.push(path),
                Err(e) => report.failed.push(e),
            }
        }
        info!("completed: {} files", report.successful.len());
        if !report.failed.is_empty() {
            warn!("failed: {} files", report.failed.len());
            for e in &report.failed {
                error!("{}", e);
            }
        }
        Ok(report)
    }

    /// stream `url` into a temp file next to `output_path`, renaming it into place on success
    pub fn download_one(&self, url: &str, output_path: &Path) -> Result<()> {
        let parent = match output_path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let response = self.agent.get(url).call()?;
        let expected = response
            .header("content-length")
            .and_then(|v| v.parse::<u64>().ok());
        debug!("downloading {} ({:?} bytes) to {:?}", url, expected, output_path);

        let mut tmp = NamedTempFile::new_in(parent)?;
        let written = {
            let mut reader = response.into_reader();
            let mut writer = BufWriter::new(tmp.as_file_mut());
            let mut chunk = vec![0u8; self.config.chunk_size.max(1)];
            let mut written = 0u64;
            loop {
                let n = match reader.read(&mut chunk) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e.into()),
                };
                writer.write_all(&chunk[..n])?;
                written += n as u64;
            }
            writer.flush()?;
            written
        };
        if let Some(expected) = expected {
            if expected != written {
                return Err(TacoError::IncompleteDownload { expected, written });
            }
        }
        tmp.persist(output_path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// downloads the images of a local TACO repository checkout
#[derive(Debug, Clone)]
pub struct TacoDownloader {
    pub repo_path: PathBuf,
    pub download_dir: PathBuf,
    pub use_full_resolution: bool,
}

impl TacoDownloader {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(
        repo_path: P,
        download_dir: Q,
        use_full_resolution: bool,
    ) -> Self {
        Self {
            repo_path: repo_path.into(),
            download_dir: download_dir.into(),
            use_full_resolution,
        }
    }

    pub fn annotations_path(&self) -> PathBuf {
        self.repo_path.join("data").join("annotations.json")
    }

    /// the repository must be a non-empty directory and the download directory must exist
    pub fn check_params(&self) -> bool {
        let repo_has_files = fs::read_dir(&self.repo_path)
            .map(|mut entries| entries.next().is_some())
            .unwrap_or(false);
        repo_has_files && self.download_dir.is_dir()
    }

    /// one request per listed image, using the full or the 640px URL
    pub fn requests(&self, file: &AnnotationFile) -> Vec<DownloadRequest> {
        file.images
            .iter()
            .map(|img| {
                DownloadRequest::new(
                    img.url(self.use_full_resolution).map(str::to_string),
                    img.file_name.clone(),
                )
            })
            .collect()
    }

    pub fn download_images(&self, downloader: &Downloader) -> Result<DownloadReport> {
        let path = self.annotations_path();
        if !path.is_file() {
            return Err(TacoError::MissingAnnotations(path));
        }
        info!("found {:?}", path);
        let file = AnnotationFile::from_path(&path)?;
        let requests = self.requests(&file);
        info!("found {} image records", requests.len());
        downloader.download_all(&requests, &self.download_dir)
    }
}
