//! ExemplarClassifier - Nearest-Centroid Defect Classification
//!
//! ## Responsibilities
//!
//! - Class centroids ("exemplars") built from labeled reference embeddings
//! - Sensitivity-biased nearest-centroid classification
//! - On-disk exemplar cache keyed by a content hash
//!
//! The decision rule is deliberately asymmetric: when the nearest centroid
//! is not the defect class, the defect class still wins whenever its
//! distance is within `sensitivity` times the minimum. Sensitivity above
//! 1.0 widens the defect region, below 1.0 shrinks it, 1.0 is the plain
//! nearest-centroid rule.

use crate::error::{Error, Result};
use crate::frame_source::FrameEncoder;
use crate::models::Frame;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;

/// One centroid embedding per class, with a distinguished defect class
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExemplarSet {
    class_names: Vec<String>,
    centroids: Vec<Vec<f32>>,
    /// Index of the defect class; `None` disables the sensitivity bias
    defect_idx: Option<usize>,
}

impl ExemplarSet {
    /// Build exemplars from labeled embedding groups.
    ///
    /// Each group is a class label and the embeddings of its reference
    /// frames; the centroid is their mean. Exactly one class other than
    /// `success_label` becomes the defect class; otherwise the
    /// sensitivity bias is disabled with a warning.
    pub fn build(groups: &[(String, Vec<Vec<f32>>)], success_label: &str) -> Result<Self> {
        let mut class_names = Vec::new();
        let mut centroids = Vec::new();

        for (label, embeddings) in groups {
            let Some(centroid) = mean_embedding(embeddings) else {
                tracing::warn!(class = %label, "No embeddings for class, skipping");
                continue;
            };
            class_names.push(label.clone());
            centroids.push(centroid);
        }

        if centroids.is_empty() {
            return Err(Error::Inference(
                "no exemplars could be built from the support set".to_string(),
            ));
        }

        let defect_candidates: Vec<usize> = class_names
            .iter()
            .enumerate()
            .filter(|(_, name)| name.as_str() != success_label)
            .map(|(i, _)| i)
            .collect();

        let defect_idx = if !class_names.iter().any(|n| n == success_label) {
            tracing::warn!(
                success_label = %success_label,
                "Success class missing from support set, sensitivity bias disabled"
            );
            None
        } else {
            match defect_candidates.as_slice() {
                [idx] => {
                    tracing::debug!(
                        defect_class = %class_names[*idx],
                        defect_idx = idx,
                        "Defect class identified"
                    );
                    Some(*idx)
                }
                [] => {
                    tracing::warn!("Only the success class present, sensitivity bias disabled");
                    None
                }
                _ => {
                    tracing::warn!(
                        candidates = ?defect_candidates.iter().map(|&i| &class_names[i]).collect::<Vec<_>>(),
                        "Multiple defect candidates, sensitivity bias disabled"
                    );
                    None
                }
            }
        };

        Ok(Self {
            class_names,
            centroids,
            defect_idx,
        })
    }

    /// Classify one embedding; `None` only when the set is empty
    pub fn classify(&self, embedding: &[f32], sensitivity: f64) -> Option<usize> {
        if self.centroids.is_empty() {
            return None;
        }

        let distances: Vec<f32> = self
            .centroids
            .iter()
            .map(|c| euclidean(embedding, c))
            .collect();

        let (mut predicted, dmin) = distances
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, d)| (i, *d))?;

        if let Some(defect_idx) = self.defect_idx {
            if predicted != defect_idx {
                // Inclusive boundary: equal distances resolve to defect.
                // The comparison stays in f32 with the distance math;
                // promoting to f64 first shifts the boundary (1.2f32 as
                // f64 is slightly above 0.8f32 as f64 * 1.5).
                let dist_to_defect = distances[defect_idx];
                if dist_to_defect <= dmin * sensitivity as f32 {
                    predicted = defect_idx;
                }
            }
        }

        Some(predicted)
    }

    /// Classify a batch independently per item; empty in, empty out.
    /// Output index i is the prediction for input i.
    pub fn classify_batch(&self, embeddings: &[Vec<f32>], sensitivity: f64) -> Vec<Option<usize>> {
        embeddings
            .iter()
            .map(|e| self.classify(e, sensitivity))
            .collect()
    }

    pub fn label_of(&self, idx: usize) -> Option<&str> {
        self.class_names.get(idx).map(String::as_str)
    }

    pub fn defect_idx(&self) -> Option<usize> {
        self.defect_idx
    }

    pub fn defect_label(&self) -> Option<&str> {
        self.defect_idx.and_then(|i| self.label_of(i))
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

fn mean_embedding(embeddings: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = embeddings.first()?;
    let mut sum = vec![0f32; first.len()];
    let mut count = 0usize;
    for embedding in embeddings {
        if embedding.len() != sum.len() {
            tracing::warn!(
                expected = sum.len(),
                got = embedding.len(),
                "Embedding dimension mismatch, skipping sample"
            );
            continue;
        }
        for (s, v) in sum.iter_mut().zip(embedding) {
            *s += v;
        }
        count += 1;
    }
    if count == 0 {
        return None;
    }
    for s in sum.iter_mut() {
        *s /= count as f32;
    }
    Some(sum)
}

fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

/// SHA-1 content hash for cache keys
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Disk cache of serialized exemplar sets, keyed by content hash.
///
/// The hash covers the support set contents, so any change to the
/// reference images produces a different key and the stale file is
/// simply never read again. `clear` wipes the directory.
pub struct ExemplarCache {
    dir: PathBuf,
}

impl ExemplarCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn file_for(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("exemplars_{hash}.json"))
    }

    /// Load a cached set; `None` on miss or unreadable file
    pub async fn load(&self, hash: &str) -> Option<ExemplarSet> {
        let path = self.file_for(hash);
        let bytes = fs::read(&path).await.ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(set) => {
                tracing::debug!(hash = %hash, "Exemplar cache hit");
                Some(set)
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Unreadable exemplar cache entry");
                None
            }
        }
    }

    /// Store a set under the given hash
    pub async fn store(&self, hash: &str, set: &ExemplarSet) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        let json = serde_json::to_vec(set)?;
        fs::write(self.file_for(hash), json).await?;
        tracing::debug!(hash = %hash, "Exemplar set cached");
        Ok(())
    }

    /// Remove all cached sets
    pub async fn clear(&self) -> Result<()> {
        let mut dir = match fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = dir.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with("exemplars_") {
                fs::remove_file(entry.path()).await?;
            }
        }
        tracing::info!("Exemplar cache cleared");
        Ok(())
    }
}

/// Build an exemplar set from a support-set directory, going through the
/// cache.
///
/// Layout: one subdirectory per class label, reference images inside.
/// The cache key is a content hash over class names, file names, and file
/// bytes, so any change to the support set produces a fresh build.
/// Unreadable images are skipped with a warning.
pub async fn load_from_image_dir(
    dir: &Path,
    encoder: Arc<dyn FrameEncoder>,
    cache: &ExemplarCache,
    success_label: &str,
) -> Result<ExemplarSet> {
    let mut classes: Vec<(String, Vec<(String, Vec<u8>)>)> = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let class = entry.file_name().to_string_lossy().into_owned();
        let mut files = Vec::new();
        let mut images = fs::read_dir(entry.path()).await?;
        while let Some(img) = images.next_entry().await? {
            if img.file_type().await?.is_file() {
                let name = img.file_name().to_string_lossy().into_owned();
                files.push((name, fs::read(img.path()).await?));
            }
        }
        // sorted traversal keeps the content hash deterministic
        files.sort_by(|a, b| a.0.cmp(&b.0));
        classes.push((class, files));
    }
    classes.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha1::new();
    for (class, files) in &classes {
        hasher.update(class.as_bytes());
        for (name, bytes) in files {
            hasher.update(name.as_bytes());
            hasher.update(bytes);
        }
    }
    let hash = format!("{:x}", hasher.finalize());

    if let Some(set) = cache.load(&hash).await {
        return Ok(set);
    }

    // decoding and embedding are CPU-bound
    let groups = tokio::task::spawn_blocking(move || {
        let mut groups: Vec<(String, Vec<Vec<f32>>)> = Vec::new();
        for (class, files) in classes {
            let mut embeddings = Vec::new();
            for (name, bytes) in files {
                let img = match image::load_from_memory(&bytes) {
                    Ok(img) => img.to_rgb8(),
                    Err(e) => {
                        tracing::warn!(class = %class, file = %name, error = %e, "Unreadable reference image, skipping");
                        continue;
                    }
                };
                let frame = Frame {
                    width: img.width(),
                    height: img.height(),
                    pixels: img.into_raw(),
                };
                match encoder.embed(&frame) {
                    Ok(embedding) => embeddings.push(embedding),
                    Err(e) => {
                        tracing::warn!(class = %class, file = %name, error = %e, "Could not embed reference image, skipping");
                    }
                }
            }
            groups.push((class, embeddings));
        }
        groups
    })
    .await
    .map_err(|e| Error::Internal(format!("support set build task: {e}")))?;

    let set = ExemplarSet::build(&groups, success_label)?;
    if let Err(e) = cache.store(&hash, &set).await {
        tracing::warn!(error = %e, "Could not cache exemplar set");
    }
    Ok(set)
}
