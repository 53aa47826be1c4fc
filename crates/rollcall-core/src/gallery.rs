//! Known-faces gallery: one embedding per reference photo, labelled by person.
//!
//! Reference photos live in `<source_dir>/<person>/*.{jpg,png}`. The computed
//! gallery is cached as MessagePack; once a cache exists it is returned as-is
//! and the source directory is not looked at again.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::types::Embedding;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to decode image {}: {source}", path.display())]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("face analysis failed for {}: {source}", path.display())]
    Analyzer {
        path: PathBuf,
        #[source]
        source: AnalyzerError,
    },
    #[error("corrupt gallery cache {}: {source}", path.display())]
    CacheDecode {
        path: PathBuf,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error("failed to encode gallery cache: {0}")]
    CacheEncode(#[from] rmp_serde::encode::Error),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> GalleryError + '_ {
    move |source| GalleryError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// One reference embedding for a named person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub embedding: Embedding,
}

/// Ordered collection of known-face embeddings. Read-only once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

/// Where a loaded gallery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GallerySource {
    Cache,
    Scan,
}

impl Gallery {
    pub fn from_entries(entries: Vec<GalleryEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    /// Person names, parallel to [`embeddings`](Self::embeddings).
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn embeddings(&self) -> impl Iterator<Item = &Embedding> {
        self.entries.iter().map(|e| &e.embedding)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of reference embeddings per person.
    pub fn person_counts(&self) -> BTreeMap<&str, usize> {
        let mut counts = BTreeMap::new();
        for name in self.names() {
            *counts.entry(name).or_insert(0) += 1;
        }
        counts
    }

    /// Read a cached gallery. `Ok(None)` if no cache file exists.
    pub fn read_cache(path: &Path) -> Result<Option<Self>, GalleryError> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_err(path)(e)),
        };
        rmp_serde::from_slice(&bytes)
            .map(Some)
            .map_err(|source| GalleryError::CacheDecode {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write the gallery to `path`, creating parent directories as needed.
    pub fn write_cache(&self, path: &Path) -> Result<(), GalleryError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let bytes = rmp_serde::to_vec_named(self)?;
        fs::write(path, bytes).map_err(io_err(path))
    }
}

/// Load the gallery from `cache_path`, or scan `source_dir` and write the cache.
pub fn load_gallery<A: FaceAnalyzer>(
    cache_path: &Path,
    source_dir: &Path,
    analyzer: &mut A,
) -> Result<(Gallery, GallerySource), GalleryError> {
    if let Some(gallery) = Gallery::read_cache(cache_path)? {
        tracing::info!(
            cache = %cache_path.display(),
            entries = gallery.len(),
            "gallery loaded from cache"
        );
        return Ok((gallery, GallerySource::Cache));
    }

    let gallery = scan_gallery(source_dir, analyzer)?;
    gallery.write_cache(cache_path)?;
    tracing::info!(
        source = %source_dir.display(),
        cache = %cache_path.display(),
        entries = gallery.len(),
        "gallery built from reference photos"
    );
    Ok((gallery, GallerySource::Scan))
}

/// Drop any existing cache and rebuild it from `source_dir`.
pub fn rebuild_gallery<A: FaceAnalyzer>(
    cache_path: &Path,
    source_dir: &Path,
    analyzer: &mut A,
) -> Result<Gallery, GalleryError> {
    match fs::remove_file(cache_path) {
        Ok(()) => tracing::info!(cache = %cache_path.display(), "stale gallery cache removed"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_err(cache_path)(e)),
    }
    load_gallery(cache_path, source_dir, analyzer).map(|(gallery, _)| gallery)
}

/// Scan `source_dir/<person>/` for reference photos and embed the first face of each.
pub fn scan_gallery<A: FaceAnalyzer>(
    source_dir: &Path,
    analyzer: &mut A,
) -> Result<Gallery, GalleryError> {
    let mut entries = Vec::new();

    for person_dir in sorted_entries(source_dir)? {
        if !person_dir.is_dir() {
            continue;
        }
        let Some(name) = person_dir.file_name().and_then(|n| n.to_str()) else {
            tracing::warn!(path = %person_dir.display(), "skipping non-UTF-8 person directory");
            continue;
        };

        for photo in sorted_entries(&person_dir)? {
            if !is_reference_photo(&photo) {
                continue;
            }

            let image = image::open(&photo)
                .map_err(|source| GalleryError::Image {
                    path: photo.clone(),
                    source,
                })?
                .to_rgb8();

            let faces = analyzer
                .analyze(&image)
                .map_err(|source| GalleryError::Analyzer {
                    path: photo.clone(),
                    source,
                })?;

            match faces.into_iter().next() {
                Some(face) => entries.push(GalleryEntry {
                    name: name.to_string(),
                    embedding: face.embedding,
                }),
                None => tracing::debug!(path = %photo.display(), "no face in reference photo"),
            }
        }
    }

    Ok(Gallery::from_entries(entries))
}

fn is_reference_photo(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".jpg") || n.ends_with(".png"))
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let mut paths = fs::read_dir(dir)
        .map_err(io_err(dir))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err(dir))?;
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, DetectedFace};
    use image::{Rgb, RgbImage};

    /// Treats any non-black top-left pixel as one face whose embedding is that colour.
    struct PixelAnalyzer {
        calls: usize,
    }

    impl FaceAnalyzer for PixelAnalyzer {
        fn analyze(&mut self, image: &RgbImage) -> Result<Vec<DetectedFace>, AnalyzerError> {
            self.calls += 1;
            let p = image.get_pixel(0, 0);
            if p.0 == [0, 0, 0] {
                return Ok(Vec::new());
            }
            Ok(vec![DetectedFace {
                bbox: BoundingBox {
                    x: 0.0,
                    y: 0.0,
                    width: 4.0,
                    height: 4.0,
                    confidence: 0.9,
                    landmarks: None,
                },
                embedding: Embedding::new(p.0.iter().map(|&c| c as f32 / 255.0).collect()),
            }])
        }
    }

    fn write_photo(dir: &Path, person: &str, file: &str, colour: [u8; 3]) {
        let person_dir = dir.join(person);
        fs::create_dir_all(&person_dir).unwrap();
        RgbImage::from_pixel(4, 4, Rgb(colour))
            .save(person_dir.join(file))
            .unwrap();
    }

    #[test]
    fn test_scan_one_entry_per_photo_with_face() {
        let dir = tempfile::tempdir().unwrap();
        write_photo(dir.path(), "bob", "1.png", [0, 255, 0]);
        write_photo(dir.path(), "alice", "b.png", [255, 0, 0]);
        write_photo(dir.path(), "alice", "a.png", [0, 0, 255]);
        write_photo(dir.path(), "alice", "blank.png", [0, 0, 0]);
        write_photo(dir.path(), "alice", "notes.bmp", [255, 255, 255]);
        fs::write(dir.path().join("README.txt"), "not a person").unwrap();

        let mut analyzer = PixelAnalyzer { calls: 0 };
        let gallery = scan_gallery(dir.path(), &mut analyzer).unwrap();

        assert_eq!(analyzer.calls, 4);
        assert_eq!(gallery.names().collect::<Vec<_>>(), vec!["alice", "alice", "bob"]);
        assert_eq!(gallery.entries()[0].embedding.values, vec![0.0, 0.0, 1.0]);
        assert_eq!(gallery.person_counts().get("alice"), Some(&2));
    }

    #[test]
    fn test_load_writes_cache_then_reuses_it() {
        let dir = tempfile::tempdir().unwrap();
        let faces = dir.path().join("known_faces");
        let cache = dir.path().join("cache").join("encodings.msgpack");
        write_photo(&faces, "alice", "a.png", [255, 0, 0]);

        let mut analyzer = PixelAnalyzer { calls: 0 };
        let (first, source) = load_gallery(&cache, &faces, &mut analyzer).unwrap();
        assert_eq!(source, GallerySource::Scan);
        assert!(cache.exists());

        // New photos are masked by the cache.
        write_photo(&faces, "bob", "b.png", [0, 255, 0]);
        let (second, source) = load_gallery(&cache, &faces, &mut analyzer).unwrap();
        assert_eq!(source, GallerySource::Cache);
        assert_eq!(analyzer.calls, 1);
        assert_eq!(first, second);

        let rebuilt = rebuild_gallery(&cache, &faces, &mut analyzer).unwrap();
        assert_eq!(rebuilt.len(), 2);
    }

    #[test]
    fn test_cache_round_trip_preserves_order_and_values() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("encodings.msgpack");
        let gallery = Gallery::from_entries(vec![
            GalleryEntry {
                name: "zed".into(),
                embedding: Embedding::new(vec![0.25, -0.5, 1e-7]),
            },
            GalleryEntry {
                name: "amy".into(),
                embedding: Embedding {
                    values: vec![0.1; 8],
                    model_version: Some("w600k_r50".into()),
                },
            },
        ]);

        gallery.write_cache(&cache).unwrap();
        let loaded = Gallery::read_cache(&cache).unwrap().unwrap();
        assert_eq!(loaded, gallery);
        assert_eq!(loaded.names().collect::<Vec<_>>(), vec!["zed", "amy"]);
        let values: Vec<&[f32]> = loaded.embeddings().map(|e| e.values.as_slice()).collect();
        let expected: Vec<&[f32]> = vec![&[0.25, -0.5, 1e-7], &[0.1; 8]];
        assert_eq!(values, expected);
    }

    #[test]
    fn test_corrupt_cache_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("encodings.msgpack");
        fs::write(&cache, b"\xc1garbage").unwrap();

        let mut analyzer = PixelAnalyzer { calls: 0 };
        let err = load_gallery(&cache, dir.path(), &mut analyzer).unwrap_err();
        assert!(matches!(err, GalleryError::CacheDecode { .. }));
    }

    #[test]
    fn test_missing_source_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = PixelAnalyzer { calls: 0 };
        let err = load_gallery(
            &dir.path().join("encodings.msgpack"),
            &dir.path().join("missing"),
            &mut analyzer,
        )
        .unwrap_err();
        assert!(matches!(err, GalleryError::Io { .. }));
    }

    #[test]
    fn test_undecodable_photo_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("alice")).unwrap();
        fs::write(dir.path().join("alice").join("broken.jpg"), b"not a jpeg").unwrap();

        let mut analyzer = PixelAnalyzer { calls: 0 };
        let err = scan_gallery(dir.path(), &mut analyzer).unwrap_err();
        assert!(matches!(err, GalleryError::Image { .. }));
    }
}
