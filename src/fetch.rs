//! Layer retrieval into a workspace's `input/` directory.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use reqwest::blocking::Client;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::config::LayerSpec;
use crate::error::{Error, Result};
use crate::layer::{stem, LayerKind};

/// Layer Retrieval capability.
pub trait LayerSource: Send + Sync {
    /// Places the layer in `input_dir`, overwriting any previous copy, and
    /// returns the path of the file to process. Archives are extracted and
    /// the path points at the layer inside them.
    fn fetch(&self, layer: &LayerSpec, input_dir: &Path) -> Result<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    /// Already in `input/`.
    Input,
    Local(PathBuf),
    Remote(String),
}

/// Fetches layers over HTTP(S) or from the local filesystem.
pub struct HttpLayerSource {
    client: Client,
}

impl HttpLayerSource {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("geogear/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }

    fn download(&self, layer: &str, url: &str, target: &Path) -> Result<()> {
        info!("Downloading {} from {}", layer, url);
        let mut response = self
            .client
            .get(url)
            .send()
            .map_err(|e| Error::retrieval(layer, format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::retrieval(
                layer,
                format!("{url} answered {}", response.status()),
            ));
        }

        let mut file = File::create(target)?;
        response
            .copy_to(&mut file)
            .map_err(|e| Error::retrieval(layer, format!("download from {url} failed: {e}")))?;
        Ok(())
    }
}

impl LayerSource for HttpLayerSource {
    fn fetch(&self, layer: &LayerSpec, input_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(input_dir)?;
        let archive = LayerKind::is_archive(&layer.filename);

        let location = locate(layer)?;
        if location == Location::Input {
            let path = input_dir.join(&layer.filename);
            if !path.exists() {
                return Err(Error::retrieval(
                    &layer.filename,
                    format!("no source URL and {} does not exist", path.display()),
                ));
            }
            if archive && is_zip(&path) {
                let extracted = extract_archive(&path, input_dir)?;
                return resolve_extracted(layer, &extracted);
            }
            return Ok(path);
        }

        // Archives land next to their contents and are removed once extracted.
        let staging = if archive {
            input_dir.join(format!("{}.download.zip", stem(&layer.filename)))
        } else {
            input_dir.join(&layer.filename)
        };

        match location {
            Location::Remote(url) => self.download(&layer.filename, &url, &staging)?,
            Location::Local(source) => {
                debug!("Copying {:?} to {:?}", source, staging);
                fs::copy(&source, &staging).map_err(|e| {
                    Error::retrieval(&layer.filename, format!("cannot copy {}: {e}", source.display()))
                })?;
            }
            Location::Input => {}
        }

        if !archive {
            return Ok(staging);
        }

        let extracted = extract_archive(&staging, input_dir);
        fs::remove_file(&staging)?;
        resolve_extracted(layer, &extracted?)
    }
}

fn locate(layer: &LayerSpec) -> Result<Location> {
    let url = layer.url.trim();
    if url.is_empty() {
        return Ok(Location::Input);
    }
    if let Some(path) = url.strip_prefix("file://") {
        return Ok(Location::Local(PathBuf::from(path)));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        if url.contains("drive.google.com") {
            let direct = drive_download_url(url).ok_or_else(|| {
                Error::retrieval(&layer.filename, format!("no file id in Google Drive URL {url}"))
            })?;
            return Ok(Location::Remote(direct));
        }
        return Ok(Location::Remote(url.to_string()));
    }
    Ok(Location::Local(PathBuf::from(url)))
}

/// Rewrites a Drive share link (`.../file/d/<id>/view`) to a direct download.
pub fn drive_download_url(url: &str) -> Option<String> {
    let id = url
        .split('/')
        .skip_while(|segment| *segment != "d")
        .nth(1)
        .map(|id| id.split(['?', '#']).next().unwrap_or(id))
        .filter(|id| !id.is_empty())?;
    Some(format!(
        "https://drive.google.com/uc?export=download&id={id}"
    ))
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .and_then(|s| s.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

fn extract_archive(archive: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    let mut extracted = Vec::with_capacity(zip.len());

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry {:?}", entry.name());
            continue;
        };
        let target = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        extracted.push(target);
    }

    extracted.sort();
    debug!("Extracted {} files from {:?}", extracted.len(), archive);
    Ok(extracted)
}

/// Picks the layer file among an archive's contents: the `.shp` of the same
/// name, or for `.zip` layers the vector sharing the archive's stem, falling
/// back to the first vector.
fn resolve_extracted(layer: &LayerSpec, extracted: &[PathBuf]) -> Result<PathBuf> {
    let file_name = |p: &PathBuf| p.file_name().and_then(|s| s.to_str()).map(str::to_string);

    if let Some(found) = extracted
        .iter()
        .find(|p| file_name(p).as_deref() == Some(layer.filename.as_str()))
    {
        return Ok(found.clone());
    }

    let vectors: Vec<&PathBuf> = extracted
        .iter()
        .filter(|p| {
            file_name(p).is_some_and(|name| {
                LayerKind::classify(&name) == LayerKind::Vector && !LayerKind::is_archive(&name)
            })
        })
        .collect();

    let wanted = layer.name();
    vectors
        .iter()
        .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(wanted))
        .or_else(|| vectors.first())
        .map(|p| (*p).clone())
        .ok_or_else(|| {
            Error::retrieval(&layer.filename, "archive holds no readable vector layer")
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(File::create(path).unwrap());
        for (name, content) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(content).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_drive_url_rewrite() {
        assert_eq!(
            drive_download_url("https://drive.google.com/file/d/1AbC-xyz/view?usp=sharing").as_deref(),
            Some("https://drive.google.com/uc?export=download&id=1AbC-xyz")
        );
        assert_eq!(drive_download_url("https://drive.google.com/drive/folders"), None);
    }

    #[test]
    fn test_drive_url_without_id_is_a_retrieval_error() {
        let layer = LayerSpec::new("forest.shp", "https://drive.google.com/open");
        assert!(matches!(locate(&layer), Err(Error::Retrieval { .. })));
    }

    #[test]
    fn test_copy_plain_path_and_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("elevation.tif");
        fs::write(&source, b"new").unwrap();
        let input = temp_dir.path().join("input");
        fs::create_dir_all(&input).unwrap();
        fs::write(input.join("elevation.tif"), b"old").unwrap();

        let fetcher = HttpLayerSource::new().unwrap();
        let layer = LayerSpec::new("elevation.tif", source.to_str().unwrap());
        let path = fetcher.fetch(&layer, &input).unwrap();

        assert_eq!(path, input.join("elevation.tif"));
        assert_eq!(fs::read(&path).unwrap(), b"new");
    }

    #[test]
    fn test_file_url_shapefile_archive_is_extracted() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("forest_upload.zip");
        write_zip(
            &archive,
            &[
                ("forest.shp", b"shp"),
                ("forest.shx", b"shx"),
                ("forest.dbf", b"dbf"),
                ("forest.prj", b"prj"),
            ],
        );
        let input = temp_dir.path().join("input");

        let fetcher = HttpLayerSource::new().unwrap();
        let url = format!("file://{}", archive.display());
        let path = fetcher
            .fetch(&LayerSpec::new("forest.shp", url), &input)
            .unwrap();

        assert_eq!(path, input.join("forest.shp"));
        assert_eq!(fs::read(&path).unwrap(), b"shp");
        assert!(input.join("forest.dbf").exists());
        assert!(!input.join("forest.download.zip").exists());
    }

    #[test]
    fn test_zip_layer_resolves_matching_vector() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("src.zip");
        write_zip(
            &archive,
            &[
                ("roads/readme.txt", b"x"),
                ("roads/other.gpkg", b"o"),
                ("roads/roads.gpkg", b"r"),
            ],
        );
        let input = temp_dir.path().join("input");

        let fetcher = HttpLayerSource::new().unwrap();
        let layer = LayerSpec::new("roads.zip", archive.to_str().unwrap());
        let path = fetcher.fetch(&layer, &input).unwrap();

        assert_eq!(path, input.join("roads").join("roads.gpkg"));
    }

    #[test]
    fn test_archive_without_vector_fails() {
        let temp_dir = TempDir::new().unwrap();
        let archive = temp_dir.path().join("src.zip");
        write_zip(&archive, &[("notes.txt", b"x")]);

        let fetcher = HttpLayerSource::new().unwrap();
        let layer = LayerSpec::new("roads.zip", archive.to_str().unwrap());
        let err = fetcher
            .fetch(&layer, &temp_dir.path().join("input"))
            .unwrap_err();
        assert!(matches!(err, Error::Retrieval { .. }), "got {err:?}");
    }

    #[test]
    fn test_empty_url_requires_existing_input() {
        let temp_dir = TempDir::new().unwrap();
        let input = temp_dir.path().join("input");
        let fetcher = HttpLayerSource::new().unwrap();

        let layer = LayerSpec::new("mask.gpkg", "");
        assert!(matches!(
            fetcher.fetch(&layer, &input),
            Err(Error::Retrieval { .. })
        ));

        fs::write(input.join("mask.gpkg"), b"gpkg").unwrap();
        assert_eq!(fetcher.fetch(&layer, &input).unwrap(), input.join("mask.gpkg"));
    }

    #[test]
    fn test_missing_local_source_is_a_retrieval_error() {
        let temp_dir = TempDir::new().unwrap();
        let fetcher = HttpLayerSource::new().unwrap();
        let layer = LayerSpec::new("dem.tif", "/nonexistent/geogear/dem.tif");
        let err = fetcher
            .fetch(&layer, &temp_dir.path().join("input"))
            .unwrap_err();
        assert!(matches!(err, Error::Retrieval { .. }));
    }
}
