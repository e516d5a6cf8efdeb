use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use liber_core::{
    DocumentBackend, DocumentFormat, DocumentInfo, DocumentMetadata, DocumentProvider,
    PageContent, RenderRequest,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};
use zip::ZipArchive;

use crate::decode_page;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif"];

/// One page of a comic archive. The bytes stay compressed in the archive
/// until the page is rendered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    pub name: String,
    pub archive_index: usize,
}

pub fn is_image_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.iter().any(|known| ext.eq_ignore_ascii_case(known)))
        .unwrap_or(false)
}

/// Image entries of the archive in reading order: by name, ignoring case.
pub fn list_image_entries<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<Vec<ImageEntry>> {
    let mut entries = Vec::new();
    for archive_index in 0..archive.len() {
        let file = archive
            .by_index(archive_index)
            .with_context(|| format!("failed to read archive entry {}", archive_index))?;
        if file.is_dir() || !is_image_name(file.name()) {
            continue;
        }
        entries.push(ImageEntry {
            name: file.name().to_string(),
            archive_index,
        });
    }
    entries.sort_by_cached_key(|entry| (entry.name.to_lowercase(), entry.name.clone()));
    Ok(entries)
}

#[derive(Debug, Default)]
pub struct CbzProvider;

#[async_trait]
impl DocumentProvider for CbzProvider {
    fn supports(&self, format: DocumentFormat) -> bool {
        format == DocumentFormat::Cbz
    }

    #[instrument(skip(self))]
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let path = path.to_path_buf();
        let document = tokio::task::spawn_blocking(move || CbzDocument::open(&path))
            .await
            .context("archive loader stopped")??;
        Ok(Arc::new(document))
    }
}

pub struct CbzDocument {
    path: PathBuf,
    info: DocumentInfo,
    entries: Vec<ImageEntry>,
    archive: Mutex<ZipArchive<BufReader<File>>>,
}

impl CbzDocument {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
        let mut archive = ZipArchive::new(BufReader::new(file))
            .with_context(|| format!("{:?} is not a readable comic archive", path))?;
        let entries = list_image_entries(&mut archive)?;

        let metadata = DocumentMetadata {
            title: path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
            author: None,
        };
        let info = DocumentInfo::new(path, DocumentFormat::Cbz, entries.len(), metadata);
        info!(
            path = ?path,
            entries = archive.len(),
            pages = entries.len(),
            "comic archive loaded"
        );

        Ok(Self {
            path: path.to_path_buf(),
            info,
            entries,
            archive: Mutex::new(archive),
        })
    }

    pub fn entries(&self) -> &[ImageEntry] {
        &self.entries
    }

    fn read_entry(&self, entry: &ImageEntry) -> Result<Vec<u8>> {
        let mut archive = self.archive.lock();
        let mut file = archive
            .by_index(entry.archive_index)
            .with_context(|| format!("failed to locate {} in {:?}", entry.name, self.path))?;
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .with_context(|| format!("failed to inflate {}", entry.name))?;
        Ok(buf)
    }
}

impl DocumentBackend for CbzDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn render_page(&self, request: RenderRequest) -> Result<PageContent> {
        let entry = self
            .entries
            .get(request.page_index)
            .ok_or_else(|| anyhow!("page {} out of range", request.page_index))?;
        let bytes = self.read_entry(entry)?;
        debug!(page = request.page_index, name = %entry.name, bytes = bytes.len(), "decoding page");
        let image = decode_page(&bytes, request.dark_mode)
            .with_context(|| format!("failed to decode {}", entry.name))?;
        Ok(PageContent::Image(image))
    }
}
