use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use liber_core::{DocumentBackend, DocumentFormat, DocumentProvider, RenderImage};

mod cbz;
#[cfg(feature = "epub")]
mod ebook;

pub use cbz::{is_image_name, list_image_entries, CbzDocument, CbzProvider, ImageEntry};
#[cfg(feature = "epub")]
pub use ebook::{EpubDocument, EpubProvider};

/// Dispatches a file to the handler for its format.
#[derive(Default)]
pub struct FormatProvider {
    cbz: CbzProvider,
    #[cfg(feature = "epub")]
    epub: EpubProvider,
}

impl FormatProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentProvider for FormatProvider {
    fn supports(&self, format: DocumentFormat) -> bool {
        match format {
            DocumentFormat::Cbz => true,
            DocumentFormat::Epub => cfg!(feature = "epub"),
        }
    }

    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        match DocumentFormat::from_path(path) {
            Some(DocumentFormat::Cbz) => self.cbz.open(path).await,
            #[cfg(feature = "epub")]
            Some(DocumentFormat::Epub) => self.epub.open(path).await,
            _ => Err(anyhow!("no handler for {:?}", path)),
        }
    }
}

/// Decodes an encoded page into RGBA pixels. Dark mode inverts the colour
/// channels and leaves alpha alone.
pub fn decode_page(bytes: &[u8], dark_mode: bool) -> Result<RenderImage> {
    let decoded = image::load_from_memory(bytes).context("unsupported or corrupt image")?;
    let mut rgba = decoded.to_rgba8();
    if dark_mode {
        for pixel in rgba.pixels_mut() {
            pixel.0[0] = 255 - pixel.0[0];
            pixel.0[1] = 255 - pixel.0[1];
            pixel.0[2] = 255 - pixel.0[2];
        }
    }
    Ok(RenderImage {
        width: rgba.width(),
        height: rgba.height(),
        pixels: rgba.into_raw(),
    })
}
