use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ::epub::doc::EpubDoc;
use liber_core::{
    DocumentBackend, DocumentFormat, DocumentInfo, DocumentMetadata, DocumentProvider,
    PageContent, RenderRequest,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

const NCX_MIME: &str = "application/x-dtbncx+xml";

type Book = EpubDoc<BufReader<File>>;

#[derive(Debug, Default)]
pub struct EpubProvider;

#[async_trait]
impl DocumentProvider for EpubProvider {
    fn supports(&self, format: DocumentFormat) -> bool {
        format == DocumentFormat::Epub
    }

    #[instrument(skip(self))]
    async fn open(&self, path: &Path) -> Result<Arc<dyn DocumentBackend>> {
        let path = path.to_path_buf();
        let document = tokio::task::spawn_blocking(move || EpubDocument::open(&path))
            .await
            .context("e-book loader stopped")??;
        Ok(Arc::new(document))
    }
}

/// Every readable spine item is one page; the text is reflowed on render.
pub struct EpubDocument {
    info: DocumentInfo,
    chapters: Vec<usize>,
    book: Mutex<Book>,
}

impl EpubDocument {
    pub fn open(path: &Path) -> Result<Self> {
        let book = EpubDoc::new(path).with_context(|| format!("failed to open e-book {:?}", path))?;
        let chapters = reading_order(&book);

        let metadata = DocumentMetadata {
            title: book.mdata("title").map(|item| item.value.clone()),
            author: book.mdata("creator").map(|item| item.value.clone()),
        };
        let info = DocumentInfo::new(path, DocumentFormat::Epub, chapters.len(), metadata);
        info!(
            path = ?path,
            spine = book.spine.len(),
            pages = chapters.len(),
            "e-book loaded"
        );

        Ok(Self {
            info,
            chapters,
            book: Mutex::new(book),
        })
    }

    fn chapter_html(&self, spine_index: usize) -> Result<String> {
        let mut book = self.book.lock();
        if !book.set_current_chapter(spine_index) {
            return Err(anyhow!("spine item {} is missing", spine_index));
        }
        book.get_current_str()
            .map(|(content, _mime)| content)
            .ok_or_else(|| anyhow!("spine item {} has no readable content", spine_index))
    }
}

/// Spine positions that hold reading content, skipping the NCX and EPUB 3
/// navigation documents.
fn reading_order(book: &Book) -> Vec<usize> {
    book.spine
        .iter()
        .enumerate()
        .filter(|(_, item)| match book.resources.get(&item.idref) {
            Some(resource) => {
                let is_nav = resource
                    .properties
                    .as_deref()
                    .map(|props| props.split_whitespace().any(|prop| prop == "nav"))
                    .unwrap_or(false);
                resource.mime != NCX_MIME && !is_nav
            }
            None => true,
        })
        .map(|(index, _)| index)
        .collect()
}

impl DocumentBackend for EpubDocument {
    fn info(&self) -> &DocumentInfo {
        &self.info
    }

    fn render_page(&self, request: RenderRequest) -> Result<PageContent> {
        let spine_index = *self
            .chapters
            .get(request.page_index)
            .ok_or_else(|| anyhow!("page {} out of range", request.page_index))?;
        let html = self.chapter_html(spine_index)?;
        debug!(page = request.page_index, spine_index, width = request.text_width, "laying out chapter");
        let text = html2text::config::plain()
            .string_from_read(html.as_bytes(), request.text_width)
            .map_err(|err| anyhow!("failed to lay out chapter {}: {}", spine_index, err))?;
        Ok(PageContent::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::fixtures;
    use tempfile::tempdir;

    const CONTAINER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>"#;

    const OPF: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="2.0" unique-identifier="bookid">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>Meditations</dc:title>
    <dc:creator>Marcus Aurelius</dc:creator>
    <dc:identifier id="bookid">urn:uuid:liber-test</dc:identifier>
    <dc:language>en</dc:language>
  </metadata>
  <manifest>
    <item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>
    <item id="one" href="one.xhtml" media-type="application/xhtml+xml"/>
    <item id="two" href="two.xhtml" media-type="application/xhtml+xml"/>
  </manifest>
  <spine toc="ncx">
    <itemref idref="one"/>
    <itemref idref="two"/>
  </spine>
</package>"#;

    const NCX: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1">
  <head><meta name="dtb:uid" content="urn:uuid:liber-test"/></head>
  <docTitle><text>Meditations</text></docTitle>
  <navMap>
    <navPoint id="p1" playOrder="1"><navLabel><text>One</text></navLabel><content src="one.xhtml"/></navPoint>
    <navPoint id="p2" playOrder="2"><navLabel><text>Two</text></navLabel><content src="two.xhtml"/></navPoint>
  </navMap>
</ncx>"#;

    fn chapter(body: &str) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>c</title></head><body>{}</body></html>"#,
            body
        )
        .into_bytes()
    }

    fn write_book(path: &Path) {
        fixtures::write_zip(
            path,
            &[
                ("mimetype", b"application/epub+zip".to_vec()),
                ("META-INF/container.xml", CONTAINER.as_bytes().to_vec()),
                ("OEBPS/content.opf", OPF.as_bytes().to_vec()),
                ("OEBPS/toc.ncx", NCX.as_bytes().to_vec()),
                (
                    "OEBPS/one.xhtml",
                    chapter("<h1>Book One</h1><p>From my grandfather Verus I learned good morals.</p>"),
                ),
                ("OEBPS/two.xhtml", chapter("<p>Begin the morning by saying to thyself.</p>")),
            ],
        );
    }

    #[test]
    fn chapters_become_pages() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("meditations.epub");
        write_book(&path);

        let doc = EpubDocument::open(&path).unwrap();
        let info = doc.info();
        assert_eq!(info.page_count, 2);
        assert_eq!(info.format, DocumentFormat::Epub);
        assert_eq!(info.metadata.title.as_deref(), Some("Meditations"));
        assert_eq!(info.metadata.author.as_deref(), Some("Marcus Aurelius"));

        let second = doc
            .render_page(RenderRequest {
                page_index: 1,
                ..RenderRequest::default()
            })
            .unwrap();
        match second {
            PageContent::Text(text) => assert!(text.contains("Begin the morning")),
            other => panic!("unexpected page: {:?}", other),
        }
    }

    #[test]
    fn narrow_width_wraps_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("narrow.epub");
        write_book(&path);

        let doc = EpubDocument::open(&path).unwrap();
        let page = doc
            .render_page(RenderRequest {
                page_index: 0,
                dark_mode: false,
                text_width: 20,
            })
            .unwrap();
        match page {
            PageContent::Text(text) => {
                assert!(text.lines().count() > 2);
                assert!(text.lines().all(|line| line.chars().count() <= 20));
            }
            other => panic!("unexpected page: {:?}", other),
        }
    }

    #[test]
    fn not_an_epub_fails_to_open() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fake.epub");
        fixtures::write_zip(&path, &[("hello.txt", b"hi".to_vec())]);
        assert!(EpubDocument::open(&path).is_err());
    }

    #[tokio::test]
    async fn provider_loads_the_book_on_a_blocking_thread() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("provided.epub");
        write_book(&path);

        let backend = EpubProvider.open(&path).await.unwrap();
        assert_eq!(backend.info().page_count, 2);
    }
}
