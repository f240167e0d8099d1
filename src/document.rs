//! Documents and pages while a job is running.
//!
//! None of these types are persisted. A [`SourceDocument`] lives only until it
//! has been split into [`PageImage`]s, and each page lives only until it has
//! been recognized.

use std::{fmt, io::Cursor, sync::Arc};

use image::{DynamicImage, ImageFormat};
use schemars::JsonSchema;

use crate::prelude::*;

/// The MIME type we report when we can't work out what an image is.
const UNKNOWN_MIME_TYPE: &str = "application/octet-stream";

/// Get the token after the last `.` in a URI, if there is one.
pub fn uri_extension(uri: &str) -> Option<&str> {
    uri.rsplit_once('.').map(|(_, ext)| ext)
}

/// How should we split a document into pages?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentKind {
    /// A multi-page container which must be rasterized.
    Pdf,
    /// A single raster image.
    Image,
}

impl DocumentKind {
    /// Classify a document by the extension token of its URI.
    ///
    /// The match is exact and case-sensitive. Anything that isn't `pdf` is
    /// treated as a single image.
    pub fn from_uri(uri: &str) -> Self {
        match uri_extension(uri) {
            Some("pdf") => DocumentKind::Pdf,
            _ => DocumentKind::Image,
        }
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Pdf => write!(f, "pdf"),
            DocumentKind::Image => write!(f, "image"),
        }
    }
}

/// A fully-buffered remote document.
pub struct SourceDocument {
    /// Where we got this document.
    pub uri: Arc<str>,
    /// The complete contents.
    pub bytes: Vec<u8>,
}

impl fmt::Debug for SourceDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDocument")
            .field("uri", &self.uri)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl SourceDocument {
    /// Wrap a buffer downloaded from `uri`.
    pub fn new(uri: impl Into<Arc<str>>, bytes: Vec<u8>) -> Self {
        Self {
            uri: uri.into(),
            bytes,
        }
    }

    /// The kind of document, as declared by the URI.
    pub fn kind(&self) -> DocumentKind {
        DocumentKind::from_uri(&self.uri)
    }

    /// The size of the document in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Is the document empty?
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The MIME type sniffed from the document's contents.
    pub fn detected_mime_type(&self) -> Option<&'static str> {
        infer::get(&self.bytes).map(|kind| kind.mime_type())
    }

    /// Decode a single-image document into page 1.
    pub fn decode_single_page(&self) -> Result<PageImage, image::ImageError> {
        PageImage::decode(self.uri.clone(), 1, &self.bytes)
    }
}

/// One decoded page of a document.
pub struct PageImage {
    /// 1-based position of this page in the document.
    pub index: usize,
    /// The decoded pixels.
    pub image: DynamicImage,
    /// The MIME type of the encoded page we decoded.
    pub mime_type: &'static str,
    /// The size of the encoded page in bytes.
    pub size_bytes: usize,
    /// The URI of the document this page came from.
    pub source: Arc<str>,
}

impl fmt::Debug for PageImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageImage")
            .field("index", &self.index)
            .field("width", &self.image.width())
            .field("height", &self.image.height())
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .field("source", &self.source)
            .finish()
    }
}

impl PageImage {
    /// Decode an encoded image as page `index` of `source`.
    pub fn decode(
        source: Arc<str>,
        index: usize,
        bytes: &[u8],
    ) -> Result<Self, image::ImageError> {
        let format = image::guess_format(bytes)?;
        let image = image::load_from_memory_with_format(bytes, format)?;
        Ok(Self {
            index,
            image,
            mime_type: mime_type_for_format(format),
            size_bytes: bytes.len(),
            source,
        })
    }
}

/// Encode an image as a PNG.
pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, image::ImageError> {
    let mut png_bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut png_bytes), ImageFormat::Png)?;
    Ok(png_bytes)
}

fn mime_type_for_format(format: ImageFormat) -> &'static str {
    let mime_type = format.to_mime_type();
    if mime_type.is_empty() {
        UNKNOWN_MIME_TYPE
    } else {
        mime_type
    }
}

/// What happened when we tried to OCR a page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PageOutcome {
    /// Recognition succeeded. The text may be empty for a blank page.
    Ok { text: String },
    /// Recognition failed for this page.
    Failed { error: String },
}

/// The result of OCRing one page.
#[derive(Clone, Debug, JsonSchema, PartialEq, Eq, Serialize)]
pub struct PageResult {
    /// 1-based page number.
    pub page: usize,

    /// The recognized text, or the reason there isn't any.
    #[serde(flatten)]
    pub outcome: PageOutcome,
}

impl PageResult {
    /// The recognized text, if recognition succeeded.
    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            PageOutcome::Ok { text } => Some(text),
            PageOutcome::Failed { .. } => None,
        }
    }

    /// Did recognition succeed?
    pub fn is_ok(&self) -> bool {
        matches!(self.outcome, PageOutcome::Ok { .. })
    }
}
