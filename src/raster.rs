//! Splitting multi-page documents into page images.
//!
//! External converters like `pdftoppm` only work on files, so we write the
//! document to a temporary file, convert it into a private scratch directory,
//! and read the pages back into memory. Both the temporary file and the
//! scratch directory are removed when [`ScratchSpace`] is dropped, which
//! happens on every exit path, including errors and panics.

use std::{
    ffi::OsString,
    fs,
    io::Write as _,
    sync::{Arc, LazyLock},
};

use regex::Regex;
use tempfile::{NamedTempFile, TempDir};

use crate::{
    async_utils::{
        check_for_command_failure, run_command, spawn_blocking_propagating_panics,
    },
    document::{PageImage, SourceDocument},
    error::RasterError,
    prelude::*,
};

/// File name prefix for the page images in the scratch directory.
const PAGE_PREFIX: &str = "page";

/// Trailing page number in a generated file name, like `page-07.ppm`.
static PAGE_INDEX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?P<index>\d+)\.[[:alnum:]]+$").expect("failed to compile regex")
});

/// A page image written by a [`PageConverter`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageArtifact {
    /// Where the page image was written.
    pub path: PathBuf,
    /// The 1-based page number, if the converter knows it. Otherwise we
    /// parse it out of the file name.
    pub ordinal: Option<usize>,
}

/// Interface to an external document-to-images converter.
#[async_trait]
pub trait PageConverter: Send + Sync + 'static {
    /// A short name for logs and error messages.
    fn name(&self) -> &str;

    /// Convert the document at `input` into one image per page. Every image
    /// must be written to the directory containing `output_prefix`, with a
    /// file name starting with the last component of `output_prefix`.
    async fn convert(
        &self,
        input: &Path,
        output_prefix: &Path,
    ) -> Result<Vec<PageArtifact>, RasterError>;
}

/// Converter wrapping the `pdftoppm` CLI tool from `poppler-utils`.
pub struct PdfToPpm {
    /// The `pdftoppm` binary to run.
    program: String,
    /// Resolution to render at. `pdftoppm` uses 150 DPI if unset.
    dpi: Option<u32>,
}

impl PdfToPpm {
    /// Create a new `pdftoppm` converter.
    pub fn new(program: impl Into<String>, dpi: Option<u32>) -> Self {
        Self {
            program: program.into(),
            dpi,
        }
    }
}

#[async_trait]
impl PageConverter for PdfToPpm {
    fn name(&self) -> &str {
        &self.program
    }

    #[instrument(level = "debug", skip_all, fields(input = %input.display()))]
    async fn convert(
        &self,
        input: &Path,
        output_prefix: &Path,
    ) -> Result<Vec<PageArtifact>, RasterError> {
        let mut args: Vec<OsString> = vec![];
        if let Some(dpi) = self.dpi {
            args.push("-r".into());
            args.push(dpi.to_string().into());
        }
        args.push(input.into());
        args.push(output_prefix.into());

        let output = run_command(&self.program, &args).await.map_err(|source| {
            RasterError::ConverterUnavailable {
                program: self.program.clone(),
                source,
            }
        })?;
        check_for_command_failure(&self.program, &output)
            .map_err(RasterError::ConverterFailed)?;

        // `pdftoppm` doesn't tell us what it wrote, so look.
        let dir = output_prefix.parent().unwrap_or_else(|| Path::new("."));
        list_artifacts(dir)
    }
}

/// List every file in `dir` as an artifact without a known ordinal.
pub fn list_artifacts(dir: &Path) -> Result<Vec<PageArtifact>, RasterError> {
    let mut artifacts = vec![];
    for entry in fs::read_dir(dir).map_err(RasterError::Scratch)? {
        let entry = entry.map_err(RasterError::Scratch)?;
        if entry.file_type().map_err(RasterError::Scratch)?.is_file() {
            artifacts.push(PageArtifact {
                path: entry.path(),
                ordinal: None,
            });
        }
    }
    Ok(artifacts)
}

/// Parse the page number from a generated file name.
fn page_index_from_name(path: &Path) -> Option<usize> {
    let file_name = path.file_name()?.to_str()?;
    PAGE_INDEX_REGEX
        .captures(file_name)?
        .name("index")?
        .as_str()
        .parse()
        .ok()
}

/// Put artifacts in page order.
///
/// We sort by the ordinal the converter reported, falling back to the number
/// in the file name. Sorting never depends on directory listing order.
fn order_artifacts(artifacts: Vec<PageArtifact>) -> Vec<PathBuf> {
    let mut keyed = artifacts
        .into_iter()
        .map(|artifact| {
            let ordinal = artifact
                .ordinal
                .or_else(|| page_index_from_name(&artifact.path))
                .unwrap_or_else(|| {
                    warn!(
                        path = %artifact.path.display(),
                        "cannot determine page number of page image, assuming page 1"
                    );
                    1
                });
            (ordinal, artifact.path)
        })
        .collect::<Vec<_>>();
    keyed.sort();

    let contiguous = keyed
        .iter()
        .enumerate()
        .all(|(position, (ordinal, _))| *ordinal == position + 1);
    if !contiguous {
        warn!(
            ordinals = ?keyed.iter().map(|(ordinal, _)| *ordinal).collect::<Vec<_>>(),
            "page numbers are not contiguous from 1; renumbering in sorted order"
        );
    }
    keyed.into_iter().map(|(_, path)| path).collect()
}

/// Read and decode page images, deleting each file once it's in memory.
fn decode_artifacts(
    source: Arc<str>,
    paths: Vec<PathBuf>,
) -> Result<Vec<PageImage>, RasterError> {
    let mut pages = Vec::with_capacity(paths.len());
    for (position, path) in paths.into_iter().enumerate() {
        let index = position + 1;
        let bytes = fs::read(&path).map_err(|source| RasterError::ReadArtifact {
            path: path.clone(),
            source,
        })?;

        // Recover space a bit early.
        if let Err(err) = fs::remove_file(&path) {
            debug!(path = %path.display(), "failed to delete page image early: {}", err);
        }

        let page = PageImage::decode(source.clone(), index, &bytes)
            .map_err(|source| RasterError::Decode { page: index, source })?;
        pages.push(page);
    }
    Ok(pages)
}

/// The on-disk working set of one rasterization.
///
/// This is released by [`Drop`].
struct ScratchSpace {
    /// The document, written out for the converter.
    input: Option<NamedTempFile>,
    input_path: PathBuf,
    /// Where the converter writes its page images.
    dir: Option<TempDir>,
    dir_path: PathBuf,
}

impl ScratchSpace {
    /// Write `document` to a temporary file and create an empty scratch
    /// directory.
    fn create(document: &SourceDocument) -> Result<Self, RasterError> {
        let mut input = tempfile::Builder::new()
            .prefix("document")
            .suffix(".pdf")
            .tempfile()
            .map_err(RasterError::Scratch)?;
        input
            .write_all(&document.bytes)
            .map_err(RasterError::Scratch)?;
        input.flush().map_err(RasterError::Scratch)?;
        let dir = TempDir::with_prefix("pages").map_err(RasterError::Scratch)?;
        Ok(Self {
            input_path: input.path().to_owned(),
            input: Some(input),
            dir_path: dir.path().to_owned(),
            dir: Some(dir),
        })
    }
}

impl Drop for ScratchSpace {
    fn drop(&mut self) {
        if let Some(input) = self.input.take() {
            if let Err(err) = input.close() {
                error!(
                    path = ?self.input_path.display(),
                    "failed to delete temporary file: {}",
                    err
                );
            }
        }
        if let Some(dir) = self.dir.take() {
            if let Err(err) = dir.close() {
                error!(
                    directory = ?self.dir_path.display(),
                    "failed to delete temporary directory: {}",
                    err
                );
            }
        }
    }
}

/// Turns multi-page documents into ordered page images.
#[derive(Clone)]
pub struct Rasterizer {
    converter: Arc<dyn PageConverter>,
}

impl Rasterizer {
    /// Create a rasterizer using `converter`.
    pub fn new(converter: Arc<dyn PageConverter>) -> Self {
        Self { converter }
    }

    /// Split `document` into page images, in ascending page order.
    #[instrument(
        level = "debug",
        skip_all,
        fields(uri = %document.uri, converter = self.converter.name())
    )]
    pub async fn rasterize(
        &self,
        document: &SourceDocument,
    ) -> Result<Vec<PageImage>, RasterError> {
        let scratch = ScratchSpace::create(document)?;
        let output_prefix = scratch.dir_path.join(PAGE_PREFIX);

        let artifacts = self
            .converter
            .convert(&scratch.input_path, &output_prefix)
            .await?;
        if artifacts.is_empty() {
            return Err(RasterError::NoPages {
                program: self.converter.name().to_owned(),
            });
        }
        let paths = order_artifacts(artifacts);
        debug!(pages = paths.len(), "Rasterized document");

        let source = document.uri.clone();
        let pages =
            spawn_blocking_propagating_panics(move || decode_artifacts(source, paths))
                .await?;
        drop(scratch);
        Ok(pages)
    }
}
