//! The `text` subcommand.

use std::sync::Arc;

use clap::Args;
use tokio::io::AsyncWriteExt as _;

use crate::{
    async_utils::io::create_writer,
    document::PageOutcome,
    pipeline::{Pipeline, PipelineOptions},
    prelude::*,
    store::MemoryJobStore,
};

/// Text command line arguments.
#[derive(Debug, Args)]
pub struct TextOpts {
    /// URI of the image or PDF to OCR.
    #[clap(value_name = "URI")]
    pub uri: String,

    #[clap(flatten)]
    pub pipeline: PipelineOptions,

    /// The output path to write the recognized text to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `text` subcommand. OCRs a single document and prints the text of
/// each page, in page order.
#[instrument(level = "debug", skip_all, fields(uri = %opts.uri))]
pub async fn cmd_text(opts: &TextOpts) -> Result<()> {
    let store = Arc::new(MemoryJobStore::new());
    let pipeline = Pipeline::from_options(&opts.pipeline, store)?;
    let pages = pipeline
        .run(&opts.uri, &opts.pipeline.lang)
        .await
        .with_context(|| format!("cannot OCR {}", opts.uri))?;

    let mut wtr = create_writer(opts.output_path.as_deref()).await?;
    let mut failed = 0;
    for page in &pages {
        match page.text() {
            Some(text) => wtr
                .write_all(text.as_bytes())
                .await
                .context("Failed to write text to output")?,
            None => {
                failed += 1;
                if let PageOutcome::Failed { error } = &page.outcome {
                    warn!(page = page.page, error = %error, "Skipping unrecognized page");
                }
            }
        }
    }
    wtr.flush().await.context("Failed to flush output")?;

    if failed > 0 {
        Err(anyhow!(
            "{}/{} pages of {} could not be recognized",
            failed,
            pages.len(),
            opts.uri
        ))
    } else {
        Ok(())
    }
}
