//! The `ocr` subcommand.

use std::{pin::pin, sync::Arc};

use clap::Args;
use futures::{StreamExt as _, stream};

use crate::{
    async_utils::io::JsonlWriter,
    pipeline::{Pipeline, PipelineOptions},
    prelude::*,
    store::{JobStatus, MemoryJobStore},
    ui::{ProgressConfig, Ui},
};

/// OCR command line arguments.
#[derive(Debug, Args)]
pub struct OcrOpts {
    /// URIs of the images or PDFs to OCR. `http`, `https` and `file` URIs
    /// are supported.
    #[clap(required = true, value_name = "URI")]
    pub uris: Vec<String>,

    /// A description to record with each job. Defaults to the URI.
    #[clap(long)]
    pub description: Option<String>,

    #[clap(flatten)]
    pub pipeline: PipelineOptions,

    /// Max number of documents to process at a time.
    #[clap(short = 'J', long = "jobs", default_value = "4")]
    pub job_count: usize,

    /// What portion of jobs should we allow to fail? Specified as a number
    /// between 0.0 and 1.0.
    #[clap(long, default_value = "0.0")]
    pub allowed_failure_rate: f32,

    /// The output path to write job reports to, one JSON object per line.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `ocr` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_ocr(ui: Ui, opts: &OcrOpts) -> Result<()> {
    let job_pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "📄",
            msg: "OCRing documents",
            done_msg: "OCRed documents",
        },
        opts.uris.len() as u64,
    );
    let page_pb = ui.new_progress_bar(
        &ProgressConfig {
            emoji: "🔎",
            msg: "Recognizing pages",
            done_msg: "Recognized pages",
        },
        0,
    );

    let store = Arc::new(MemoryJobStore::new());
    let pipeline =
        Pipeline::from_options(&opts.pipeline, store)?.with_page_progress(page_pb);
    let pipeline = &pipeline;
    let lang = opts.pipeline.lang.as_str();

    // Jobs may finish in any order, but we report them in the order given.
    let mut reports = pin!(
        stream::iter(&opts.uris)
            .map(move |uri| async move {
                let description = opts.description.as_deref().unwrap_or(uri.as_str());
                let job_id = pipeline.submit(uri, description).await?;
                let result = pipeline.run_job(job_id, lang).await;
                let report = pipeline.report(job_id, result).await?;
                Ok::<_, anyhow::Error>(report)
            })
            .buffered(opts.job_count.max(1))
    );

    let mut writer = JsonlWriter::create(opts.output_path.as_deref()).await?;
    let mut total_count = 0;
    let mut failure_count = 0;
    while let Some(report) = reports.next().await {
        let report = report?;
        total_count += 1;
        if report.job.status != JobStatus::Complete {
            failure_count += 1;
        }
        writer.write(&report).await?;
        job_pb.inc(1);
    }
    writer.finish().await?;

    let failure_rate = failure_count as f32 / total_count.max(1) as f32;
    if failure_rate > opts.allowed_failure_rate {
        Err(anyhow!(
            "{}/{} ({:.2}%) of jobs failed, but only {:.2}% were allowed",
            failure_count,
            total_count,
            failure_rate * 100.0,
            opts.allowed_failure_rate * 100.0
        ))
    } else {
        if failure_count > 0 {
            ui.display_message(
                "❌",
                &format!("{} documents could not be processed", failure_count),
            );
        }
        Ok(())
    }
}
