//! The `engine` subcommand.

use clap::Args;

use crate::{async_utils::io::write_pretty_json, prelude::*, recognize::OcrEngine};

/// Engine command line arguments.
#[derive(Debug, Args)]
pub struct EngineOpts {
    /// The `tesseract` binary to use.
    #[clap(long, default_value = "tesseract")]
    pub tesseract: String,

    /// The output path to write the engine's capabilities to.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// The `engine` subcommand. Prints the OCR engine's versions and installed
/// languages.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_engine(opts: &EngineOpts) -> Result<()> {
    let engine = OcrEngine::tesseract(&opts.tesseract);
    let capabilities = engine
        .capabilities()
        .await
        .with_context(|| format!("cannot query {}", opts.tesseract))?;
    write_pretty_json(opts.output_path.as_deref(), capabilities).await
}
