//! Output utilities.
//!
//! Job reports are written as JSONL, either to a file or to standard output.

use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write `value` as pretty-printed JSON to a file or stdout.
pub async fn write_pretty_json<T: Serialize>(path: Option<&Path>, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;
    let mut wtr = create_writer(path).await?;
    wtr.write_all(json.as_bytes())
        .await
        .context("Failed to write JSON to output")?;
    wtr.write_all(b"\n")
        .await
        .context("Failed to write newline to output")?;
    wtr.flush().await.context("Failed to flush output")
}

/// Writes one JSON record per line.
pub struct JsonlWriter {
    writer: BufWriter<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>>,
}

impl JsonlWriter {
    /// Open a writer for a file, or for standard output if `path` is `None`.
    pub async fn create(path: Option<&Path>) -> Result<Self> {
        Ok(Self {
            writer: BufWriter::new(create_writer(path).await?),
        })
    }

    /// Serialize and write a single record.
    pub async fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        let json =
            serde_json::to_string(record).context("Failed to serialize JSON record")?;
        self.writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
        Ok(())
    }

    /// Flush everything we've written.
    pub async fn finish(mut self) -> Result<()> {
        self.writer.flush().await.context("Failed to flush output")
    }
}
