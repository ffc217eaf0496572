//! Development sheet writer printing TSV to stdout.

use async_trait::async_trait;
use rex_core::{EngineError, SheetWriter, WriteMode};
use tracing::info;

pub struct StdoutWriter;

#[async_trait]
impl SheetWriter for StdoutWriter {
    async fn write(
        &self,
        destination: &str,
        headers: &[String],
        rows: &[Vec<String>],
        mode: WriteMode,
    ) -> Result<u64, EngineError> {
        info!(destination, rows = rows.len(), ?mode, "writing to stdout");
        // append mode does not repeat the header row
        if mode == WriteMode::Overwrite {
            println!("{}", headers.join("\t"));
        }
        for row in rows {
            println!("{}", row.join("\t"));
        }
        Ok(rows.len() as u64)
    }
}
