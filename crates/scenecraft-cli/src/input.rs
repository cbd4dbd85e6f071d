//! Input collectors for the command line

use async_trait::async_trait;
use scenecraft_core::{CollectedInput, InputCollector, PipelineError};
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::Mutex;

/// Answers given up front as flags
#[derive(Debug)]
pub(crate) struct ArgsCollector {
    input: Mutex<Option<CollectedInput>>,
}

impl ArgsCollector {
    pub(crate) fn new(prompt: String, image: String) -> Self {
        Self {
            input: Mutex::new(Some(CollectedInput::new(prompt, image))),
        }
    }
}

#[async_trait]
impl InputCollector for ArgsCollector {
    async fn collect(&self) -> Result<Option<CollectedInput>, PipelineError> {
        Ok(self.input.lock().await.take())
    }
}

/// Interactive prompt: scene description line, then image path line
pub(crate) struct LineCollector<R> {
    lines: Mutex<Lines<R>>,
}

impl<R: AsyncBufRead + Unpin> LineCollector<R> {
    pub(crate) fn new(reader: R) -> Self {
        Self {
            lines: Mutex::new(reader.lines()),
        }
    }
}

fn ask(question: &str) {
    let mut stderr = std::io::stderr();
    let _ = write!(stderr, "{question}");
    let _ = stderr.flush();
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> InputCollector for LineCollector<R> {
    async fn collect(&self) -> Result<Option<CollectedInput>, PipelineError> {
        let mut lines = self.lines.lock().await;
        let read = |e: std::io::Error| PipelineError::Input(format!("failed to read input: {e}"));

        ask("Describe the scene: ");
        let Some(prompt) = lines.next_line().await.map_err(read)? else {
            return Ok(None);
        };
        ask("Reference image path (blank for none): ");
        let image = lines.next_line().await.map_err(read)?.unwrap_or_default();
        Ok(Some(CollectedInput::new(prompt, image)))
    }
}
