//! Event sources feeding observations into the pipeline.
//!
//! Page and browser instrumentation lives outside the agent. Whatever
//! captures the raw observations hands them over through an
//! [`EventSource`], which pushes them into an mpsc channel drained by the
//! [`Pipeline`](crate::pipeline::Pipeline).
//!
//! [`JsonLinesSource`] reads one JSON observation per line from any async
//! reader (stdin, a pipe, a file). The HTTP `POST /events` route is the other
//! way in.

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::types::Observation;

/// A producer of observations.
#[async_trait]
pub trait EventSource: Send {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Pushes observations into `tx` until the source is exhausted or the
    /// receiver is dropped. Returns the number of observations forwarded.
    async fn run(self: Box<Self>, tx: mpsc::Sender<Observation>) -> Result<usize>;
}

/// Reads newline-delimited JSON observations.
///
/// Blank lines are ignored; lines that do not parse as an observation are
/// logged and skipped.
pub struct JsonLinesSource<R> {
    reader: R,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    /// Wraps a buffered reader.
    #[must_use]
    pub fn new(reader: R) -> Self {
        Self { reader }
    }
}

impl JsonLinesSource<BufReader<Stdin>> {
    /// Reads observations from the process's standard input.
    #[must_use]
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

#[async_trait]
impl<R> EventSource for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    fn name(&self) -> &'static str {
        "json-lines"
    }

    async fn run(self: Box<Self>, tx: mpsc::Sender<Observation>) -> Result<usize> {
        let mut lines = self.reader.lines();
        let mut forwarded = 0;
        let mut line_no = 0usize;

        while let Some(line) = lines.next_line().await? {
            line_no += 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let observation: Observation = match serde_json::from_str(line) {
                Ok(observation) => observation,
                Err(e) => {
                    warn!(line = line_no, error = %e, "Skipping malformed observation");
                    continue;
                }
            };

            if tx.send(observation).await.is_err() {
                debug!("Pipeline closed, stopping source");
                break;
            }
            forwarded += 1;
        }

        info!(source = "json-lines", forwarded, "Event source finished");
        Ok(forwarded)
    }
}
