//! Coupling between an upstream handle and the process it feeds

use futures::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::Result;
use crate::handle::ProcessHandle;
use crate::stream::Chunk;

/// Link from a downstream process to the handle feeding its stdin
#[derive(Debug, Clone)]
pub struct PipeLink {
    upstream: ProcessHandle,
}

impl PipeLink {
    /// Link to `upstream`, whose stdout will feed the downstream process
    pub fn new(upstream: ProcessHandle) -> Self {
        Self { upstream }
    }

    /// Start copying the upstream's stdout into `stdin`.
    ///
    /// Only connects when the upstream has a live process. Otherwise `stdin`
    /// is dropped so the downstream sees end-of-input.
    pub(crate) fn connect(&self, stdin: ChildStdin) -> Option<JoinHandle<()>> {
        let Some(source) = self.upstream.live_stdout() else {
            debug!(
                upstream = %self.upstream.command(),
                "Upstream has no live process, closing downstream stdin"
            );
            return None;
        };
        Some(tokio::spawn(forward(source.reader(), stdin)))
    }

    /// Wait for the upstream to settle, propagating its failure
    pub async fn settle(&self) -> Result<()> {
        self.upstream.output().await.map(|_| ())
    }
}

async fn forward<S>(chunks: S, mut sink: ChildStdin)
where
    S: Stream<Item = Chunk>,
{
    let mut chunks = Box::pin(chunks);
    while let Some(chunk) = chunks.next().await {
        if let Err(e) = sink.write_all(&chunk).await {
            debug!(error = %e, "Downstream stopped reading, ending pipe");
            return;
        }
    }
    if let Err(e) = sink.shutdown().await {
        debug!(error = %e, "Failed to close downstream stdin");
    }
}
