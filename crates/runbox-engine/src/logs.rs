//! Bounded collection of container output.

use futures::StreamExt;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use runbox_core::driver::{OutputLine, OutputStream};
use runbox_core::job::CapturedLogs;

/// How long to let the drain task run after the container exited before
/// aborting it. The follow stream may outlive a stopped container.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Default)]
struct Buffer {
    logs: CapturedLogs,
    used: usize,
}

impl Buffer {
    fn push(&mut self, line: OutputLine, cap: usize) {
        if self.logs.truncated {
            return;
        }
        let remaining = cap.saturating_sub(self.used);
        let target = match line.stream {
            OutputStream::Stdout => &mut self.logs.stdout,
            OutputStream::Stderr => &mut self.logs.stderr,
        };
        if line.content.len() <= remaining {
            target.push_str(&line.content);
            self.used += line.content.len();
            return;
        }
        // Cut at a char boundary, mark the stream, drop everything after.
        let mut cut = remaining;
        while cut > 0 && !line.content.is_char_boundary(cut) {
            cut -= 1;
        }
        target.push_str(&line.content[..cut]);
        target.push_str(CapturedLogs::TRUNCATION_MARKER);
        self.used = cap;
        self.logs.truncated = true;
    }
}

/// Drains a container output stream into a bounded buffer on a background
/// task. Oversized output is cut off with a truncation marker.
pub struct LogCollector {
    shared: Arc<Mutex<Buffer>>,
    handle: JoinHandle<()>,
}

impl LogCollector {
    /// Spawn a drain task over `stream`, capping capture at `cap` bytes.
    pub fn collect(mut stream: BoxStream<'static, OutputLine>, cap: usize) -> Self {
        let shared = Arc::new(Mutex::new(Buffer::default()));
        let buffer = shared.clone();
        let handle = tokio::spawn(async move {
            while let Some(line) = stream.next().await {
                buffer.lock().await.push(line, cap);
            }
        });
        Self { shared, handle }
    }

    /// Take whatever has been captured. Gives the drain task a short grace
    /// window to finish, then aborts it.
    pub async fn finish(mut self) -> CapturedLogs {
        let _ = tokio::time::timeout(DRAIN_GRACE, &mut self.handle).await;
        self.handle.abort();
        let buffer = self.shared.lock().await;
        buffer.logs.clone()
    }
}
