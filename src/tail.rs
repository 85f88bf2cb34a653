//! Polling file tailer.
//!
//! The followed file is polled rather than watched so that appends are seen on
//! filesystems that do not deliver change notifications reliably.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
/// Shorter intervals are raised to this.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Where a new tailer begins reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Beginning,
    End,
}

/// Follows one file and yields each complete line appended to it.
///
/// A tailer is single-use: once [`FileTailer::next_line`] has returned `None`
/// because of cancellation, a new instance must be opened to resume.
pub struct FileTailer {
    path: PathBuf,
    reader: BufReader<File>,
    pending: Vec<u8>,
    offset: u64,
    poll_interval: Duration,
}

impl FileTailer {
    pub async fn open(
        path: impl Into<PathBuf>,
        start: StartPosition,
        poll_interval: Duration,
    ) -> std::io::Result<Self> {
        let path = path.into();
        let mut file = File::open(&path).await?;
        let offset = match start {
            StartPosition::Beginning => 0,
            StartPosition::End => file.seek(SeekFrom::End(0)).await?,
        };
        info!(path = %path.display(), offset, "tailing file");
        Ok(Self {
            path,
            reader: BufReader::new(file),
            pending: Vec::new(),
            offset,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next complete line. Returns `None` once `cancel` fires;
    /// the signal is observed within one poll interval.
    pub async fn next_line(&mut self, cancel: &CancellationToken) -> std::io::Result<Option<String>> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let read = self.reader.read_until(b'\n', &mut self.pending).await?;
            if read > 0 {
                self.offset += read as u64;
                if self.pending.last() == Some(&b'\n') {
                    return Ok(Some(self.take_line()));
                }
                // Partial line: keep it until the writer finishes it.
                continue;
            }

            if self.truncated().await? {
                debug!(path = %self.path.display(), "file truncated, rewinding");
                self.reader.seek(SeekFrom::Start(0)).await?;
                self.offset = 0;
                self.pending.clear();
                continue;
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = cancel.cancelled() => return Ok(None),
            }
        }
    }

    async fn truncated(&self) -> std::io::Result<bool> {
        let len = self.reader.get_ref().metadata().await?.len();
        Ok(len < self.offset)
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.pending);
        if bytes.ends_with(b"\n") {
            bytes.pop();
        }
        if bytes.ends_with(b"\r") {
            bytes.pop();
        }
        match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(10);
    const WAIT: Duration = Duration::from_secs(2);

    fn append(path: &Path, text: &str) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(text.as_bytes()).unwrap();
    }

    async fn next(tailer: &mut FileTailer, cancel: &CancellationToken) -> String {
        timeout(WAIT, tailer.next_line(cancel))
            .await
            .expect("timed out waiting for a line")
            .unwrap()
            .expect("tailer stopped")
    }

    #[tokio::test]
    async fn end_position_skips_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "old line\n").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::End, POLL).await.unwrap();
        append(&path, "new line\n");

        assert_eq!(next(&mut tailer, &cancel).await, "new line");
    }

    #[tokio::test]
    async fn beginning_position_reads_everything_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "one\ntwo\r\n").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::Beginning, POLL)
            .await
            .unwrap();
        append(&path, "three\n");

        assert_eq!(next(&mut tailer, &cancel).await, "one");
        assert_eq!(next(&mut tailer, &cancel).await, "two");
        assert_eq!(next(&mut tailer, &cancel).await, "three");
    }

    #[tokio::test]
    async fn partial_lines_wait_for_their_newline() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::End, POLL).await.unwrap();
        append(&path, "hal");
        assert!(
            timeout(Duration::from_millis(100), tailer.next_line(&cancel))
                .await
                .is_err()
        );
        append(&path, "f done\n");
        assert_eq!(next(&mut tailer, &cancel).await, "half done");
    }

    #[tokio::test]
    async fn empty_lines_are_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::End, POLL).await.unwrap();
        append(&path, "\nafter\n");
        assert_eq!(next(&mut tailer, &cancel).await, "");
        assert_eq!(next(&mut tailer, &cancel).await, "after");
    }

    #[tokio::test]
    async fn truncation_rewinds_to_start() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "a fairly long first line\n").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::End, POLL).await.unwrap();
        std::fs::write(&path, "short\n").unwrap();

        assert_eq!(next(&mut tailer, &cancel).await, "short");
    }

    #[tokio::test]
    async fn cancellation_stops_within_a_poll() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::End, Duration::from_secs(30))
            .await
            .unwrap();
        let stopper = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let line = timeout(WAIT, tailer.next_line(&cancel)).await.unwrap().unwrap();
        assert!(line.is_none());
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn invalid_utf8_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, b"caf\xff\n").unwrap();

        let cancel = CancellationToken::new();
        let mut tailer = FileTailer::open(&path, StartPosition::Beginning, POLL)
            .await
            .unwrap();
        assert_eq!(next(&mut tailer, &cancel).await, "caf\u{FFFD}");
    }

    #[tokio::test]
    async fn zero_poll_interval_is_raised() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.txt");
        std::fs::write(&path, "").unwrap();

        let tailer = FileTailer::open(&path, StartPosition::End, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(tailer.poll_interval, MIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn missing_file_fails_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileTailer::open(dir.path().join("nope.txt"), StartPosition::End, POLL).await;
        assert!(result.is_err());
    }
}
