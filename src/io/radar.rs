//! RD-03D serial transport
//!
//! Line-oriented UART link: the radar emits one text frame per reading,
//! terminated by `\n`. The port is opened as an async stream and every read
//! is bounded by `tokio::time::timeout`, so a silent sensor returns control
//! to the poll loop and an abandoned read releases the port when dropped.

use async_trait::async_trait;
use std::io::{self, ErrorKind};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info};

/// Frames longer than this without a newline are treated as line noise
const MAX_LINE_LEN: usize = 256;

/// An open sensor connection
#[async_trait]
pub trait SensorLink: Send {
    /// Read one line.
    ///
    /// Returns `Ok(None)` when no complete line arrived within the read
    /// timeout. An error means the link is unusable and must be reopened.
    /// Dropping the future mid-read keeps any partial frame for the next call.
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Opens sensor connections; called again after every link failure
#[async_trait]
pub trait SensorConnector: Send + Sync + 'static {
    async fn connect(&self) -> io::Result<Box<dyn SensorLink>>;

    /// Human-readable target for logs
    fn describe(&self) -> String;
}

/// Buffers bytes across timed-out reads until a full line is available.
///
/// A frame can arrive split across read timeouts, so partial data is kept
/// for the next call rather than parsed early. No more than
/// `MAX_LINE_LEN + 1` bytes are ever buffered; a longer line is skipped up
/// to and including its newline.
pub struct LineReader<R> {
    reader: BufReader<R>,
    pending: Vec<u8>,
    read_timeout: Duration,
    discarding: bool,
}

impl<R: AsyncRead + Unpin + Send> LineReader<R> {
    pub fn new(inner: R, read_timeout: Duration) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::with_capacity(64),
            read_timeout,
            discarding: false,
        }
    }

    fn take_line(&mut self) -> Vec<u8> {
        let mut line = std::mem::take(&mut self.pending);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        line
    }

    /// Drop what has been read so far of an oversized line
    fn skip_noise(&mut self, complete: bool) {
        self.pending.clear();
        if complete {
            self.discarding = false;
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> SensorLink for LineReader<R> {
    async fn read_line(&mut self) -> io::Result<Option<Vec<u8>>> {
        let budget = (MAX_LINE_LEN + 1).saturating_sub(self.pending.len()) as u64;
        let mut limited = (&mut self.reader).take(budget);
        let read =
            tokio::time::timeout(self.read_timeout, limited.read_until(b'\n', &mut self.pending))
                .await;

        match read {
            Ok(Ok(0)) if self.pending.is_empty() && !self.discarding => {
                Err(io::Error::new(ErrorKind::UnexpectedEof, "sensor stream closed"))
            }
            Ok(Ok(n)) => {
                let complete = self.pending.last() == Some(&b'\n');
                if self.discarding {
                    if n == 0 {
                        return Err(io::Error::new(ErrorKind::UnexpectedEof, "sensor stream closed"));
                    }
                    self.skip_noise(complete);
                    return Ok(None);
                }
                if complete {
                    return Ok(Some(self.take_line()));
                }
                if self.pending.len() > MAX_LINE_LEN {
                    debug!(discarded = self.pending.len(), "radar_line_too_long");
                    self.discarding = true;
                    self.skip_noise(false);
                    return Ok(None);
                }
                // EOF after a partial frame: hand it over, next read reports EOF
                Ok(Some(self.take_line()))
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted
                ) =>
            {
                if self.discarding {
                    self.skip_noise(false);
                }
                Ok(None)
            }
            Ok(Err(e)) => Err(e),
            // Partial bytes stay in `pending` for the next read
            Err(_elapsed) => {
                if self.discarding {
                    self.skip_noise(false);
                }
                Ok(None)
            }
        }
    }
}

/// Serial port connector for the RD-03D UART
pub struct SerialConnector {
    device: String,
    baud: u32,
    read_timeout: Duration,
}

impl SerialConnector {
    pub fn new(device: &str, baud: u32, read_timeout: Duration) -> Self {
        Self { device: device.to_string(), baud, read_timeout }
    }

    pub fn from_config(config: &crate::infra::config::Config) -> Self {
        Self::new(config.sensor_device(), config.sensor_baud(), config.read_timeout())
    }
}

#[async_trait]
impl SensorConnector for SerialConnector {
    async fn connect(&self) -> io::Result<Box<dyn SensorLink>> {
        let port = tokio_serial::new(&self.device, self.baud)
            .timeout(self.read_timeout)
            .open_native_async()
            .map_err(io::Error::from)?;

        info!(
            device = %self.device,
            baud = %self.baud,
            read_timeout_ms = %self.read_timeout.as_millis(),
            "radar_port_opened"
        );

        Ok(Box::new(LineReader::new(port, self.read_timeout)))
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.device, self.baud)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    enum Step {
        Data(Vec<u8>),
        /// Never completes; the read timeout has to fire
        Stall,
        Fail(ErrorKind),
    }

    /// Reader that replays scripted chunks, stalls and errors, then EOF
    struct ScriptedReader {
        script: VecDeque<Step>,
    }

    impl ScriptedReader {
        fn new(script: Vec<Step>) -> Self {
            Self { script: script.into() }
        }
    }

    impl AsyncRead for ScriptedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            match self.script.pop_front() {
                Some(Step::Data(chunk)) => {
                    let n = chunk.len().min(buf.remaining());
                    buf.put_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.script.push_front(Step::Data(chunk[n..].to_vec()));
                    }
                    Poll::Ready(Ok(()))
                }
                Some(Step::Stall) => Poll::Pending,
                Some(Step::Fail(kind)) => Poll::Ready(Err(io::Error::new(kind, "scripted"))),
                None => Poll::Ready(Ok(())),
            }
        }
    }

    fn reader(script: Vec<Step>) -> LineReader<ScriptedReader> {
        LineReader::new(ScriptedReader::new(script), Duration::from_millis(20))
    }

    #[tokio::test]
    async fn test_reads_lines_and_strips_terminators() {
        let mut reader = reader(vec![Step::Data(b"0.87,58\r\n1.2\n".to_vec())]);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"0.87,58".to_vec()));
        assert_eq!(reader.read_line().await.unwrap(), Some(b"1.2".to_vec()));
        assert_eq!(reader.read_line().await.unwrap_err().kind(), ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_partial_frame_survives_stall() {
        let mut reader =
            reader(vec![Step::Data(b"1.3".to_vec()), Step::Stall, Step::Data(b"4,20\n".to_vec())]);

        assert_eq!(reader.read_line().await.unwrap(), None);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"1.34,20".to_vec()));
    }

    #[tokio::test]
    async fn test_port_timeout_without_data() {
        let mut reader = reader(vec![Step::Fail(ErrorKind::TimedOut), Step::Data(b"2.0\n".to_vec())]);
        assert_eq!(reader.read_line().await.unwrap(), None);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"2.0".to_vec()));
    }

    #[tokio::test]
    async fn test_hard_errors_propagate() {
        let mut reader = reader(vec![Step::Fail(ErrorKind::BrokenPipe)]);
        assert_eq!(reader.read_line().await.unwrap_err().kind(), ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_oversized_line_skipped_through_newline() {
        let mut noise = vec![b'x'; MAX_LINE_LEN + 10];
        noise.extend_from_slice(b"9.9\n0.5\n");

        let mut reader = reader(vec![Step::Data(noise)]);
        // The tail of the noisy line must not surface as a frame
        assert_eq!(reader.read_line().await.unwrap(), None);
        assert_eq!(reader.read_line().await.unwrap(), None);
        assert_eq!(reader.read_line().await.unwrap(), Some(b"0.5".to_vec()));
    }

    #[tokio::test]
    async fn test_newline_free_noise_stays_bounded() {
        let mut reader = reader(vec![
            Step::Data(vec![b'x'; 10 * 1024 * 1024]),
            Step::Fail(ErrorKind::TimedOut),
        ]);

        assert_eq!(reader.read_line().await.unwrap(), None);
        assert!(reader.pending.capacity() <= 4 * MAX_LINE_LEN);

        for _ in 0..64 {
            assert_eq!(reader.read_line().await.unwrap(), None);
            assert!(reader.pending.len() <= MAX_LINE_LEN + 1);
        }
        assert!(reader.pending.capacity() <= 4 * MAX_LINE_LEN);
    }

    #[tokio::test]
    async fn test_noise_then_frame_recovers() {
        let mut data = vec![b'x'; 4 * MAX_LINE_LEN];
        data.extend_from_slice(b"\n1.5,40\n");
        let mut reader = reader(vec![Step::Data(data)]);

        let mut frame = None;
        for _ in 0..16 {
            if let Some(line) = reader.read_line().await.unwrap() {
                frame = Some(line);
                break;
            }
        }
        assert_eq!(frame, Some(b"1.5,40".to_vec()));
    }

    #[test]
    fn test_describe() {
        let connector = SerialConnector::new("/dev/ttyS0", 115_200, Duration::from_secs(1));
        assert_eq!(connector.describe(), "/dev/ttyS0@115200");
    }
}
