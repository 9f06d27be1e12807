use crate::error::{Error, Result};
use crate::protocol::TERMINATOR;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::Instant;

/// Unterminated input beyond this size is treated as line noise.
pub const MAX_FRAME_LENGTH: usize = 1024;

const READ_CHUNK: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    /// A complete frame, terminator included.
    Frame(Vec<u8>),
    /// Nothing complete yet. Partial input stays buffered.
    Pending,
}

/// Assembles terminator delimited frames from a byte stream.
///
/// Every read is bounded by the poll interval, so callers can keep their own
/// idle clocks running. End of stream is reported as [`Error::ChannelClosed`].
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    poll_interval: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, poll_interval: Duration) -> Self {
        Self {
            inner,
            buffer: Vec::with_capacity(READ_CHUNK),
            poll_interval,
        }
    }

    /// Waits at most one poll interval for a complete frame.
    pub async fn next_frame(&mut self) -> Result<ReadOutcome> {
        if let Some(frame) = self.take_frame() {
            return Ok(ReadOutcome::Frame(frame));
        }

        let mut chunk = [0u8; READ_CHUNK];
        let received =
            match tokio::time::timeout(self.poll_interval, self.inner.read(&mut chunk)).await {
                Err(_elapsed) => return Ok(ReadOutcome::Pending),
                Ok(Ok(0)) => return Err(Error::ChannelClosed),
                Ok(Ok(received)) => received,
                Ok(Err(err)) => return Err(Error::Io(err)),
            };
        log::trace!("received: {:02X?}", &chunk[..received]);
        self.buffer.extend_from_slice(&chunk[..received]);

        match self.take_frame() {
            Some(frame) => {
                log::debug!("Read complete message: {}", frame.escape_ascii());
                Ok(ReadOutcome::Frame(frame))
            }
            None => {
                if self.buffer.len() > MAX_FRAME_LENGTH {
                    log::warn!(
                        "Discarding {} bytes without terminator",
                        self.buffer.len()
                    );
                    self.buffer.clear();
                }
                Ok(ReadOutcome::Pending)
            }
        }
    }

    /// Reads until a frame completes or `deadline` elapses.
    pub async fn read_frame_within(&mut self, deadline: Duration) -> Result<Option<Vec<u8>>> {
        let started = Instant::now();
        loop {
            match self.next_frame().await? {
                ReadOutcome::Frame(frame) => return Ok(Some(frame)),
                ReadOutcome::Pending if started.elapsed() >= deadline => return Ok(None),
                ReadOutcome::Pending => {}
            }
        }
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    fn take_frame(&mut self) -> Option<Vec<u8>> {
        let end = self.buffer.iter().position(|b| *b == TERMINATOR)?;
        Some(self.buffer.drain(..=end).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const POLL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn assembles_split_frames() {
        let (mut peer, stream) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(stream, POLL);

        peer.write_all(b"~2208").await.unwrap();
        assert_eq!(reader.next_frame().await.unwrap(), ReadOutcome::Pending);
        peer.write_all(b"4A\r>22\r").await.unwrap();
        assert_eq!(
            reader.next_frame().await.unwrap(),
            ReadOutcome::Frame(b"~22084A\r".to_vec())
        );
        assert_eq!(
            reader.next_frame().await.unwrap(),
            ReadOutcome::Frame(b">22\r".to_vec())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_pending() {
        let (_peer, stream) = tokio::io::duplex(256);
        let mut reader = FrameReader::new(stream, POLL);
        assert_eq!(reader.next_frame().await.unwrap(), ReadOutcome::Pending);
        assert_eq!(
            reader
                .read_frame_within(Duration::from_secs(1))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn closed_stream_is_fatal() {
        let (peer, stream) = tokio::io::duplex(256);
        drop(peer);
        let mut reader = FrameReader::new(stream, POLL);
        assert!(matches!(
            reader.next_frame().await,
            Err(Error::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn noise_without_terminator_is_dropped() {
        let (mut peer, stream) = tokio::io::duplex(4096);
        let mut reader = FrameReader::new(stream, POLL);
        peer.write_all(&[b'A'; MAX_FRAME_LENGTH + 100]).await.unwrap();
        peer.write_all(b"~22\r").await.unwrap();
        let frame = reader
            .read_frame_within(Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert!(frame.len() < MAX_FRAME_LENGTH);
        assert!(frame.ends_with(b"~22\r"));
    }
}
