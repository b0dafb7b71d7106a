//! Re-pacing of streamed (SSE) responses
//!
//! The backend delivers its event stream in chunks whose boundaries have nothing
//! to do with event boundaries. [`repacketize`] reassembles the stream into whole
//! `\n\n`-terminated frames and hands them to the client one at a time, sleeping
//! between frames for a delay that shrinks as frames get longer. Token-by-token
//! output is spaced out; large batched frames go through almost immediately.
//!
//! ```text
//! backend chunks ──► FrameBuffer ──► pump task ──(mpsc, cap 1)──► client body
//!                   utf-8 carry,      pacing sleep
//!                   frame split
//! ```
//!
//! The pump owns all buffering state for one response. It stops as soon as the
//! client goes away, and a backend failure aborts the client body rather than
//! ending it cleanly.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use std::io;
use std::pin::pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::PacingConfig;

use super::error::StreamError;

/// SSE record separator
pub const DELIMITER: &str = "\n\n";

/// Adaptive delay applied after each emitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    min_wait: Duration,
    max_wait: Duration,
    threshold: usize,
}

impl Pacing {
    pub fn new(min_wait: Duration, max_wait: Duration, threshold: usize) -> Self {
        Self {
            min_wait: min_wait.min(max_wait),
            max_wait,
            threshold,
        }
    }

    /// No delay between frames
    pub fn immediate() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO, 1)
    }

    /// Delay after a frame of `len` chars.
    ///
    /// `max_wait` at zero length, falling linearly to `min_wait` at `threshold`
    /// and clamped there beyond it.
    pub fn wait_for(&self, len: usize) -> Duration {
        if self.threshold == 0 {
            return self.min_wait;
        }
        let max = self.max_wait.as_nanos();
        let span = max - self.min_wait.as_nanos();
        let clamped = len.min(self.threshold) as u128;
        let nanos = max - span * clamped / self.threshold as u128;
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self::from(&PacingConfig::default())
    }
}

impl From<&PacingConfig> for Pacing {
    fn from(config: &PacingConfig) -> Self {
        Self::new(
            Duration::from_millis(config.min_wait_ms),
            Duration::from_millis(config.max_wait_ms),
            config.threshold_chars,
        )
    }
}

/// Incremental UTF-8 decoding plus frame splitting for a single response.
///
/// Bytes of a multi-byte character split across chunks are held back until the
/// character is complete. Text after the last delimiter is carried over to the
/// next chunk. Invalid bytes poison the buffer: frames completed before them are
/// still returned, and the error surfaces through [`FrameBuffer::check`].
#[derive(Debug, Default)]
pub struct FrameBuffer {
    /// Trailing bytes of an incomplete character (at most 3)
    pending: Vec<u8>,
    /// Decoded text not yet terminated by a delimiter
    carry: String,
    /// Offset in `carry` before which no delimiter can start
    scanned: usize,
    /// Bytes consumed so far, for error reporting
    consumed: usize,
    /// Decode failure waiting to be reported
    failure: Option<StreamError>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk; returns the frames it completed, without delimiters, in order.
    ///
    /// Fails only if an earlier chunk was malformed and the error was not yet taken.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamError> {
        self.check()?;
        self.decode(chunk);
        Ok(self.split_frames())
    }

    /// Take the decode error recorded by the last `push`, if any.
    pub fn check(&mut self) -> Result<(), StreamError> {
        match self.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// End of input: the unterminated remainder, if any.
    pub fn finish(mut self) -> Result<Option<String>, StreamError> {
        self.check()?;
        if !self.pending.is_empty() {
            return Err(StreamError::TruncatedUtf8 {
                pending: self.pending.len(),
            });
        }
        Ok(if self.carry.is_empty() {
            None
        } else {
            Some(self.carry)
        })
    }

    fn decode(&mut self, chunk: &[u8]) {
        let joined;
        let bytes = if self.pending.is_empty() {
            chunk
        } else {
            joined = [std::mem::take(&mut self.pending).as_slice(), chunk].concat();
            joined.as_slice()
        };
        let base = self.consumed - bytes.len().saturating_sub(chunk.len());
        self.consumed += chunk.len();

        match std::str::from_utf8(bytes) {
            Ok(text) => self.carry.push_str(text),
            Err(e) => {
                let (head, tail) = bytes.split_at(e.valid_up_to());
                self.carry
                    .push_str(std::str::from_utf8(head).unwrap_or_default());
                if e.error_len().is_some() {
                    self.failure = Some(StreamError::MalformedUtf8 {
                        offset: base + head.len(),
                    });
                } else {
                    // Incomplete sequence at the end: keep it for the next chunk.
                    self.pending = tail.to_vec();
                }
            }
        }
    }

    fn split_frames(&mut self) -> Vec<String> {
        let delimiter = DELIMITER.as_bytes();
        let mut frames = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;

        while let Some(idx) = self.carry.as_bytes()[from..]
            .windows(delimiter.len())
            .position(|window| window == delimiter)
        {
            let end = from + idx;
            frames.push(self.carry[start..end].to_string());
            start = end + delimiter.len();
            from = start;
        }

        self.carry.drain(..start);
        // A delimiter may still straddle the end of the carried text.
        self.scanned = self.carry.len().saturating_sub(delimiter.len() - 1);
        frames
    }
}

/// How a pump run ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpOutcome {
    Completed { frames: usize },
    ClientGone { frames: usize },
}

/// Wrap `source` so that it is delivered as paced, whole frames.
///
/// Spawns a task that owns the buffering state; the returned stream yields one
/// item per frame. Dropping it stops the task and releases `source`. If the
/// source fails or carries invalid UTF-8, the stream yields a single error and
/// ends; the unterminated remainder is discarded.
pub fn repacketize<S, E>(source: S, pacing: Pacing) -> ReceiverStream<Result<Bytes, io::Error>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    tokio::spawn(async move {
        match pump(source, &tx, pacing).await {
            Ok(PumpOutcome::Completed { frames }) => {
                tracing::debug!(frames, "Stream completed");
            }
            Ok(PumpOutcome::ClientGone { frames }) => {
                tracing::debug!(frames, "Client disconnected, abandoning upstream stream");
            }
            Err(e) => {
                tracing::warn!("Aborting streamed response: {e}");
                let _ = tx.send(Err(io::Error::other(e))).await;
            }
        }
    });
    ReceiverStream::new(rx)
}

async fn pump<S, E>(
    source: S,
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    pacing: Pacing,
) -> Result<PumpOutcome, StreamError>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let mut source = pin!(source);
    let mut buffer = FrameBuffer::new();
    let mut frames = 0;

    loop {
        let next = tokio::select! {
            next = source.next() => next,
            () = tx.closed() => return Ok(PumpOutcome::ClientGone { frames }),
        };
        let Some(chunk) = next else { break };
        let chunk = chunk.map_err(|e| StreamError::Upstream(Box::new(e)))?;

        for frame in buffer.push(&chunk)? {
            let wait = pacing.wait_for(frame.chars().count());
            if tx.send(Ok(terminated(frame))).await.is_err() {
                return Ok(PumpOutcome::ClientGone { frames });
            }
            frames += 1;

            tokio::select! {
                () = tokio::time::sleep(wait) => {}
                () = tx.closed() => return Ok(PumpOutcome::ClientGone { frames }),
            }
        }
        buffer.check()?;
    }

    if let Some(rest) = buffer.finish()? {
        if tx.send(Ok(terminated(rest))).await.is_err() {
            return Ok(PumpOutcome::ClientGone { frames });
        }
        frames += 1;
    }
    Ok(PumpOutcome::Completed { frames })
}

fn terminated(mut frame: String) -> Bytes {
    frame.push_str(DELIMITER);
    Bytes::from(frame)
}
