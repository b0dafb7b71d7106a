//! Integration tests for the stream repacketizer
//!
//! Drives `repacketize` with in-memory chunk sources and checks frame integrity,
//! ordering, pacing, and abort behavior.

use bytes::Bytes;
use futures::{StreamExt, stream};
use proptest::prelude::*;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use aoai_relay::proxy::{DELIMITER, Pacing, repacketize};

// =============================================================================
// Test Fixtures
// =============================================================================

fn chunks(parts: &[&[u8]]) -> Vec<Result<Bytes, io::Error>> {
    parts.iter().map(|p| Ok(Bytes::copy_from_slice(p))).collect()
}

/// Collect every item, stopping after the first error.
async fn collect_frames(
    source: Vec<Result<Bytes, io::Error>>,
    pacing: Pacing,
) -> (Vec<String>, Option<io::Error>) {
    let mut out = repacketize(stream::iter(source), pacing);
    let mut frames = Vec::new();
    while let Some(item) = out.next().await {
        match item {
            Ok(bytes) => frames.push(String::from_utf8(bytes.to_vec()).unwrap()),
            Err(e) => return (frames, Some(e)),
        }
    }
    (frames, None)
}

/// Sets its flag when dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// =============================================================================
// Frame Assembly
// =============================================================================

mod frame_assembly_tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_reassembled_across_reads() {
        let source = chunks(&[b"data: a\n\nda", b"ta: b\n", b"\n"]);
        let (frames, err) = collect_frames(source, Pacing::immediate()).await;

        assert!(err.is_none());
        assert_eq!(frames, vec!["data: a\n\n", "data: b\n\n"]);
    }

    #[tokio::test]
    async fn test_trailing_partial_frame_is_terminated() {
        let source = chunks(&[b"data: a\n\ndata: ta", b"il"]);
        let (frames, err) = collect_frames(source, Pacing::immediate()).await;

        assert!(err.is_none());
        assert_eq!(frames, vec!["data: a\n\n", "data: tail\n\n"]);
    }

    #[tokio::test]
    async fn test_empty_source_emits_nothing() {
        let (frames, err) = collect_frames(Vec::new(), Pacing::immediate()).await;
        assert!(err.is_none());
        assert!(frames.is_empty());
    }

    #[tokio::test]
    async fn test_multibyte_boundary_preserved() {
        // "日" = E6 97 A5, split inside the character
        let source = chunks(&[b"data: \xE6", b"\x97", b"\xA5\n\n"]);
        let (frames, err) = collect_frames(source, Pacing::immediate()).await;

        assert!(err.is_none());
        assert_eq!(frames, vec!["data: 日\n\n"]);
    }

    #[tokio::test]
    async fn test_done_marker_passes_through() {
        let source = chunks(&[
            b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\n",
            b"data: [DONE]\n\n",
        ]);
        let (frames, _) = collect_frames(source, Pacing::immediate()).await;

        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1], "data: [DONE]\n\n");
    }
}

// =============================================================================
// Pacing
// =============================================================================

mod pacing_tests {
    use super::*;

    #[tokio::test]
    async fn test_short_frame_is_followed_by_delay() {
        let source = chunks(&[b"data: a\n\nda", b"ta: b\n\n"]);
        let mut out = repacketize(stream::iter(source), Pacing::default());

        let first = out.next().await.unwrap().unwrap();
        let received_first = Instant::now();
        let second = out.next().await.unwrap().unwrap();
        let gap = received_first.elapsed();

        assert_eq!(first, Bytes::from_static(b"data: a\n\n"));
        assert_eq!(second, Bytes::from_static(b"data: b\n\n"));
        // A 7-char frame waits just under 50ms
        assert!(gap >= Duration::from_millis(30), "gap was {gap:?}");
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_final_partial_frame_has_no_trailing_wait() {
        let pacing = Pacing::new(Duration::from_millis(200), Duration::from_millis(200), 1024);
        let source = chunks(&[b"unterminated"]);
        let start = Instant::now();
        let (frames, _) = collect_frames(source, pacing).await;

        assert_eq!(frames, vec!["unterminated\n\n"]);
        assert!(start.elapsed() < Duration::from_millis(200));
    }
}

// =============================================================================
// Abort Behavior
// =============================================================================

mod abort_tests {
    use super::*;

    #[tokio::test]
    async fn test_upstream_error_aborts_without_partial_frame() {
        let source = vec![
            Ok(Bytes::from_static(b"data: a\n\ndata: part")),
            Err(io::Error::other("connection reset")),
        ];
        let (frames, err) = collect_frames(source, Pacing::immediate()).await;

        assert_eq!(frames, vec!["data: a\n\n"]);
        let err = err.expect("stream should end with an error");
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_stream_ends_after_error() {
        let source = vec![
            Err(io::Error::other("boom")),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let mut out = repacketize(stream::iter(source), Pacing::immediate());

        assert!(out.next().await.unwrap().is_err());
        assert!(out.next().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_utf8_aborts() {
        let source = chunks(&[b"data: ok\n\n", b"data: \xFF\xFE\n\n"]);
        let (frames, err) = collect_frames(source, Pacing::immediate()).await;

        assert_eq!(frames, vec!["data: ok\n\n"]);
        assert!(err.unwrap().to_string().contains("invalid UTF-8"));
    }

    #[tokio::test]
    async fn test_malformed_utf8_in_same_read_keeps_earlier_frames() {
        let single = chunks(&[b"data: a\n\ndata: \xFF\n\n"]);
        let split = chunks(&[b"data: a\n\n", b"data: \xFF\n\n"]);

        let (single_frames, single_err) = collect_frames(single, Pacing::immediate()).await;
        let (split_frames, split_err) = collect_frames(split, Pacing::immediate()).await;

        assert_eq!(single_frames, vec!["data: a\n\n"]);
        assert_eq!(single_frames, split_frames);
        assert!(single_err.unwrap().to_string().contains("invalid UTF-8"));
        assert!(split_err.is_some());
    }

    #[tokio::test]
    async fn test_truncated_utf8_at_end_aborts() {
        let source = chunks(&[b"data: ok\n\n", b"data: \xE6\x97"]);
        let (frames, err) = collect_frames(source, Pacing::immediate()).await;

        assert_eq!(frames, vec!["data: ok\n\n"]);
        assert!(err.is_some());
    }

    #[tokio::test]
    async fn test_client_disconnect_releases_source() {
        let dropped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(dropped.clone());

        // Never ends on its own
        let source = stream::iter(chunks(&[b"data: a\n\n"]))
            .chain(stream::pending())
            .map(move |item| {
                let _keep = &guard;
                item
            });

        let mut out = repacketize(source, Pacing::default());
        assert!(out.next().await.unwrap().is_ok());
        drop(out);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !dropped.load(Ordering::SeqCst) {
            assert!(Instant::now() < deadline, "source was not released");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// =============================================================================
// Frame Integrity Property
// =============================================================================

/// Frames expected from `input`, each with its delimiter
fn expected_frames(input: &str) -> Vec<String> {
    let pieces: Vec<&str> = input.split(DELIMITER).collect();
    let (last, complete) = pieces.split_last().unwrap();
    let mut frames: Vec<String> = complete.iter().map(|p| format!("{p}{DELIMITER}")).collect();
    if !last.is_empty() {
        frames.push(format!("{last}{DELIMITER}"));
    }
    frames
}

/// Cut `bytes` at the given positions, regardless of character boundaries
fn cut(bytes: &[u8], mut positions: Vec<usize>) -> Vec<Result<Bytes, io::Error>> {
    positions.sort_unstable();
    positions.dedup();
    let mut parts = Vec::new();
    let mut start = 0;
    for pos in positions {
        parts.push(Ok(Bytes::copy_from_slice(&bytes[start..pos])));
        start = pos;
    }
    parts.push(Ok(Bytes::copy_from_slice(&bytes[start..])));
    parts
}

proptest! {
    #[test]
    fn prop_frames_survive_arbitrary_read_boundaries(
        input in "[a-zé日🎉: \n]{0,80}",
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
    ) {
        let bytes = input.as_bytes();
        let positions = cuts.iter().map(|c| c.index(bytes.len() + 1)).collect();
        let source = cut(bytes, positions);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (frames, err) = runtime.block_on(collect_frames(source, Pacing::immediate()));

        prop_assert!(err.is_none());
        prop_assert_eq!(frames, expected_frames(&input));
    }
}
