//! Integration tests for resumable transfers across fetcher instances
//!
//! These exercise the fetcher the way the coordinator does: a transfer is
//! interrupted, a new fetcher picks the partial up later, and the final file
//! must be byte-identical to the source.

#[cfg(test)]
mod tests {
    use super::super::bandwidth::BandwidthController;
    use super::super::error_handling::*;
    use super::super::models::*;
    use super::super::stream_fetcher::*;
    use super::super::test_support::{payload, Fault, MemoryTransport};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    const URL: &str = "https://cdn.test/lecture_720p.mp4";

    fn config(attempts: u32) -> FetcherConfig {
        FetcherConfig {
            retry: RetryPolicy::fixed(attempts, Duration::from_millis(5)),
            read_timeout: Duration::from_secs(1),
            progress_interval: Duration::from_millis(0),
            cancel_poll_interval: Duration::from_millis(5),
        }
    }

    fn request(dest: std::path::PathBuf, size: Option<u64>) -> FetchRequest {
        FetchRequest {
            slot: StreamSlot::Video,
            descriptor: StreamDescriptor::new(StreamKind::Video, URL, 720).with_size_hint(size),
            dest,
            resume_from: 0,
            stop: Arc::new(AtomicBool::new(false)),
            events: None,
        }
    }

    #[tokio::test]
    async fn test_interrupted_transfer_resumes_byte_identical() {
        let dir = TempDir::new().unwrap();
        let data = payload(300_000, 7);
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(URL, data.clone());
        transport.push_fault(URL, Fault::DropAfter(120_000));
        let dest = dir.path().join("abc.video.part");

        // first process: no retries, dies mid-transfer
        let first = StreamFetcher::new(transport.clone(), BandwidthController::default(), config(1));
        let err = first
            .fetch(request(dest.clone(), Some(300_000)))
            .await
            .unwrap_err();
        assert_eq!(err.fetch_reason(), Some(FetchFailure::Network));
        assert_eq!(std::fs::metadata(&dest).unwrap().len(), 120_000);

        // second process knows nothing but the partial on disk
        let second = StreamFetcher::new(transport.clone(), BandwidthController::default(), config(3));
        let result = second.fetch(request(dest.clone(), Some(300_000))).await.unwrap();

        assert_eq!(result.resumed_from, 120_000);
        assert_eq!(result.bytes_written, 180_000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
        assert_eq!(
            transport.opens(),
            vec![(URL.to_string(), 0), (URL.to_string(), 120_000)]
        );
    }

    #[tokio::test]
    async fn test_progress_events_only_grow() {
        let dir = TempDir::new().unwrap();
        let data = payload(64_000, 3);
        let transport = Arc::new(MemoryTransport::new().with_chunk_size(4_000));
        transport.insert(URL, data.clone());
        transport.push_fault(URL, Fault::DropAfter(20_000));

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut req = request(dir.path().join("p.video.part"), None);
        req.events = Some(tx);

        let fetcher = StreamFetcher::new(transport, BandwidthController::default(), config(3));
        let result = fetcher.fetch(req).await.unwrap();
        assert_eq!(result.total_bytes, 64_000);
        assert_eq!(result.attempts, 2);

        let mut last = 0;
        let mut saw_total = false;
        let mut saw_retry = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                FetchEvent::Progress { bytes_done, .. } => {
                    assert!(bytes_done >= last, "{} after {}", bytes_done, last);
                    last = bytes_done;
                }
                FetchEvent::TotalKnown { total, .. } => {
                    assert_eq!(total, 64_000);
                    saw_total = true;
                }
                FetchEvent::Retrying { attempt, .. } => {
                    assert_eq!(attempt, 1);
                    saw_retry = true;
                }
                FetchEvent::Restarted { .. } => panic!("range-capable source must not restart"),
            }
        }
        assert_eq!(last, 64_000);
        assert!(saw_total && saw_retry);
    }

    #[tokio::test]
    async fn test_cancelled_partial_is_a_valid_prefix() {
        let dir = TempDir::new().unwrap();
        let data = payload(200_000, 9);
        let transport = Arc::new(
            MemoryTransport::new()
                .with_chunk_size(1_000)
                .with_chunk_delay(Duration::from_millis(2)),
        );
        transport.insert(URL, data.clone());

        let req = request(dir.path().join("c.video.part"), Some(200_000));
        let stop = req.stop.clone();
        let dest = req.dest.clone();
        let fetcher = StreamFetcher::new(transport, BandwidthController::default(), config(3));
        let task = tokio::spawn(async move { fetcher.fetch(req).await });

        tokio::time::sleep(Duration::from_millis(60)).await;
        stop.store(true, Ordering::SeqCst);
        let outcome = task.await.unwrap();
        assert_eq!(outcome, Err(DownloadError::Cancelled));

        let on_disk = std::fs::read(&dest).unwrap();
        assert!(on_disk.len() < data.len());
        assert_eq!(&data[..on_disk.len()], on_disk.as_slice());
    }

    #[tokio::test]
    async fn test_bandwidth_limit_slows_transfer() {
        let dir = TempDir::new().unwrap();
        let data = payload(24_576, 1);
        let transport = Arc::new(MemoryTransport::new());
        transport.insert(URL, data.clone());

        let fetcher = StreamFetcher::new(transport, BandwidthController::new(Some(20_000)), config(1));
        let started = Instant::now();
        fetcher
            .fetch(request(dir.path().join("b.video.part"), None))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(200));
    }
}
