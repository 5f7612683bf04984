//! Candidate selection
//!
//! Candidates are ranked by the caller's [`QualityPreference`] and probed in
//! that order. A candidate that fails its probe is skipped; selection only
//! fails when nothing usable is left.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::error_handling::{errors, DownloadError, DownloadResult};
use crate::core::models::{MediaManifest, QualityPreference, StreamDescriptor, StreamKind};
use crate::core::transport::{HttpTransport, ProbeInfo};

/// Streams chosen for one job
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Single(StreamDescriptor),
    Pair {
        video: StreamDescriptor,
        audio: StreamDescriptor,
    },
}

impl Selection {
    pub fn into_streams(self) -> Vec<StreamDescriptor> {
        match self {
            Selection::Single(stream) => vec![stream],
            Selection::Pair { video, audio } => vec![video, audio],
        }
    }

    /// The stream that decides picture quality
    pub fn picture(&self) -> &StreamDescriptor {
        match self {
            Selection::Single(stream) => stream,
            Selection::Pair { video, .. } => video,
        }
    }
}

/// Order picture candidates (video and muxed) by preference
pub fn rank_picture_candidates(
    manifest: &MediaManifest,
    preference: QualityPreference,
) -> Vec<StreamDescriptor> {
    let mut ranked: Vec<StreamDescriptor> = manifest
        .candidates
        .iter()
        .filter(|c| matches!(c.kind, StreamKind::Video | StreamKind::Muxed))
        .cloned()
        .collect();
    ranked.sort_by(|a, b| b.quality.cmp(&a.quality));

    match preference {
        QualityPreference::Best => {}
        QualityPreference::AtMost(limit) => {
            let capped: Vec<StreamDescriptor> = ranked
                .iter()
                .filter(|c| c.quality <= limit)
                .cloned()
                .collect();
            // 全部高于上限时退回完整列表
            if !capped.is_empty() {
                ranked = capped;
            }
        }
        QualityPreference::Lowest => ranked.reverse(),
    }
    ranked
}

/// Probes candidates through the transport, remembering each URL's outcome
pub struct FormatSelector {
    transport: Arc<dyn HttpTransport>,
    probes: HashMap<String, DownloadResult<ProbeInfo>>,
    last_error: Option<DownloadError>,
}

impl FormatSelector {
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            transport,
            probes: HashMap::new(),
            last_error: None,
        }
    }

    async fn probe(&mut self, candidate: &StreamDescriptor) -> Option<StreamDescriptor> {
        let outcome = match self.probes.get(&candidate.url) {
            Some(cached) => cached.clone(),
            None => {
                let result = self
                    .transport
                    .probe(&candidate.url, &candidate.headers())
                    .await;
                self.probes.insert(candidate.url.clone(), result.clone());
                result
            }
        };

        match outcome {
            Ok(info) => {
                let mut chosen = candidate.clone();
                if chosen.size_hint.is_none() {
                    chosen.size_hint = info.content_length;
                }
                Some(chosen)
            }
            Err(e) => {
                warn!("Candidate {} ({}) failed probe: {}", candidate.label, candidate.url, e);
                self.last_error = Some(e);
                None
            }
        }
    }

    async fn best_audio(&mut self, manifest: &MediaManifest) -> Option<StreamDescriptor> {
        let mut audio: Vec<StreamDescriptor> =
            manifest.candidates_of(StreamKind::Audio).cloned().collect();
        audio.sort_by(|a, b| b.quality.cmp(&a.quality));
        for candidate in &audio {
            if let Some(chosen) = self.probe(candidate).await {
                return Some(chosen);
            }
        }
        None
    }

    /// Pick the best reachable stream set for `preference`
    pub async fn select(
        mut self,
        manifest: &MediaManifest,
        preference: QualityPreference,
    ) -> DownloadResult<Selection> {
        let ranked = rank_picture_candidates(manifest, preference);
        let mut audio: Option<Option<StreamDescriptor>> = None;

        for candidate in &ranked {
            if candidate.kind == StreamKind::Video {
                // 音频只探测一次，所有视频候选共用
                if audio.is_none() {
                    audio = Some(self.best_audio(manifest).await);
                }
                if matches!(audio, Some(None)) {
                    debug!("No reachable audio, skipping separate video {}", candidate.label);
                    continue;
                }
            }

            let Some(picture) = self.probe(candidate).await else {
                continue;
            };
            let selection = match (picture.kind, &audio) {
                (StreamKind::Video, Some(Some(track))) => Selection::Pair {
                    video: picture,
                    audio: track.clone(),
                },
                _ => Selection::Single(picture),
            };
            debug!("Selected {} for {}", selection.picture().label, manifest.page_url);
            return Ok(selection);
        }

        Err(self.last_error.unwrap_or_else(|| {
            errors::no_streams(format!("no usable stream among candidates of {}", manifest.page_url))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error_handling::{FetchFailure, ExtractionFailure};
    use crate::core::test_support::MemoryTransport;

    fn candidate(kind: StreamKind, url: &str, quality: u32) -> StreamDescriptor {
        StreamDescriptor::new(kind, url, quality).with_label(format!("{}", quality))
    }

    fn manifest(candidates: Vec<StreamDescriptor>) -> MediaManifest {
        MediaManifest::new("clip", candidates, "https://www.video.test/watch/1")
    }

    fn dash_manifest() -> MediaManifest {
        manifest(vec![
            candidate(StreamKind::Video, "https://cdn.test/v1080", 1080),
            candidate(StreamKind::Video, "https://cdn.test/v720", 720),
            candidate(StreamKind::Video, "https://cdn.test/v480", 480),
            candidate(StreamKind::Audio, "https://cdn.test/a_high", 192),
            candidate(StreamKind::Audio, "https://cdn.test/a_low", 64),
        ])
    }

    fn transport_with_all() -> Arc<MemoryTransport> {
        let transport = MemoryTransport::new();
        for url in ["v1080", "v720", "v480", "a_high", "a_low"] {
            transport.insert(&format!("https://cdn.test/{}", url), vec![0u8; 100]);
        }
        Arc::new(transport)
    }

    #[test]
    fn test_rank_preferences() {
        let m = dash_manifest();
        let q = |p| -> Vec<u32> {
            rank_picture_candidates(&m, p).iter().map(|c| c.quality).collect()
        };
        assert_eq!(q(QualityPreference::Best), vec![1080, 720, 480]);
        assert_eq!(q(QualityPreference::AtMost(720)), vec![720, 480]);
        assert_eq!(q(QualityPreference::AtMost(240)), vec![1080, 720, 480]);
        assert_eq!(q(QualityPreference::Lowest), vec![480, 720, 1080]);
    }

    #[tokio::test]
    async fn test_rejected_candidate_falls_through() {
        let transport = transport_with_all();
        transport.fail_probe("https://cdn.test/v1080", 403);

        let selection = FormatSelector::new(transport.clone())
            .select(&dash_manifest(), QualityPreference::Best)
            .await
            .unwrap();
        match selection {
            Selection::Pair { video, audio } => {
                assert_eq!(video.quality, 720);
                assert_eq!(audio.url, "https://cdn.test/a_high");
                assert_eq!(video.size_hint, Some(100));
            }
            other => panic!("expected a pair, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_audio_checked_once() {
        let transport = transport_with_all();
        transport.fail_probe("https://cdn.test/v1080", 500);
        transport.fail_probe("https://cdn.test/v720", 500);

        let selection = FormatSelector::new(transport.clone())
            .select(&dash_manifest(), QualityPreference::Best)
            .await
            .unwrap();
        assert_eq!(selection.picture().quality, 480);
        // a_high once, then three video probes
        assert_eq!(transport.probe_count(), 4);
    }

    #[tokio::test]
    async fn test_video_without_audio_uses_muxed() {
        let transport = MemoryTransport::new();
        transport.insert("https://cdn.test/v1080", vec![1; 10]);
        transport.insert("https://cdn.test/full480.mp4", vec![2; 10]);
        let m = manifest(vec![
            candidate(StreamKind::Video, "https://cdn.test/v1080", 1080),
            candidate(StreamKind::Audio, "https://cdn.test/missing_audio", 128),
            candidate(StreamKind::Muxed, "https://cdn.test/full480.mp4", 480),
        ]);

        let selection = FormatSelector::new(Arc::new(transport))
            .select(&m, QualityPreference::Best)
            .await
            .unwrap();
        assert_eq!(selection, Selection::Single(
            candidate(StreamKind::Muxed, "https://cdn.test/full480.mp4", 480).with_size_hint(Some(10))
        ));
    }

    #[tokio::test]
    async fn test_exhaustion_reports_last_candidate_error() {
        let transport = MemoryTransport::new();
        transport.insert("https://cdn.test/only.mp4", vec![1; 10]);
        transport.fail_probe("https://cdn.test/only.mp4", 404);
        let m = manifest(vec![candidate(StreamKind::Muxed, "https://cdn.test/only.mp4", 720)]);

        let err = FormatSelector::new(Arc::new(transport))
            .select(&m, QualityPreference::Best)
            .await
            .unwrap_err();
        assert_eq!(err.fetch_reason(), Some(FetchFailure::Rejected));
    }

    #[tokio::test]
    async fn test_audio_only_manifest_has_no_streams() {
        let transport = transport_with_all();
        let m = manifest(vec![candidate(StreamKind::Audio, "https://cdn.test/a_high", 192)]);
        let err = FormatSelector::new(transport)
            .select(&m, QualityPreference::Best)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Extraction { reason: ExtractionFailure::NoStreamsFound, .. }
        ));
    }
}
