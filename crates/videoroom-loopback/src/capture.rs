//! Synthetic capture device.

use async_trait::async_trait;
use common::error::CaptureError;
use common::media::{CaptureConstraints, LocalStream, MediaCapture, MediaTrack, TrackKind};
use common::types::TrackId;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Produces fresh live tracks for every acquisition, or fails if built with
/// [`LoopbackCapture::denied`].
#[derive(Debug, Clone, Default)]
pub struct LoopbackCapture {
    deny: bool,
    acquired: Arc<AtomicU64>,
}

impl LoopbackCapture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A device whose permission prompt is always refused.
    #[must_use]
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    /// Number of successful acquisitions.
    #[must_use]
    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCapture for LoopbackCapture {
    async fn acquire_local_stream(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<LocalStream, CaptureError> {
        if self.deny {
            return Err(CaptureError::PermissionDenied);
        }
        let n = self.acquired.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(
                TrackId::new(format!("local-{n}-audio")),
                TrackKind::Audio,
            ));
        }
        if let Some(resolution) = constraints.video {
            tracks.push(MediaTrack::new(
                TrackId::new(format!(
                    "local-{n}-video-{}x{}",
                    resolution.width, resolution.height
                )),
                TrackKind::Video,
            ));
        }
        Ok(LocalStream::new(tracks))
    }
}
