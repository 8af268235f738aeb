//! Local capture handle.
//!
//! Capture is acquired once per process. When access is granted the handle
//! owns one audio and one video [`TrackLocalStaticSample`], fed by a synthetic
//! source (Opus silence and a constant VP8 frame) once
//! [`LocalMedia::start_source`] runs. Toggling a kind stops writes to its
//! track; releasing stops the source for good.
//!
//! Denial is not fatal: the client can still answer calls and chat, but
//! starting a call stays disabled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const STREAM_ID: &str = "callbox-local";

/// One 20ms Opus frame of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const AUDIO_FRAME: Duration = Duration::from_millis(20);

/// VP8 key-frame header for a 16x16 picture; enough for receivers to see RTP.
const VP8_FILLER: [u8; 10] = [0x10, 0x02, 0x00, 0x9d, 0x01, 0x2a, 0x10, 0x00, 0x10, 0x00];
const VIDEO_FRAME: Duration = Duration::from_millis(33);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaAccess {
    Granted,
    Denied(String),
}

impl MediaAccess {
    pub fn is_granted(&self) -> bool {
        matches!(self, MediaAccess::Granted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    fn codec(self) -> RTCRtpCodecCapability {
        match self {
            TrackKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            TrackKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90_000,
                ..Default::default()
            },
        }
    }

    fn synthetic_frame(self) -> (Bytes, Duration) {
        match self {
            TrackKind::Audio => (Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME),
            TrackKind::Video => (Bytes::from_static(&VP8_FILLER), VIDEO_FRAME),
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Clone)]
struct LocalTrack {
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    enabled: Arc<AtomicBool>,
    written: Arc<AtomicU64>,
}

impl LocalTrack {
    fn new(kind: TrackKind) -> Self {
        Self {
            kind,
            track: Arc::new(TrackLocalStaticSample::new(
                kind.codec(),
                kind.to_string(),
                STREAM_ID.to_owned(),
            )),
            enabled: Arc::new(AtomicBool::new(true)),
            written: Arc::new(AtomicU64::new(0)),
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

pub struct LocalMedia {
    access: MediaAccess,
    tracks: Vec<LocalTrack>,
    source: CancellationToken,
    source_started: bool,
    released: bool,
}

impl LocalMedia {
    pub fn acquire(access: MediaAccess) -> Self {
        let tracks = match &access {
            MediaAccess::Granted => {
                info!("local media acquired");
                vec![LocalTrack::new(TrackKind::Audio), LocalTrack::new(TrackKind::Video)]
            }
            MediaAccess::Denied(reason) => {
                warn!(reason = %reason, "local media unavailable; calls can only be answered");
                Vec::new()
            }
        };
        Self {
            access,
            tracks,
            source: CancellationToken::new(),
            source_started: false,
            released: false,
        }
    }

    pub fn access(&self) -> &MediaAccess {
        &self.access
    }

    /// Whether capture is held and can feed an outgoing call.
    pub fn is_available(&self) -> bool {
        self.access.is_granted() && !self.released
    }

    /// Tracks to attach to new peer connections; empty without capture.
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.tracks
            .iter()
            .map(|local| Arc::clone(&local.track) as Arc<dyn TrackLocal + Send + Sync>)
            .collect()
    }

    /// Starts writing synthetic frames to every track. Must run inside a
    /// tokio runtime; later calls are no-ops.
    pub fn start_source(&mut self) {
        if self.source_started || !self.is_available() {
            return;
        }
        self.source_started = true;
        for local in &self.tracks {
            tokio::spawn(pump(local.clone(), self.source.clone()));
        }
        debug!(tracks = self.tracks.len(), "synthetic media source started");
    }

    pub fn is_enabled(&self, kind: TrackKind) -> bool {
        self.track(kind).is_some_and(LocalTrack::is_enabled)
    }

    /// Frames written to the track of `kind` so far.
    pub fn frames_written(&self, kind: TrackKind) -> u64 {
        self.track(kind)
            .map_or(0, |local| local.written.load(Ordering::SeqCst))
    }

    /// Flips the enablement of one track kind and returns the new state, or
    /// `None` when there is no capture to toggle.
    pub fn toggle(&mut self, kind: TrackKind) -> Option<bool> {
        if !self.is_available() {
            return None;
        }
        let local = self.track(kind)?;
        let enabled = !local.enabled.fetch_xor(true, Ordering::SeqCst);
        info!(kind = %kind, enabled, "local track toggled");
        Some(enabled)
    }

    /// Stops all local tracks. Returns `false` if they were already stopped.
    pub fn release(&mut self) -> bool {
        if self.released || !self.access.is_granted() {
            return false;
        }
        self.released = true;
        for local in &self.tracks {
            local.enabled.store(false, Ordering::SeqCst);
        }
        self.source.cancel();
        info!("local media released");
        true
    }

    fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|local| local.kind == kind)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("access", &self.access)
            .field("audio", &self.is_enabled(TrackKind::Audio))
            .field("video", &self.is_enabled(TrackKind::Video))
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.release();
    }
}

async fn pump(local: LocalTrack, stop: CancellationToken) {
    let (frame, duration) = local.kind.synthetic_frame();
    let mut ticker = tokio::time::interval(duration);
    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }
        if !local.is_enabled() {
            continue;
        }
        let sample = Sample {
            data: frame.clone(),
            duration,
            ..Default::default()
        };
        match local.track.write_sample(&sample).await {
            Ok(()) => {
                local.written.fetch_add(1, Ordering::SeqCst);
            }
            Err(err) => debug!(kind = %local.kind, error = %err, "failed to write sample"),
        }
    }
    debug!(kind = %local.kind, "synthetic source stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[test_timeout::timeout]
    fn toggles_report_new_state() {
        let mut media = LocalMedia::acquire(MediaAccess::Granted);
        assert_eq!(media.tracks().len(), 2);
        assert_eq!(media.toggle(TrackKind::Video), Some(false));
        assert!(media.is_enabled(TrackKind::Audio));
        assert_eq!(media.toggle(TrackKind::Video), Some(true));
        assert_eq!(media.toggle(TrackKind::Audio), Some(false));
    }

    #[test_timeout::timeout]
    fn denied_capture_cannot_toggle_or_call() {
        let mut media = LocalMedia::acquire(MediaAccess::Denied("no camera".into()));
        assert!(!media.is_available());
        assert!(media.tracks().is_empty());
        assert_eq!(media.toggle(TrackKind::Audio), None);
        assert!(!media.release());
    }

    #[test_timeout::timeout]
    fn release_happens_once() {
        let mut media = LocalMedia::acquire(MediaAccess::Granted);
        assert!(media.release());
        assert!(!media.release());
        assert!(!media.is_available());
        assert_eq!(media.toggle(TrackKind::Video), None);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn toggling_and_release_gate_written_frames() {
        let mut media = LocalMedia::acquire(MediaAccess::Granted);
        media.start_source();
        sleep(Duration::from_millis(150)).await;
        assert!(media.frames_written(TrackKind::Audio) > 0);
        assert!(media.frames_written(TrackKind::Video) > 0);

        assert_eq!(media.toggle(TrackKind::Audio), Some(false));
        sleep(Duration::from_millis(50)).await;
        let muted = media.frames_written(TrackKind::Audio);
        let video = media.frames_written(TrackKind::Video);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(media.frames_written(TrackKind::Audio), muted);
        assert!(media.frames_written(TrackKind::Video) > video);

        assert!(media.release());
        sleep(Duration::from_millis(50)).await;
        let stopped = media.frames_written(TrackKind::Video);
        sleep(Duration::from_millis(150)).await;
        assert_eq!(media.frames_written(TrackKind::Video), stopped);
    }
}
