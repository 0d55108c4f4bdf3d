//! Local media and the master audio source

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::error::{Error, Result};
use crate::link::{AttachOutcome, PeerLink};
use crate::types::{ParticipantId, TrackId, TrackKind};

/// An outbound media track plus its enabled flag
///
/// Clones share the enabled flag, so toggling one clone mutes every link
/// that sends it.
#[derive(Clone)]
pub struct LocalTrack {
    id: TrackId,
    kind: TrackKind,
    stream_id: String,
    enabled: Arc<AtomicBool>,
    media: Arc<dyn TrackLocal + Send + Sync>,
}

impl LocalTrack {
    pub fn new(media: Arc<dyn TrackLocal + Send + Sync>) -> Self {
        Self {
            id: TrackId::new(media.id()),
            kind: TrackKind::from(media.kind()),
            stream_id: media.stream_id().to_string(),
            enabled: Arc::new(AtomicBool::new(true)),
            media,
        }
    }

    /// Opus sample track; the returned handle is where samples are written
    pub fn opus(id: impl Into<String>, stream_id: impl Into<String>) -> (Self, Arc<TrackLocalStaticSample>) {
        Self::sample_track(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            id.into(),
            stream_id.into(),
        )
    }

    /// VP8 sample track
    pub fn vp8(id: impl Into<String>, stream_id: impl Into<String>) -> (Self, Arc<TrackLocalStaticSample>) {
        Self::sample_track(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
            id.into(),
            stream_id.into(),
        )
    }

    fn sample_track(
        codec: RTCRtpCodecCapability,
        id: String,
        stream_id: String,
    ) -> (Self, Arc<TrackLocalStaticSample>) {
        let sample = Arc::new(TrackLocalStaticSample::new(codec, id, stream_id));
        let track = Self::new(Arc::clone(&sample) as Arc<dyn TrackLocal + Send + Sync>);
        (track, sample)
    }

    #[must_use]
    pub fn id(&self) -> &TrackId {
        &self.id
    }

    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    #[must_use]
    pub fn media(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.media)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Flip the enabled flag and return the new value
    pub fn toggle(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// The local participant's own microphone and camera
///
/// Attached to every link where the sender slot of their kind is free; the
/// master source takes precedence on a host's links.
#[derive(Debug, Clone, Default)]
pub struct LocalMedia {
    pub microphone: Option<LocalTrack>,
    pub camera: Option<LocalTrack>,
}

impl LocalMedia {
    #[must_use]
    pub fn track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        match kind {
            TrackKind::Audio => self.microphone.as_ref(),
            TrackKind::Video => self.camera.as_ref(),
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.microphone.iter().chain(self.camera.iter())
    }

    /// Flip the enabled flag of the track of `kind`
    pub fn toggle(&self, kind: TrackKind) -> Result<bool> {
        let track = self.track(kind).ok_or(Error::NoLocalTrack(kind))?;
        let enabled = track.toggle();
        info!(kind = %kind, track_id = %track.id(), enabled, "Toggled local track");
        Ok(enabled)
    }
}

/// Media the host broadcasts to every viewer
///
/// Holds at most one track per kind. Audio is mandatory for hosting; video is
/// optional.
#[derive(Debug, Clone, Default)]
pub struct MasterSource {
    audio: Option<LocalTrack>,
    video: Option<LocalTrack>,
}

impl MasterSource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.audio.is_some()
    }

    #[must_use]
    pub fn audio(&self) -> Option<&LocalTrack> {
        self.audio.as_ref()
    }

    #[must_use]
    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    pub fn tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.audio.iter().chain(self.video.iter())
    }

    /// Store `track` in its kind's slot; returns the track it displaced
    pub fn set(&mut self, track: LocalTrack) -> Option<LocalTrack> {
        let slot = match track.kind() {
            TrackKind::Audio => &mut self.audio,
            TrackKind::Video => &mut self.video,
        };
        slot.replace(track)
    }

    pub fn clear(&mut self) {
        self.audio = None;
        self.video = None;
    }

    /// Stop broadcasting video; returns the track that was removed
    pub fn clear_video(&mut self) -> Option<LocalTrack> {
        self.video.take()
    }

    /// Attach every master track to `link`
    ///
    /// The returned outcome is the strongest one over all tracks, so `Added`
    /// means the link needs renegotiation.
    pub async fn attach(&self, link: &mut PeerLink) -> Result<AttachOutcome> {
        let mut outcome = AttachOutcome::Unchanged;
        for track in self.tracks() {
            outcome = outcome.max(link.attach_track(track).await?);
        }
        link.set_carries_master(true);
        Ok(outcome)
    }

    /// Swap in a new master track and apply it to every link already carrying
    /// the master
    ///
    /// All links are updated before this returns; per-link failures are
    /// reported rather than aborting the pass.
    pub async fn replace<'a, I>(
        &mut self,
        track: LocalTrack,
        links: I,
    ) -> Vec<(ParticipantId, Result<AttachOutcome>)>
    where
        I: IntoIterator<Item = &'a mut PeerLink>,
    {
        if let Some(previous) = self.set(track.clone()) {
            debug!(old_track = %previous.id(), new_track = %track.id(), "Master track replaced");
        }

        let mut results = Vec::new();
        for link in links {
            if !link.carries_master() {
                continue;
            }
            let result = link.attach_track(&track).await;
            results.push((link.peer().clone(), result));
        }
        results
    }
}
