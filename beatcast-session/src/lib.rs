//! Beatcast realtime session core
//!
//! One host broadcasts a master audio track (and optionally video) to any
//! number of viewers sharing a session. Viewers may join and leave at any
//! time and are brought in sync with the host's playback position on join.
//!
//! ## Architecture
//!
//! - **`PresenceTracker`**: roster of the session, built from presence events
//! - **`SignalRouter`**: addressed negotiation envelopes over the shared channel
//! - **`PeerLink`**: per-participant offer/answer/ICE state machine
//! - **`MasterSource`**: the host's broadcast tracks, replaced in place on every link
//! - **`Session`**: coordinator owning all of the above
//! - **`SessionDriver`**: event loop that owns a `Session` and serves a `SessionHandle`
//!
//! The transport is abstracted by [`SessionChannel`] ([`SessionHub`] is the
//! in-process implementation) and media connections by [`ConnectionFactory`]
//! ([`WebRtcConnectionFactory`] is backed by webrtc-rs).
//!
//! ## Usage
//!
//! ```rust,ignore
//! use beatcast_session::*;
//!
//! let hub = SessionHub::new();
//! let (channel, events) = hub.connect(SessionId::from("room"), ParticipantId::from("host"));
//! let (session, link_events) = Session::new(SessionParams {
//!     username: "host".into(),
//!     config: SessionConfig::default(),
//!     channel: Arc::new(channel),
//!     connections: Arc::new(WebRtcConnectionFactory::new(&WebRtcConfig::default())?),
//!     clock: Arc::new(LoopClock::new(8.0)),
//!     local_media: LocalMedia::default(),
//! });
//! let (handle, _task) = SessionDriver::new(session, link_events, events).spawn();
//! handle.set_master_track(track).await?;
//! handle.start_as_host().await?;
//! ```

pub mod channel;
pub mod config;
pub mod dedup;
pub mod driver;
pub mod error;
pub mod hub;
pub mod link;
pub mod logging;
pub mod media;
pub mod presence;
pub mod protocol;
pub mod rtc;
pub mod session;
pub mod signal;
pub mod sync;
pub mod types;

#[cfg(test)]
pub mod test_helpers;

pub use channel::{ChannelEvent, SessionChannel};
pub use config::{Config, LoggingConfig, SessionConfig, WebRtcConfig};
pub use driver::{SessionDriver, SessionHandle, TrackFeed};
pub use error::{Error, Result};
pub use hub::{HubChannel, SessionHub};
pub use link::{
    AttachOutcome, ConnectionFactory, ConnectionState, LinkEvent, LinkEventKind, LinkEventSink, LinkRole, LinkState,
    PeerConnection, PeerLink, RemoteMedia,
};
pub use logging::init_logging;
pub use media::{LocalMedia, LocalTrack, MasterSource};
pub use presence::{Participant, PresenceTracker, RosterDelta};
pub use protocol::{
    IceCandidate, PresencePayload, SdpKind, SessionDescription, Signal, SignalEnvelope, SignalKind, SyncSnapshot,
};
pub use rtc::WebRtcConnectionFactory;
pub use session::{LinkStatus, Session, SessionNotice, SessionParams, SessionState, SessionStatus};
pub use signal::SignalRouter;
pub use sync::{LoopClock, PlaybackClock};
pub use types::{ParticipantId, Role, SenderId, SessionId, TrackId, TrackKind};
