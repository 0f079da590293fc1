//! Muxer boundary.
//!
//! The publisher session talks to its muxer only through the [`Muxer`]
//! trait: track announcement, frame input, a media listener for reader
//! edges, and the reader count used by the admin close path. [`TsMuxer`]
//! is the in-crate implementation that passes TS frames straight through
//! to a [`TsMediaSource`]; richer muxers (HLS, FLV, ...) live outside the
//! core and plug in at the same seam.

use std::sync::{Arc, Weak};

use crate::config::Config;
use crate::error::Result;
use crate::media::{Frame, MediaInfo, SourceDelegate, Track, TsMediaSource, TsPacket};
use crate::registry::MediaRegistry;

pub trait Muxer: Send {
    /// Announce a track. Returns whether the muxer accepted it.
    fn add_track(&mut self, track: Track) -> bool;

    /// All tracks announced; frames follow.
    fn add_track_completed(&mut self);

    /// Feed one frame. `Ok(true)` when consumed, `Ok(false)` when the
    /// muxer is not ready for frames yet.
    fn input_frame(&mut self, frame: Frame) -> Result<bool>;

    /// Install the listener receiving reader-count edges.
    fn set_media_listener(&mut self, listener: Weak<dyn SourceDelegate>);

    /// Readers attached across every output of this muxer.
    fn total_reader_count(&self) -> usize;
}

/// Passthrough muxer: one TS output bound to one identity.
///
/// The media source is created on the first frame, which is also where a
/// conflicting live publisher on the same identity surfaces as
/// `Err(Conflict)`.
pub struct TsMuxer {
    media: MediaInfo,
    registry: Arc<MediaRegistry>,
    config: Config,
    source: Option<Arc<TsMediaSource>>,
    listener: Weak<dyn SourceDelegate>,
    tracks: Vec<Track>,
    tracks_completed: bool,
}

impl TsMuxer {
    pub fn new(media: &MediaInfo, registry: Arc<MediaRegistry>, config: &Config) -> Self {
        TsMuxer {
            media: media.clone(),
            registry,
            config: config.clone(),
            source: None,
            listener: Weak::<Nobody>::new(),
            tracks: Vec::new(),
            tracks_completed: false,
        }
    }

    pub fn source(&self) -> Option<&Arc<TsMediaSource>> {
        self.source.as_ref()
    }

    fn ensure_source(&mut self) -> &Arc<TsMediaSource> {
        if self.source.is_none() {
            let source = TsMediaSource::new(&self.media, self.registry.clone(), &self.config);
            source.set_delegate(self.listener.clone());
            self.source = Some(source);
        }
        self.source.as_ref().unwrap()
    }
}

impl Muxer for TsMuxer {
    fn add_track(&mut self, track: Track) -> bool {
        if self.tracks_completed {
            tracing::warn!(codec = %track.codec, "track announced after completion, ignored");
            return false;
        }
        tracing::debug!(codec = %track.codec, stream = %self.media.tuple(), "track added");
        self.tracks.push(track);
        true
    }

    fn add_track_completed(&mut self) {
        self.tracks_completed = true;
        tracing::debug!(tracks = self.tracks.len(), stream = %self.media.tuple(), "track set complete");
    }

    fn input_frame(&mut self, frame: Frame) -> Result<bool> {
        let keyframe = frame.keyframe;
        let packet = TsPacket::new(frame.data, frame.dts, keyframe);
        self.ensure_source().on_write(packet, keyframe)?;
        Ok(true)
    }

    fn set_media_listener(&mut self, listener: Weak<dyn SourceDelegate>) {
        if let Some(source) = &self.source {
            source.set_delegate(listener.clone());
        }
        self.listener = listener;
    }

    fn total_reader_count(&self) -> usize {
        self.source.as_ref().map_or(0, |s| s.reader_count())
    }
}

struct Nobody;
impl SourceDelegate for Nobody {
    fn on_reader_changed(&self, _count: usize) {}
}
