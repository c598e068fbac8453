// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    DynError,
    time::{DtsOffset, Duration, DurationH264, UnixH264, UnixNano},
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

// Parameters of the stream feeding a HLS muxer path.
#[derive(Clone, Debug, Default)]
pub struct StreamInfo {
    pub video_sps: Vec<u8>,
    pub video_pps: Vec<u8>,
    pub video_profile_idc: u8,
    pub video_level_idc: u8,
    pub video_width: u16,
    pub video_height: u16,

    pub audio_track_exist: bool,
    pub audio_track_config: Vec<u8>,
    pub audio_clock_rate: u32,
    pub audio_channel_count: u16,
}

#[derive(Clone, Debug, Default)]
pub struct VideoSample {
    pub pts: UnixH264,
    pub dts: UnixH264,

    // Decode timestamp of the following sample.
    pub next_dts: UnixH264,

    // Length-prefixed NAL units.
    pub avcc: Bytes,

    pub idr_present: bool,
}

impl VideoSample {
    #[must_use]
    pub fn duration(&self) -> DurationH264 {
        self.next_dts
            .checked_sub(self.dts)
            .map(DurationH264::from)
            .unwrap_or_default()
    }

    #[must_use]
    pub fn dts_offset(&self) -> DtsOffset {
        DtsOffset::new(i32::try_from(*self.pts - *self.dts).unwrap_or(0))
    }
}

// A single AAC access unit. Timestamps use the audio clock rate.
#[derive(Clone, Debug, Default)]
pub struct AudioSample {
    pub au: Bytes,
    pub pts: i64,
    pub next_pts: i64,
}

impl AudioSample {
    #[must_use]
    pub fn duration(&self) -> i64 {
        self.next_pts - self.pts
    }
}

#[derive(Clone, Debug, Default)]
pub struct MuxerPart {
    pub video_samples: Vec<VideoSample>,
    pub audio_samples: Vec<AudioSample>,
}

// A finalized unit of muxer output. IDs are strictly monotonic
// contiguous integers, a gap means a segment was skipped.
#[derive(Clone, Debug, Default)]
pub struct Segment {
    pub id: u64,
    pub start_time: UnixNano,
    pub rendered_duration: Duration,
    pub parts: Vec<Arc<MuxerPart>>,
}

impl Segment {
    // Time at which the following segment is expected to start.
    #[must_use]
    pub fn end_time(&self) -> Option<UnixNano> {
        self.start_time.checked_add(self.rendered_duration)
    }
}

pub type ArcHlsMuxer = Arc<dyn HlsMuxer + Send + Sync>;

#[async_trait]
pub trait HlsMuxer {
    // Returns the first segment with an ID greater than `prev_id`.
    // Blocks until such a segment exists or the muxer gives up.
    async fn next_segment(&self, prev_id: u64) -> Result<Arc<Segment>, DynError>;

    // Parameters of the underlying stream. None until the muxer
    // has seen enough of the stream to determine them.
    fn stream_info(&self) -> Option<StreamInfo>;

    // Blocks until a new segment has been finalized.
    async fn wait_for_seg_finalized(&self);
}

// Path registration request.
#[derive(Clone, Debug)]
pub struct PathConf {
    pub monitor_id: String,
    pub is_sub: bool,
}

// Snapshot of a registered server path.
#[derive(Clone)]
pub struct ServerPath {
    pub hls_address: String,
    pub rtsp_address: String,
    pub rtsp_protocol: String,
    pub hls_muxer: ArcHlsMuxer,
}

pub type ArcVideoServer = Arc<dyn VideoServer + Send + Sync>;

#[async_trait]
pub trait VideoServer {
    // Registers a new path that an ingest process can publish to.
    // The path is removed when the token is cancelled.
    async fn new_path(
        &self,
        token: CancellationToken,
        name: &str,
        conf: PathConf,
    ) -> Result<ServerPath, DynError>;
}
