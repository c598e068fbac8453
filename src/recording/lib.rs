// SPDX-License-Identifier: GPL-2.0-or-later

mod mp4_muxer;
mod video;

pub use mp4_muxer::{
    FinalizeMp4Error, Mp4Writer, NewMp4WriterError, WriteSegmentError, single_frame_mp4,
};
pub use video::{
    AudioConfig, HeaderFromReaderError, MetaHeader, MetaReader, NewMetaReaderError,
    NewVideoWriterError, ReadAllSamplesError, SAMPLE_SIZE, Sample, VideoWriter, WriteSampleError,
};

pub const VIDEO_TRACK_ID: u32 = 1;
pub const AUDIO_TRACK_ID: u32 = 2;
