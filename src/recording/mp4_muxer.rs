// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{AUDIO_TRACK_ID, VIDEO_TRACK_ID};
use common::{
    Segment, StreamInfo, VideoSample,
    time::{Duration, H264_TIMESCALE, MILLISECOND, UnixNano, nano_to_timescale},
};
use mp4::Mp4Error;
use std::io::SeekFrom;
use thiserror::Error;
use tokio::io::{AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

const MATRIX: [i32; 9] = [0x0001_0000, 0, 0, 0, 0x0001_0000, 0, 0, 0, 0x4000_0000];
const RATE: i32 = 0x0001_0000;
const VOLUME: i16 = 0x0100;
const MVHD_TIMESCALE: u32 = 1000;

// Fixed bitrate fields of the audio decoder config descriptor.
const ESDS_BITRATE: u32 = 128_825;

const FTYP_SIZE: u32 = 20;
const MDAT_HEADER_SIZE: u32 = 8;

fn ftyp() -> mp4::Ftyp {
    mp4::Ftyp {
        major_brand: *b"iso4",
        minor_version: 512,
        compatible_brands: vec![mp4::CompatibleBrandElem(*b"iso4")],
    }
}

// Sample table bookkeeping for a single track.
#[derive(Default)]
struct TrackState {
    stts: Vec<mp4::SttsEntry>,
    stss: Vec<u32>,
    ctts: Vec<mp4::CttsEntry>,
    stsc: Vec<mp4::StscEntry>,
    stsz: Vec<u32>,
    stco: Vec<u32>,
    chunk_count: u32,
    duration: u64,
}

impl TrackState {
    // Starts a new chunk at the given absolute file offset.
    fn begin_chunk(&mut self, offset: u32, samples_per_chunk: u32) {
        self.chunk_count += 1;
        self.stco.push(offset);
        match self.stsc.last() {
            Some(last) if last.samples_per_chunk == samples_per_chunk => {}
            _ => self.stsc.push(mp4::StscEntry {
                first_chunk: self.chunk_count,
                samples_per_chunk,
                sample_description_index: 1,
            }),
        }
    }

    fn push_delta(&mut self, delta: u32) {
        self.duration += u64::from(delta);
        match self.stts.last_mut() {
            Some(last) if last.sample_delta == delta => {
                last.sample_count += 1;
            }
            _ => self.stts.push(mp4::SttsEntry {
                sample_count: 1,
                sample_delta: delta,
            }),
        }
    }

    fn push_cts(&mut self, cts: i32) {
        match self.ctts.last_mut() {
            Some(last) if last.sample_offset == cts => {
                last.sample_count += 1;
            }
            _ => self.ctts.push(mp4::CttsEntry {
                sample_count: 1,
                sample_offset: cts,
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum NewMp4WriterError {
    #[error("mp4: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("write: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteSegmentError {
    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("write: {0}")]
    Write(#[from] std::io::Error),

    #[error("add")]
    Add,
}

#[derive(Debug, Error)]
pub enum FinalizeMp4Error {
    #[error("mp4: {0}")]
    Mp4(#[from] Mp4Error),

    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("write: {0}")]
    Write(#[from] std::io::Error),

    #[error("add")]
    Add,

    #[error("subtract")]
    Sub,
}

// Writes a self-contained progressive mp4.
//
//   ftyp
//   mdat <- size patched on finalization.
//   moov
//   - mvhd
//   - trak (video)
//   - trak (audio, optional)
//
// The mdat box is written while segments arrive, the index boxes are
// kept in memory and appended when the file is finalized.
pub struct Mp4Writer<W: AsyncWrite + AsyncSeek + Unpin> {
    file: W,
    info: StreamInfo,
    start_time: UnixNano,

    mdat_pos: u32,
    dts_shift: Option<i64>,
    video: TrackState,
    audio: TrackState,
}

impl<W: AsyncWrite + AsyncSeek + Unpin> Mp4Writer<W> {
    // Creates a new writer and writes the file type box and the
    // mdat size placeholder.
    pub async fn new(
        mut file: W,
        info: StreamInfo,
        start_time: UnixNano,
    ) -> Result<Mp4Writer<W>, NewMp4WriterError> {
        let mut buf = Vec::new();
        mp4::write_single_box(&mut buf, &ftyp())?;
        mp4::write_box_info(&mut buf, 8, mp4::TYPE_MDAT)?;
        file.write_all(&buf).await?;

        Ok(Self {
            file,
            info,
            start_time,
            mdat_pos: 0,
            dts_shift: None,
            video: TrackState::default(),
            audio: TrackState::default(),
        })
    }

    // Appends all samples in a segment to the mdat box. Each part
    // is written as one video chunk followed by one audio chunk.
    pub async fn write_segment(&mut self, seg: &Segment) -> Result<(), WriteSegmentError> {
        use WriteSegmentError::*;

        for part in &seg.parts {
            if !part.video_samples.is_empty() {
                self.video.begin_chunk(
                    FTYP_SIZE + MDAT_HEADER_SIZE + self.mdat_pos,
                    u32::try_from(part.video_samples.len())?,
                );
                for sample in &part.video_samples {
                    self.video.push_delta(sample.duration().as_u32()?);

                    let pts = *sample.pts;
                    let dts = *sample.dts;
                    let dts_shift = *self.dts_shift.get_or_insert(pts - dts);
                    self.video.push_cts(i32::try_from(pts - (dts + dts_shift))?);

                    let size = u32::try_from(sample.avcc.len())?;
                    self.video.stsz.push(size);
                    if sample.idr_present {
                        self.video.stss.push(u32::try_from(self.video.stsz.len())?);
                    }

                    self.file.write_all(&sample.avcc).await?;
                    self.mdat_pos = self.mdat_pos.checked_add(size).ok_or(Add)?;
                }
            }

            if self.info.audio_track_exist && !part.audio_samples.is_empty() {
                self.audio.begin_chunk(
                    FTYP_SIZE + MDAT_HEADER_SIZE + self.mdat_pos,
                    u32::try_from(part.audio_samples.len())?,
                );
                for sample in &part.audio_samples {
                    self.audio.push_delta(u32::try_from(sample.duration())?);

                    let size = u32::try_from(sample.au.len())?;
                    self.audio.stsz.push(size);

                    self.file.write_all(&sample.au).await?;
                    self.mdat_pos = self.mdat_pos.checked_add(size).ok_or(Add)?;
                }
            }
        }
        self.file.flush().await?;
        Ok(())
    }

    // Appends the moov box and patches the mdat size placeholder.
    pub async fn finalize(mut self, end_time: UnixNano) -> Result<(), FinalizeMp4Error> {
        use FinalizeMp4Error::*;

        let duration = end_time.sub(self.start_time).ok_or(Sub)?;
        let audio = self.info.audio_track_exist.then_some(&self.audio);
        let moov = generate_moov(&self.info, duration, &self.video, audio)?;

        let mut buf = Vec::with_capacity(moov.size());
        moov.marshal(&mut buf)?;
        self.file.write_all(&buf).await?;

        let mdat_size = self.mdat_pos.checked_add(MDAT_HEADER_SIZE).ok_or(Add)?;
        self.file.seek(SeekFrom::Start(FTYP_SIZE.into())).await?;
        self.file.write_all(&mdat_size.to_be_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}

#[allow(clippy::items_after_statements)]
fn generate_moov(
    info: &StreamInfo,
    duration: Duration,
    video: &TrackState,
    audio: Option<&TrackState>,
) -> Result<mp4::Boxes, FinalizeMp4Error> {
    let duration_ms = u32::try_from(*duration / MILLISECOND)?;

    let next_track_id = if audio.is_some() {
        AUDIO_TRACK_ID + 1
    } else {
        VIDEO_TRACK_ID + 1
    };

    let mut moov = mp4::Boxes::new(mp4::Moov).with_children([
        // Mvhd.
        mp4::Boxes::new(mp4::Mvhd {
            timescale: MVHD_TIMESCALE,
            duration: duration_ms,
            rate: RATE,
            volume: VOLUME,
            matrix: MATRIX,
            next_track_id,
            ..Default::default()
        }),
        // Trak.
        generate_video_trak(info, duration_ms, duration, video)?,
    ]);

    if let Some(audio) = audio {
        moov = moov.with_child(generate_audio_trak(info, duration_ms, duration, audio)?);
    }
    Ok(moov)
}

fn generate_video_trak(
    info: &StreamInfo,
    duration_ms: u32,
    duration: Duration,
    state: &TrackState,
) -> Result<mp4::Boxes, FinalizeMp4Error> {
    /*
       trak
       - tkhd
       - mdia
         - mdhd
         - hdlr
         - minf
           - vmhd
           - dinf
             - dref
               - url
           - stbl
    */

    let trak = mp4::Boxes::new(mp4::Trak).with_children([
        // Tkhd.
        mp4::Boxes::new(mp4::Tkhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 3],
            },
            track_id: VIDEO_TRACK_ID,
            duration: duration_ms,
            width: u32::from(info.video_width) * 65536,
            height: u32::from(info.video_height) * 65536,
            matrix: MATRIX,
            ..Default::default()
        }),
        // Mdia.
        mp4::Boxes::new(mp4::Mdia).with_children([
            // Mdhd.
            mp4::Boxes::new(mp4::Mdhd {
                timescale: H264_TIMESCALE,
                duration: duration.as_h264().as_u32()?,
                language: *b"und",
                ..Default::default()
            }),
            // Hdlr.
            mp4::Boxes::new(mp4::Hdlr {
                handler_type: *b"vide",
                name: "VideoHandler".to_owned(),
                ..Default::default()
            }),
            // Minf.
            mp4::Boxes::new(mp4::Minf).with_children([
                // Vmhd.
                mp4::Boxes::new(mp4::Vmhd::default()),
                // Dinf.
                generate_dinf(),
                // Stbl.
                generate_video_stbl(info, state)?,
            ]),
        ]),
    ]);

    Ok(trak)
}

fn generate_audio_trak(
    info: &StreamInfo,
    duration_ms: u32,
    duration: Duration,
    state: &TrackState,
) -> Result<mp4::Boxes, FinalizeMp4Error> {
    let clock_rate = info.audio_clock_rate;
    let media_duration = u32::try_from(nano_to_timescale(*duration, i64::from(clock_rate)))?;

    let trak = mp4::Boxes::new(mp4::Trak).with_children([
        // Tkhd.
        mp4::Boxes::new(mp4::Tkhd {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 3],
            },
            track_id: AUDIO_TRACK_ID,
            duration: duration_ms,
            volume: VOLUME,
            matrix: MATRIX,
            ..Default::default()
        }),
        // Mdia.
        mp4::Boxes::new(mp4::Mdia).with_children([
            // Mdhd.
            mp4::Boxes::new(mp4::Mdhd {
                timescale: clock_rate,
                duration: media_duration,
                language: *b"und",
                ..Default::default()
            }),
            // Hdlr.
            mp4::Boxes::new(mp4::Hdlr {
                handler_type: *b"soun",
                name: "SoundHandler".to_owned(),
                ..Default::default()
            }),
            // Minf.
            mp4::Boxes::new(mp4::Minf).with_children([
                // Smhd.
                mp4::Boxes::new(mp4::Smhd::default()),
                // Dinf.
                generate_dinf(),
                // Stbl.
                generate_audio_stbl(info, state)?,
            ]),
        ]),
    ]);

    Ok(trak)
}

fn generate_dinf() -> mp4::Boxes {
    /*
       dinf
       - dref
         - url
    */
    mp4::Boxes::new(mp4::Dinf).with_child(
        mp4::Boxes::new(mp4::Dref {
            full_box: mp4::FullBox::default(),
            entry_count: 1,
        })
        .with_child(mp4::Boxes::new(mp4::Url {
            full_box: mp4::FullBox {
                version: 0,
                flags: [0, 0, 1],
            },
            location: String::new(),
        })),
    )
}

fn generate_video_stbl(
    info: &StreamInfo,
    state: &TrackState,
) -> Result<mp4::Boxes, FinalizeMp4Error> {
    /*
       stbl
       - stsd
         - avc1
           - avcC
       - stts
       - stss
       - ctts
       - stsc
       - stsz
       - stco
    */

    let stbl = mp4::Boxes::new(mp4::Stbl).with_children([
        // Stsd.
        mp4::Boxes::new(mp4::Stsd {
            full_box: mp4::FullBox::default(),
            entry_count: 1,
        })
        .with_child(
            // Avc1.
            mp4::Boxes::new(mp4::Avc1 {
                sample_entry: mp4::SampleEntry {
                    data_reference_index: 1,
                    ..Default::default()
                },
                width: info.video_width,
                height: info.video_height,
                horiz_resolution: 4_718_592,
                vert_resolution: 4_718_592,
                frame_count: 1,
                depth: 24,
                pre_defined3: -1,
                ..Default::default()
            })
            .with_child(
                // AvcC.
                mp4::Boxes::new(mp4::AvcC {
                    profile: info.video_profile_idc,
                    profile_compatibility: 0,
                    level: info.video_level_idc,
                    sequence_parameter_set: mp4::AvcParameterSet(info.video_sps.clone()),
                    picture_parameter_set: mp4::AvcParameterSet(info.video_pps.clone()),
                }),
            ),
        ),
        // Stts.
        mp4::Boxes::new(mp4::Stts {
            full_box: mp4::FullBox::default(),
            entries: state.stts.clone(),
        }),
        // Stss.
        mp4::Boxes::new(mp4::Stss {
            full_box: mp4::FullBox::default(),
            sample_numbers: state.stss.clone(),
        }),
        // Ctts.
        mp4::Boxes::new(mp4::Ctts {
            flags: [0, 0, 0],
            entries: state.ctts.clone(),
        }),
        // Stsc.
        mp4::Boxes::new(mp4::Stsc {
            full_box: mp4::FullBox::default(),
            entries: state.stsc.clone(),
        }),
        // Stsz.
        mp4::Boxes::new(mp4::Stsz {
            full_box: mp4::FullBox::default(),
            sample_size: 0,
            sample_count: u32::try_from(state.stsz.len())?,
            entry_sizes: state.stsz.clone(),
        }),
        // Stco.
        mp4::Boxes::new(mp4::Stco {
            full_box: mp4::FullBox::default(),
            chunk_offsets: state.stco.clone(),
        }),
    ]);

    Ok(stbl)
}

fn generate_audio_stbl(
    info: &StreamInfo,
    state: &TrackState,
) -> Result<mp4::Boxes, FinalizeMp4Error> {
    /*
       stbl
       - stsd
         - mp4a
           - esds
       - stts
       - stsc
       - stsz
       - stco
    */

    let stbl = mp4::Boxes::new(mp4::Stbl).with_children([
        // Stsd.
        mp4::Boxes::new(mp4::Stsd {
            full_box: mp4::FullBox::default(),
            entry_count: 1,
        })
        .with_child(
            // Mp4a.
            mp4::Boxes::new(mp4::Mp4a {
                sample_entry: mp4::SampleEntry {
                    data_reference_index: 1,
                    ..Default::default()
                },
                channel_count: info.audio_channel_count,
                sample_size: 16,
                sample_rate: info.audio_clock_rate << 16,
                ..Default::default()
            })
            .with_child(
                // Esds.
                mp4::Boxes::new(mp4::Esds {
                    full_box: mp4::FullBox::default(),
                    es_id: u16::try_from(AUDIO_TRACK_ID)?,
                    object_type_indication: 0x40,
                    stream_type: 0x15,
                    buffer_size_db: 0,
                    max_bitrate: ESDS_BITRATE,
                    avg_bitrate: ESDS_BITRATE,
                    dec_specific_info: info.audio_track_config.clone(),
                }),
            ),
        ),
        // Stts.
        mp4::Boxes::new(mp4::Stts {
            full_box: mp4::FullBox::default(),
            entries: state.stts.clone(),
        }),
        // Stsc.
        mp4::Boxes::new(mp4::Stsc {
            full_box: mp4::FullBox::default(),
            entries: state.stsc.clone(),
        }),
        // Stsz.
        mp4::Boxes::new(mp4::Stsz {
            full_box: mp4::FullBox::default(),
            sample_size: 0,
            sample_count: u32::try_from(state.stsz.len())?,
            entry_sizes: state.stsz.clone(),
        }),
        // Stco.
        mp4::Boxes::new(mp4::Stco {
            full_box: mp4::FullBox::default(),
            chunk_offsets: state.stco.clone(),
        }),
    ]);

    Ok(stbl)
}

// Composes a minimal mp4 holding a single video frame in memory.
// Used for thumbnail generation.
pub fn single_frame_mp4(
    info: &StreamInfo,
    sample: &VideoSample,
) -> Result<Vec<u8>, FinalizeMp4Error> {
    use FinalizeMp4Error::*;

    let mut state = TrackState::default();
    state.begin_chunk(0, 1);
    state.push_delta(sample.duration().as_u32().unwrap_or(0));
    state.push_cts(0);
    state
        .stsz
        .push(u32::try_from(sample.avcc.len())?);
    state.stss.push(1);

    let duration = Duration::new(sample.duration().as_nanos());

    // The size of the moov box does not depend on the chunk offset,
    // so generate it once to learn the offset and then again with
    // the offset in place.
    let moov_size = generate_moov(info, duration, &state, None)?.size();
    let mdat_offset = FTYP_SIZE
        .checked_add(u32::try_from(moov_size)?)
        .and_then(|v| v.checked_add(MDAT_HEADER_SIZE))
        .ok_or(Add)?;
    state.stco[0] = mdat_offset;
    let moov = generate_moov(info, duration, &state, None)?;

    let mut buf = Vec::with_capacity(usize::try_from(mdat_offset)? + sample.avcc.len());
    mp4::write_single_box(&mut buf, &ftyp())?;
    moov.marshal(&mut buf)?;
    mp4::write_single_box(&mut buf, &mp4::Mdat(sample.avcc.to_vec()))?;
    Ok(buf)
}
