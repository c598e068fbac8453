// SPDX-License-Identifier: GPL-2.0-or-later

use common::{
    Segment, StreamInfo,
    time::UnixNano,
};
use std::io::SeekFrom;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt, AsyncWrite, AsyncWriteExt};

// Sample flags.
const FLAG_RANDOM_ACCESS_PRESENT: u8 = 0b1000_0000;
const FLAG_AUDIO_SAMPLE: u8 = 0b0100_0000;

const SAMPLE_SIZE_U8: u8 = 25;
#[allow(clippy::as_conversions)]
pub const SAMPLE_SIZE: usize = SAMPLE_SIZE_U8 as usize;

// A single index record in the meta file. Video timestamps use the
// 90khz timescale, audio timestamps use the stream clock rate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Sample {
    pub random_access_present: bool,
    pub is_audio: bool,

    pub pts: i64,
    pub dts_offset: i32,
    pub duration: u32,
    pub data_offset: u32,
    pub data_size: u32,
}

impl Sample {
    #[must_use]
    pub fn from_bytes(b: &[u8; SAMPLE_SIZE]) -> Self {
        let flags = b[0];
        Self {
            random_access_present: flags & FLAG_RANDOM_ACCESS_PRESENT != 0,
            is_audio: flags & FLAG_AUDIO_SAMPLE != 0,
            pts: i64::from_be_bytes([b[1], b[2], b[3], b[4], b[5], b[6], b[7], b[8]]),
            dts_offset: i32::from_be_bytes([b[9], b[10], b[11], b[12]]),
            duration: u32::from_be_bytes([b[13], b[14], b[15], b[16]]),
            data_offset: u32::from_be_bytes([b[17], b[18], b[19], b[20]]),
            data_size: u32::from_be_bytes([b[21], b[22], b[23], b[24]]),
        }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut flags: u8 = 0;
        if self.random_access_present {
            flags |= FLAG_RANDOM_ACCESS_PRESENT;
        }
        if self.is_audio {
            flags |= FLAG_AUDIO_SAMPLE;
        }

        let mut out = Vec::with_capacity(SAMPLE_SIZE);
        out.push(flags);
        out.extend_from_slice(&self.pts.to_be_bytes());
        out.extend_from_slice(&self.dts_offset.to_be_bytes());
        out.extend_from_slice(&self.duration.to_be_bytes());
        out.extend_from_slice(&self.data_offset.to_be_bytes());
        out.extend_from_slice(&self.data_size.to_be_bytes());
        out
    }

    #[must_use]
    pub fn dts(&self) -> i64 {
        self.pts - i64::from(self.dts_offset)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioConfig {
    pub config: Vec<u8>,
    pub clock_rate: u32,
    pub channel_count: u16,
}

// Recording meta file header.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetaHeader {
    pub start_time: UnixNano,
    pub width: u16,
    pub height: u16,
    pub profile_idc: u8,
    pub level_idc: u8,
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
    pub audio: Option<AudioConfig>,
}

#[derive(Debug, Error)]
pub enum HeaderFromReaderError {
    #[error("unsupported version")]
    UnsupportedVersion,

    #[error("read: {0}")]
    Read(#[from] std::io::Error),
}

const META_API_VERSION: u8 = 1;

impl MetaHeader {
    #[must_use]
    pub fn from_stream_info(start_time: UnixNano, info: &StreamInfo) -> Self {
        Self {
            start_time,
            width: info.video_width,
            height: info.video_height,
            profile_idc: info.video_profile_idc,
            level_idc: info.video_level_idc,
            sps: info.video_sps.clone(),
            pps: info.video_pps.clone(),
            audio: info.audio_track_exist.then(|| AudioConfig {
                config: info.audio_track_config.clone(),
                clock_rate: info.audio_clock_rate,
                channel_count: info.audio_channel_count,
            }),
        }
    }

    #[must_use]
    pub fn stream_info(&self) -> StreamInfo {
        let audio = self.audio.clone().unwrap_or_default();
        StreamInfo {
            video_sps: self.sps.clone(),
            video_pps: self.pps.clone(),
            video_profile_idc: self.profile_idc,
            video_level_idc: self.level_idc,
            video_width: self.width,
            video_height: self.height,
            audio_track_exist: self.audio.is_some(),
            audio_track_config: audio.config,
            audio_clock_rate: audio.clock_rate,
            audio_channel_count: audio.channel_count,
        }
    }

    // Marshaled size.
    #[must_use]
    pub fn size(&self) -> usize {
        let mut total = 20 + self.sps.len() + self.pps.len();
        if let Some(audio) = &self.audio {
            total += 8 + audio.config.len();
        }
        total
    }

    pub fn marshal(&self) -> Result<Vec<u8>, std::num::TryFromIntError> {
        let mut out = Vec::with_capacity(self.size());

        out.push(META_API_VERSION);
        out.extend_from_slice(&self.start_time.to_be_bytes());
        out.extend_from_slice(&self.width.to_be_bytes());
        out.extend_from_slice(&self.height.to_be_bytes());
        out.push(self.profile_idc);
        out.push(self.level_idc);

        out.extend_from_slice(&u16::try_from(self.sps.len())?.to_be_bytes());
        out.extend_from_slice(&self.sps);
        out.extend_from_slice(&u16::try_from(self.pps.len())?.to_be_bytes());
        out.extend_from_slice(&self.pps);

        if let Some(audio) = &self.audio {
            out.push(1);
            out.extend_from_slice(&audio.clock_rate.to_be_bytes());
            out.extend_from_slice(&audio.channel_count.to_be_bytes());
            out.extend_from_slice(&u16::try_from(audio.config.len())?.to_be_bytes());
            out.extend_from_slice(&audio.config);
        } else {
            out.push(0);
        }

        Ok(out)
    }

    pub async fn from_reader<R: AsyncRead + Unpin>(
        r: &mut R,
    ) -> Result<Self, HeaderFromReaderError> {
        async fn read_u16<R: AsyncRead + Unpin>(r: &mut R) -> Result<u16, std::io::Error> {
            let mut buf = [0; 2];
            r.read_exact(&mut buf).await?;
            Ok(u16::from_be_bytes(buf))
        }
        async fn read_buf<R: AsyncRead + Unpin>(r: &mut R) -> Result<Vec<u8>, std::io::Error> {
            let size = read_u16(r).await?;
            let mut buf = vec![0; size.into()];
            r.read_exact(&mut buf).await?;
            Ok(buf)
        }

        let mut api_version = [0];
        r.read_exact(&mut api_version).await?;
        if api_version[0] != META_API_VERSION {
            return Err(HeaderFromReaderError::UnsupportedVersion);
        }

        let mut start_time = [0; 8];
        r.read_exact(&mut start_time).await?;
        let start_time = UnixNano::new(i64::from_be_bytes(start_time));

        let width = read_u16(r).await?;
        let height = read_u16(r).await?;

        let mut profile_and_level = [0; 2];
        r.read_exact(&mut profile_and_level).await?;

        let sps = read_buf(r).await?;
        let pps = read_buf(r).await?;

        let mut audio_flag = [0];
        r.read_exact(&mut audio_flag).await?;
        let audio = if audio_flag[0] == 0 {
            None
        } else {
            let mut clock_rate = [0; 4];
            r.read_exact(&mut clock_rate).await?;
            let channel_count = read_u16(r).await?;
            let config = read_buf(r).await?;
            Some(AudioConfig {
                config,
                clock_rate: u32::from_be_bytes(clock_rate),
                channel_count,
            })
        };

        Ok(MetaHeader {
            start_time,
            width,
            height,
            profile_idc: profile_and_level[0],
            level_idc: profile_and_level[1],
            sps,
            pps,
            audio,
        })
    }
}

#[derive(Debug, Error)]
pub enum NewVideoWriterError {
    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("write: {0}")]
    Write(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum WriteSampleError {
    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),

    #[error("write: {0}")]
    Write(std::io::Error),

    #[error("flush: {0}")]
    Flush(std::io::Error),
}

// Writes recordings in the raw format. The mdat file is the
// concatenation of the sample data and the meta file is the
// header followed by one index record for each sample.
#[allow(clippy::module_name_repetitions)]
pub struct VideoWriter<'a, W: AsyncWrite + Unpin> {
    meta: &'a mut W,
    mdat: &'a mut W,

    mdat_pos: u32,
}

impl<'a, W: AsyncWrite + Unpin> VideoWriter<'a, W> {
    // Creates a new writer and writes the header.
    pub async fn new(
        meta: &'a mut W,
        mdat: &'a mut W,
        header: &MetaHeader,
    ) -> Result<VideoWriter<'a, W>, NewVideoWriterError> {
        meta.write_all(&header.marshal()?).await?;
        Ok(Self {
            meta,
            mdat,
            mdat_pos: 0,
        })
    }

    // Writes all samples in a segment to the output files.
    // Each part is written video first and then audio.
    pub async fn write_segment(&mut self, seg: &Segment) -> Result<(), WriteSampleError> {
        use WriteSampleError::*;

        for part in &seg.parts {
            for sample in &part.video_samples {
                let s = Sample {
                    random_access_present: sample.idr_present,
                    is_audio: false,
                    pts: *sample.pts,
                    dts_offset: *sample.dts_offset(),
                    duration: sample.duration().as_u32()?,
                    data_offset: self.mdat_pos,
                    data_size: u32::try_from(sample.avcc.len())?,
                };
                self.write_sample(&s, &sample.avcc).await?;
            }
            for sample in &part.audio_samples {
                let s = Sample {
                    random_access_present: false,
                    is_audio: true,
                    pts: sample.pts,
                    dts_offset: 0,
                    duration: u32::try_from(sample.duration())?,
                    data_offset: self.mdat_pos,
                    data_size: u32::try_from(sample.au.len())?,
                };
                self.write_sample(&s, &sample.au).await?;
            }
        }
        self.mdat.flush().await.map_err(Flush)?;
        self.meta.flush().await.map_err(Flush)?;
        Ok(())
    }

    async fn write_sample(&mut self, sample: &Sample, data: &[u8]) -> Result<(), WriteSampleError> {
        use WriteSampleError::*;
        self.mdat.write_all(data).await.map_err(Write)?;
        self.mdat_pos += sample.data_size;
        self.meta.write_all(&sample.encode()).await.map_err(Write)?;
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum NewMetaReaderError {
    #[error("unmarshal header: {0}")]
    UnmarshalHeader(#[from] HeaderFromReaderError),

    #[error("{0}")]
    TryFromInt(#[from] std::num::TryFromIntError),
}

#[derive(Debug, Error)]
pub enum ReadAllSamplesError {
    #[error("seek: {0}")]
    Seek(std::io::Error),

    #[error("read: {0}")]
    Read(std::io::Error),
}

// Reads a single meta file.
pub struct MetaReader<T: AsyncRead + AsyncSeek + Unpin> {
    file: T,

    header_size: u64,
    sample_count: usize,
}

impl<T: AsyncRead + AsyncSeek + Unpin> MetaReader<T> {
    pub async fn new(mut file: T, file_size: u64) -> Result<(Self, MetaHeader), NewMetaReaderError> {
        let header = MetaHeader::from_reader(&mut file).await?;
        let header_size = u64::try_from(header.size())?;

        Ok((
            Self {
                file,
                header_size,
                sample_count: usize::try_from(
                    (file_size - header_size) / u64::from(SAMPLE_SIZE_U8),
                )?,
            },
            header,
        ))
    }

    // Reads and returns all samples in the file.
    pub async fn read_all_samples(&mut self) -> Result<Vec<Sample>, ReadAllSamplesError> {
        use ReadAllSamplesError::*;

        // Seek to the end of the header.
        self.file
            .seek(SeekFrom::Start(self.header_size))
            .await
            .map_err(Seek)?;

        let mut buf = [0; SAMPLE_SIZE];
        let mut samples = vec![Sample::default(); self.sample_count];
        for sample in &mut samples {
            self.file.read_exact(&mut buf).await.map_err(Read)?;
            *sample = Sample::from_bytes(&buf);
        }

        Ok(samples)
    }
}
