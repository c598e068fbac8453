// SPDX-License-Identifier: GPL-2.0-or-later

use crate::{
    log_monitor,
    source::{
        HlsMuxerUnavailableError, InputProcess, ProcessExit, RunProcessError, ffmpeg_log_level,
        run_process,
    },
};
use common::{
    ArcHlsMuxer, ArcLogger, ArcMsgLogger, Cancelled, ConfigEnv, DIR_MODE, DynError, Event,
    FILE_MODE, LogLevel, MsgLogger, RecFormat, Segment, StreamInfo, VideoSample, create_dir_all,
    monitor::{ArcMonitorHooks, MonitorConfig},
    recording::{RecordingData, RecordingId, RecordingIdError},
    serialize_indented,
    time::{Duration, UnixNano},
};
use recording::{
    FinalizeMp4Error, MetaHeader, Mp4Writer, NewMp4WriterError, NewVideoWriterError, VideoWriter,
    single_frame_mp4,
};
use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    task::Poll,
};
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::{AsyncWrite, AsyncWriteExt, BufWriter},
    sync::{Mutex, mpsc},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

const RESTART_SLEEP: std::time::Duration = std::time::Duration::from_secs(3);
const THUMBNAIL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

type BoxedRecordingFuture = Pin<Box<dyn Future<Output = Result<(), DynError>> + Send>>;
type RunRecordingFn =
    Arc<dyn Fn(CancellationToken, RecordingContext) -> BoxedRecordingFuture + Send + Sync>;

#[allow(clippy::too_many_arguments)]
pub(crate) fn new_recorder(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    hooks: ArcMonitorHooks,
    logger: ArcLogger,
    config: MonitorConfig,
    input_main: Arc<InputProcess>,
    env: ConfigEnv,
) -> mpsc::Sender<Event> {
    let runner: RunRecordingFn = Arc::new(|token, ctx| {
        Box::pin(async move { run_recording(token, ctx).await.map_err(Into::into) })
    });
    new_recorder_with_runner(
        token,
        shutdown_complete,
        hooks,
        logger,
        config,
        input_main,
        env,
        runner,
        RESTART_SLEEP,
    )
}

#[allow(clippy::too_many_arguments)]
fn new_recorder_with_runner(
    token: CancellationToken,
    shutdown_complete: mpsc::Sender<()>,
    hooks: ArcMonitorHooks,
    logger: ArcLogger,
    config: MonitorConfig,
    input_main: Arc<InputProcess>,
    env: ConfigEnv,
    run_recording: RunRecordingFn,
    restart_sleep: std::time::Duration,
) -> mpsc::Sender<Event> {
    let (send_event_tx, mut send_event_rx) = mpsc::channel::<Event>(1);
    let c = RecordingContext {
        hooks,
        logger: Arc::new(RecorderLogger {
            logger,
            config: config.clone(),
        }),
        input_main,
        config,
        env,
        prev_seg: Arc::new(Mutex::new(0)),
        events: Arc::new(std::sync::Mutex::new(Events::default())),
    };

    // Recorder actor.
    tokio::spawn(async move {
        let shutdown_complete = shutdown_complete;

        let mut session: Option<RecordingSession> = None;
        if c.config.always_record() {
            c.log(LogLevel::Debug, "alwaysRecord=true");
            session = Some(RecordingSession::new(
                &token,
                None,
                c.clone(),
                shutdown_complete.clone(),
                run_recording.clone(),
                restart_sleep,
            ));
        }

        loop {
            // Is recording.
            if let Some(active) = &mut session {
                tokio::select! {
                    () = token.cancelled() => {
                        // Wait for the session to exit.
                        _ = active.on_exit_rx.recv().await;
                        return;
                    }

                    event = send_event_rx.recv() => { // Incoming events.
                        let Some(event) = event else {
                            return
                        };
                        c.hooks.on_event(&c.config, &event);

                        let Some(end) = event.time.checked_add(event.rec_duration) else {
                            continue
                        };
                        c.events.lock().expect("not poisoned").push(event);

                        // Deadlines may only move forward.
                        if let Some(timer_end) = active.timer_end {
                            if end.after(timer_end) {
                                c.log(LogLevel::Debug, "new event, already recording, updating timer");
                                active.timer_end = Some(end);
                            }
                        }
                    }

                    // This will never complete if the monitor is set to always record.
                    () = active.sleep_until_timer_end() => {
                        c.log(LogLevel::Debug, "timer reached end, canceling session");
                        active.token.cancel();

                        _ = active.on_exit_rx.recv().await;
                        c.log(LogLevel::Debug, "session stopped");
                        session = None;
                    }

                    _ = active.on_exit_rx.recv() => {
                        c.log(LogLevel::Debug, "session stopped");
                        session = None;
                    }
                }
            } else {
                tokio::select! {
                    () = token.cancelled() => return,
                    event = send_event_rx.recv() => { // Incoming events.
                        let Some(event) = event else {
                            return
                        };
                        c.hooks.on_event(&c.config, &event);

                        let Some(end) = event.time.checked_add(event.rec_duration) else {
                            continue
                        };
                        c.events.lock().expect("not poisoned").push(event);

                        session = Some(RecordingSession::new(
                            &token,
                            Some(end),
                            c.clone(),
                            shutdown_complete.clone(),
                            run_recording.clone(),
                            restart_sleep,
                        ));
                    }
                }
            }
        }
    });

    send_event_tx
}

struct RecordingSession {
    token: CancellationToken,
    timer_end: Option<UnixNano>,
    on_exit_rx: mpsc::Receiver<()>,
}

impl RecordingSession {
    fn new(
        parent_token: &CancellationToken,
        timer_end: Option<UnixNano>,
        c: RecordingContext,
        shutdown_complete: mpsc::Sender<()>,
        run_recording: RunRecordingFn,
        restart_sleep: std::time::Duration,
    ) -> Self {
        c.log(LogLevel::Debug, "starting recording session");

        let token = parent_token.child_token();
        let (on_exit_tx, on_exit_rx) = mpsc::channel::<()>(1);

        let session_token = token.clone();
        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete;
            run_recording_session(session_token, c, run_recording, restart_sleep).await;
            _ = on_exit_tx.send(()).await;
        });

        RecordingSession {
            token,
            timer_end,
            on_exit_rx,
        }
    }

    fn sleep_until_timer_end(&self) -> Sleep {
        let Some(timer_end) = self.timer_end else {
            return Sleep(None);
        };
        let Some(until) = Duration::until(timer_end) else {
            return Sleep(None);
        };
        // An expired deadline fires immediately.
        let duration = until.as_std().unwrap_or(std::time::Duration::ZERO);
        Sleep(Some(Box::pin(tokio::time::sleep(duration))))
    }
}

// Future will always return pending if this is None.
struct Sleep(Option<Pin<Box<tokio::time::Sleep>>>);

impl Future for Sleep {
    type Output = ();

    fn poll(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Self::Output> {
        match &mut self.0 {
            Some(v) => Pin::new(v).poll(cx),
            None => Poll::Pending,
        }
    }
}

// One session may span multiple files. Crashes are recovered with a
// bounded backoff until the session is cancelled.
async fn run_recording_session(
    session_token: CancellationToken,
    c: RecordingContext,
    run_recording: RunRecordingFn,
    restart_sleep: std::time::Duration,
) {
    loop {
        match run_recording(session_token.clone(), c.clone()).await {
            Ok(()) => {
                c.log(LogLevel::Debug, "recording finished");
                if session_token.is_cancelled() {
                    return;
                }
            }
            Err(e) => {
                c.log(LogLevel::Error, &format!("recording crashed: {e}"));
                tokio::select! {
                    () = session_token.cancelled() => return,
                    () = sleep(restart_sleep) => {}
                }
                c.log(LogLevel::Debug, "recovering after crash");
            }
        }
    }
}

#[derive(Clone)]
struct RecordingContext {
    hooks: ArcMonitorHooks,
    logger: ArcMsgLogger,
    input_main: Arc<InputProcess>,
    config: MonitorConfig,
    env: ConfigEnv,

    // ID of the last segment written by this recorder.
    prev_seg: Arc<Mutex<u64>>,

    events: Arc<std::sync::Mutex<Events>>,
}

impl RecordingContext {
    fn log(&self, level: LogLevel, msg: &str) {
        self.logger.log(level, msg);
    }
}

// Insertion ordered event buffer.
#[derive(Default)]
struct Events(Vec<Event>);

impl Events {
    fn push(&mut self, event: Event) {
        self.0.push(event);
    }

    // Returns all events within the query window and drops events
    // before `start`. Recordings are anchored in time and share some
    // history, events older than the oldest active window are
    // unreachable.
    fn query_and_prune(&mut self, start: UnixNano, end: UnixNano) -> Vec<Event> {
        let mut new_events = Vec::new();
        let mut return_events = Vec::new();
        for event in self.0.drain(..) {
            if event.time.before(start) {
                continue;
            }
            if event.time.before(end) {
                return_events.push(event.clone());
            }
            new_events.push(event);
        }
        self.0 = new_events;
        return_events
    }
}

#[derive(Debug, Error)]
enum RunRecordingError {
    #[error("parse timestamp offset: {0}")]
    ParseOffset(std::num::ParseIntError),

    #[error("parse video length: {0}")]
    ParseVideoLength(std::num::ParseFloatError),

    #[error("{0}")]
    MuxerUnavailable(#[from] HlsMuxerUnavailableError),

    #[error("next segment: {0}")]
    NextSegment(DynError),

    #[error("recording id: {0}")]
    RecordingId(#[from] RecordingIdError),

    #[error("create directory: {0}")]
    CreateDir(std::io::Error),

    #[error("open file: {0}")]
    OpenFile(std::io::Error),

    #[error("new video writer: {0}")]
    NewVideoWriter(#[from] NewVideoWriterError),

    #[error("new mp4 writer: {0}")]
    NewMp4Writer(#[from] NewMp4WriterError),

    #[error("generate video: {0}")]
    GenerateVideo(#[from] GenerateVideoError),

    #[error("finalize mp4: {0}")]
    Finalize(#[from] FinalizeMp4Error),

    #[error("flush: {0}")]
    Flush(std::io::Error),

    #[error("run process: {0}")]
    RunProcess(#[from] RunProcessError),

    #[error("process exited: {0}")]
    ProcessExited(std::process::ExitStatus),

    #[error("add")]
    Add,

    #[error("subtract")]
    Sub,
}

// Records a single file and the matching thumbnail and sidecar.
async fn run_recording(
    token: CancellationToken,
    c: RecordingContext,
) -> Result<(), RunRecordingError> {
    use RunRecordingError::*;

    let offset = Duration::from_millis(
        c.config.timestamp_offset().parse().map_err(ParseOffset)?,
    );
    let video_length = Duration::from_minutes_f64(
        c.config.video_length().parse().map_err(ParseVideoLength)?,
    );

    if c.env.flags.rec_format == RecFormat::Ffmpeg {
        return run_recording_ffmpeg(token, c, offset, video_length).await;
    }

    let muxer = c.input_main.muxer()?;

    // Anchor of the new file.
    let first_segment = muxer
        .next_segment(*c.prev_seg.lock().await)
        .await
        .map_err(NextSegment)?;

    let start_time = first_segment.start_time.checked_sub(offset).ok_or(Sub)?;
    let file_path = new_recording_path(&c.env.recordings_dir, start_time, c.config.id())?;

    let info = match c.input_main.stream_info(&token).await {
        Ok(v) => v,
        Err(Cancelled) => return Ok(()),
    };

    c.log(
        LogLevel::Info,
        &format!("starting recording: {}", file_path.display()),
    );

    {
        let c = c.clone();
        let file_path = file_path.clone();
        let info = info.clone();
        let first_segment = first_segment.clone();
        tokio::spawn(async move {
            generate_thumbnail(&c, &file_path, &info, &first_segment).await;
        });
    }

    let (new_prev_seg, end_time) = match c.env.flags.rec_format {
        RecFormat::Raw => {
            generate_video_raw(&token, &muxer, &first_segment, &info, start_time, &file_path, video_length).await?
        }
        RecFormat::Mp4 => {
            generate_video_mp4(&token, &muxer, &first_segment, &info, start_time, &file_path, video_length).await?
        }
        RecFormat::Ffmpeg => unreachable!("handled above"),
    };
    *c.prev_seg.lock().await = new_prev_seg;

    c.log(
        LogLevel::Debug,
        &format!("video generated: {}", file_path.display()),
    );

    tokio::spawn(async move {
        save_recording(&c, &file_path, start_time, end_time).await;
    });

    Ok(())
}

// Records by having the external transcoder copy the HLS stream
// into a mp4 file directly.
async fn run_recording_ffmpeg(
    token: CancellationToken,
    c: RecordingContext,
    offset: Duration,
    video_length: Duration,
) -> Result<(), RunRecordingError> {
    use RunRecordingError::*;

    let server_path = c.input_main.server_path()?;

    // Wait until the HLS stream has segments to attach to.
    tokio::select! {
        () = token.cancelled() => return Ok(()),
        () = server_path.hls_muxer.wait_for_seg_finalized() => {}
    }

    let start_time = UnixNano::now().checked_sub(offset).ok_or(Sub)?;
    let file_path = new_recording_path(&c.env.recordings_dir, start_time, c.config.id())?;

    let args = generate_recorder_args(&c.config, video_length, &file_path, &server_path.hls_address);
    c.log(
        LogLevel::Info,
        &format!("starting recording: {}", file_path.display()),
    );

    let exit = run_process(
        &token,
        &c.logger,
        ffmpeg_log_level(c.config.log_level()),
        &c.env.ffmpeg_bin,
        &args,
        None,
    )
    .await?;
    if let ProcessExit::Exited(status) = exit {
        if !status.success() {
            return Err(ProcessExited(status));
        }
    }

    let end_time = start_time.checked_add(video_length).ok_or(Add)?;

    {
        let c = c.clone();
        let file_path = file_path.clone();
        tokio::spawn(async move {
            let video_path = file_path.with_extension("mp4");
            let args =
                generate_thumbnail_args(&c, &video_path.to_string_lossy(), &file_path);
            run_thumbnail_process(&c, args, None).await;
        });
    }

    tokio::spawn(async move {
        save_recording(&c, &file_path, start_time, end_time).await;
    });

    Ok(())
}

// Argument list for recording the HLS stream with the
// external transcoder.
fn generate_recorder_args(
    config: &MonitorConfig,
    video_length: Duration,
    file_path: &Path,
    hls_address: &str,
) -> Vec<String> {
    vec![
        "-y".to_owned(),
        "-threads".to_owned(),
        "1".to_owned(),
        "-loglevel".to_owned(),
        config.log_level().to_owned(),
        "-live_start_index".to_owned(),
        "-2".to_owned(),
        "-i".to_owned(),
        hls_address.to_owned(),
        "-t".to_owned(),
        video_length.as_secs().to_string(),
        "-c:v".to_owned(),
        "copy".to_owned(),
        file_path.with_extension("mp4").to_string_lossy().into_owned(),
    ]
}

// "<recordingsDir>/YYYY/MM/DD/<monitorID>/YYYY-MM-DD_HH-MM-SS_<monitorID>"
fn new_recording_path(
    recordings_dir: &Path,
    start_time: UnixNano,
    monitor_id: &str,
) -> Result<PathBuf, RunRecordingError> {
    let rec_id = RecordingId::new(start_time, monitor_id)?;
    let file_path = recordings_dir.join(rec_id.as_full_path());
    if let Some(dir) = file_path.parent() {
        create_dir_all(dir, DIR_MODE).map_err(RunRecordingError::CreateDir)?;
    }
    Ok(file_path)
}

async fn open_file(path: PathBuf) -> Result<File, std::io::Error> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(FILE_MODE)
        .open(path)
        .await
}

#[allow(clippy::too_many_arguments)]
async fn generate_video_raw(
    token: &CancellationToken,
    muxer: &ArcHlsMuxer,
    first_segment: &Segment,
    info: &StreamInfo,
    start_time: UnixNano,
    file_path: &Path,
    max_duration: Duration,
) -> Result<(u64, UnixNano), RunRecordingError> {
    use RunRecordingError::*;

    let meta = open_file(file_path.with_extension("meta")).await.map_err(OpenFile)?;
    let mdat = open_file(file_path.with_extension("mdat")).await.map_err(OpenFile)?;
    let mut meta = BufWriter::with_capacity(64 * 1024, meta);
    let mut mdat = BufWriter::with_capacity(64 * 1024, mdat);

    let header = MetaHeader::from_stream_info(start_time, info);

    let result = {
        let mut w = VideoWriter::new(&mut meta, &mut mdat, &header).await?;
        generate_video(token, &mut w, muxer, first_segment, max_duration).await?
    };

    meta.flush().await.map_err(Flush)?;
    mdat.flush().await.map_err(Flush)?;
    Ok(result)
}

#[allow(clippy::too_many_arguments)]
async fn generate_video_mp4(
    token: &CancellationToken,
    muxer: &ArcHlsMuxer,
    first_segment: &Segment,
    info: &StreamInfo,
    start_time: UnixNano,
    file_path: &Path,
    max_duration: Duration,
) -> Result<(u64, UnixNano), RunRecordingError> {
    use RunRecordingError::*;

    let file = open_file(file_path.with_extension("mp4")).await.map_err(OpenFile)?;
    let mut w = Mp4Writer::new(BufWriter::with_capacity(64 * 1024, file), info.clone(), start_time)
        .await?;

    let (prev_seg, end_time) =
        generate_video(token, &mut w, muxer, first_segment, max_duration).await?;

    w.finalize(end_time).await?;
    Ok((prev_seg, end_time))
}

#[async_trait::async_trait]
trait SegmentWriter {
    async fn write_segment(&mut self, seg: &Segment) -> Result<(), DynError>;
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send> SegmentWriter for VideoWriter<'_, W> {
    async fn write_segment(&mut self, seg: &Segment) -> Result<(), DynError> {
        Ok(VideoWriter::write_segment(self, seg).await?)
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + tokio::io::AsyncSeek + Unpin + Send> SegmentWriter for Mp4Writer<W> {
    async fn write_segment(&mut self, seg: &Segment) -> Result<(), DynError> {
        Ok(Mp4Writer::write_segment(self, seg).await?)
    }
}

#[derive(Debug, Error)]
enum GenerateVideoError {
    #[error("add")]
    Add,

    #[error("write segment: {0}")]
    WriteSegment(DynError),

    #[error("skipped segment: expected: {expected}, got: {got}")]
    SkippedSegment { expected: u64, got: u64 },
}

// Consumes segments in strictly monotonic ID order until the stop
// time is passed, the muxer gives up or the token is cancelled.
// Returns the ID of the last written segment and the end time.
async fn generate_video<W: SegmentWriter + Send>(
    token: &CancellationToken,
    w: &mut W,
    muxer: &ArcHlsMuxer,
    first_segment: &Segment,
    max_duration: Duration,
) -> Result<(u64, UnixNano), GenerateVideoError> {
    use GenerateVideoError::*;

    let stop_time = first_segment
        .start_time
        .checked_add(max_duration)
        .ok_or(Add)?;

    w.write_segment(first_segment).await.map_err(WriteSegment)?;

    let mut prev_seg = first_segment.id;
    let mut end_time = first_segment.end_time().ok_or(Add)?;

    loop {
        if token.is_cancelled() {
            return Ok((prev_seg, end_time));
        }

        let Ok(seg) = muxer.next_segment(prev_seg).await else {
            return Ok((prev_seg, end_time));
        };

        if seg.id != prev_seg + 1 {
            return Err(SkippedSegment {
                expected: prev_seg + 1,
                got: seg.id,
            });
        }

        w.write_segment(&seg).await.map_err(WriteSegment)?;
        prev_seg = seg.id;
        end_time = seg.end_time().ok_or(Add)?;

        if seg.start_time.after(stop_time) {
            return Ok((prev_seg, end_time));
        }
    }
}

#[derive(Debug, Error)]
enum GenerateThumbnailError {
    #[error("no sample with an IDR")]
    NoIdrSample,

    #[error("compose mp4: {0}")]
    ComposeMp4(#[from] FinalizeMp4Error),
}

// The first IDR frame in the segment is wrapped in a mp4 container
// and piped into the external transcoder to be converted to jpeg.
// Failure does not fail the recording.
async fn generate_thumbnail(
    c: &RecordingContext,
    file_path: &Path,
    info: &StreamInfo,
    first_segment: &Segment,
) {
    c.log(LogLevel::Debug, "generating thumbnail");

    let buf = match compose_thumbnail_mp4(info, first_segment) {
        Ok(v) => v,
        Err(e) => {
            c.log(
                LogLevel::Error,
                &format!("failed to generate thumbnail: {e}"),
            );
            return;
        }
    };

    let args = generate_thumbnail_args(c, "-", file_path);
    run_thumbnail_process(c, args, Some(buf)).await;
}

fn compose_thumbnail_mp4(
    info: &StreamInfo,
    first_segment: &Segment,
) -> Result<Vec<u8>, GenerateThumbnailError> {
    let sample = first_idr_sample(first_segment).ok_or(GenerateThumbnailError::NoIdrSample)?;
    Ok(single_frame_mp4(info, &sample)?)
}

fn first_idr_sample(segment: &Segment) -> Option<VideoSample> {
    segment
        .parts
        .iter()
        .flat_map(|part| &part.video_samples)
        .find(|sample| sample.idr_present)
        .cloned()
}

fn generate_thumbnail_args(c: &RecordingContext, input: &str, file_path: &Path) -> Vec<String> {
    let thumb_path = file_path.with_extension("jpeg");
    let mut args = vec![
        "-n".to_owned(),
        "-threads".to_owned(),
        "1".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-i".to_owned(),
        input.to_owned(),
        "-frames:v".to_owned(),
        "1".to_owned(),
        thumb_path.to_string_lossy().into_owned(),
    ];
    c.hooks.on_rec_save(&c.config, &mut args);
    args
}

async fn run_thumbnail_process(c: &RecordingContext, args: Vec<String>, stdin: Option<Vec<u8>>) {
    let token = CancellationToken::new();
    let result = tokio::time::timeout(
        THUMBNAIL_TIMEOUT,
        run_process(
            &token,
            &c.logger,
            LogLevel::Error,
            &c.env.ffmpeg_bin,
            &args,
            stdin,
        ),
    )
    .await;

    match result {
        Ok(Ok(ProcessExit::Exited(status))) if status.success() => {
            c.log(LogLevel::Debug, "thumbnail generated");
        }
        Ok(Ok(ProcessExit::Exited(status))) => {
            c.log(
                LogLevel::Error,
                &format!("failed to generate thumbnail: process exited: {status}"),
            );
        }
        Ok(Ok(ProcessExit::Cancelled)) => {}
        Ok(Err(e)) => {
            c.log(
                LogLevel::Error,
                &format!("failed to generate thumbnail: {e}"),
            );
        }
        Err(_) => {
            c.log(LogLevel::Error, "failed to generate thumbnail: timeout");
        }
    }
}

#[derive(Debug, Error)]
enum SaveRecordingError {
    #[error("serialize data: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("open file: {0}")]
    OpenFile(std::io::Error),

    #[error("write data file: {0}")]
    Write(std::io::Error),

    #[error("flush data file: {0}")]
    Flush(std::io::Error),
}

// Writes the events sidecar next to the video. I/O errors are
// logged, the video itself is the source of truth.
async fn save_recording(
    c: &RecordingContext,
    file_path: &Path,
    start_time: UnixNano,
    end_time: UnixNano,
) {
    if let Err(e) = try_save_recording(c, file_path, start_time, end_time).await {
        c.log(LogLevel::Error, &format!("failed to save recording: {e}"));
    }
}

async fn try_save_recording(
    c: &RecordingContext,
    file_path: &Path,
    start_time: UnixNano,
    end_time: UnixNano,
) -> Result<(), SaveRecordingError> {
    use SaveRecordingError::*;
    c.log(LogLevel::Debug, "saving recording");

    let events = c
        .events
        .lock()
        .expect("not poisoned")
        .query_and_prune(start_time, end_time);
    let data = RecordingData {
        start: start_time,
        end: end_time,
        events,
    };
    let json = serialize_indented(&data)?;

    let mut data_file = open_file(file_path.with_extension("json"))
        .await
        .map_err(OpenFile)?;
    data_file.write_all(&json).await.map_err(Write)?;
    data_file.flush().await.map_err(Flush)?;

    c.hooks.on_rec_saved(&c.config, file_path, &data);

    c.log(LogLevel::Info, "recording saved");
    Ok(())
}

struct RecorderLogger {
    logger: ArcLogger,
    config: MonitorConfig,
}

impl MsgLogger for RecorderLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        log_monitor(
            &self.logger,
            level,
            self.config.id(),
            &self.config.censor_log(&format!("recorder: {msg}")),
        );
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use common::{
        DummyLogger, MuxerPart, ServerPath, StreamType,
        monitor::{DummyMonitorHooks, RawConfig},
        time::{HOUR, MILLISECOND, MINUTE, NANOSECOND, SECOND, UnixH264},
    };
    use pretty_assertions::assert_eq;
    use std::time::Instant;
    use tempfile::tempdir;

    #[derive(Default)]
    struct MockMuxer {
        segments: Vec<Arc<Segment>>,
        info: StreamInfo,
    }

    #[async_trait::async_trait]
    impl common::HlsMuxer for MockMuxer {
        async fn next_segment(&self, prev_id: u64) -> Result<Arc<Segment>, DynError> {
            for seg in &self.segments {
                if seg.id > prev_id {
                    return Ok(seg.clone());
                }
            }
            Err("no more segments".into())
        }

        fn stream_info(&self) -> Option<StreamInfo> {
            Some(self.info.clone())
        }

        async fn wait_for_seg_finalized(&self) {}
    }

    fn mock_muxer(segments: Vec<Arc<Segment>>) -> ArcHlsMuxer {
        Arc::new(MockMuxer {
            segments,
            info: StreamInfo {
                video_sps: vec![0x67, 0, 0, 0],
                video_pps: vec![0x68],
                video_width: 64,
                video_height: 64,
                ..Default::default()
            },
        })
    }

    fn test_input(muxer: ArcHlsMuxer) -> Arc<InputProcess> {
        InputProcess::test_new(
            StreamType::Main,
            ServerPath {
                hls_address: "hls.m3u8".to_owned(),
                rtsp_address: "addr".to_owned(),
                rtsp_protocol: "tcp".to_owned(),
                hls_muxer: muxer,
            },
        )
    }

    fn test_config() -> MonitorConfig {
        MonitorConfig::new(RawConfig::from([
            ("id".to_owned(), "test".to_owned()),
            ("timestampOffset".to_owned(), "0".to_owned()),
            ("videoLength".to_owned(), "0.0003".to_owned()),
        ]))
    }

    fn test_env(dir: &Path) -> ConfigEnv {
        ConfigEnv {
            config_dir: dir.join("configs"),
            recordings_dir: dir.join("recordings"),
            temp_dir: dir.join("temp"),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            flags: common::Flags::default(),
        }
    }

    fn test_context(dir: &Path) -> RecordingContext {
        let config = test_config();
        RecordingContext {
            hooks: DummyMonitorHooks::new(),
            logger: Arc::new(RecorderLogger {
                logger: DummyLogger::new(),
                config: config.clone(),
            }),
            input_main: test_input(mock_muxer(Vec::new())),
            config,
            env: test_env(dir),
            prev_seg: Arc::new(Mutex::new(0)),
            events: Arc::new(std::sync::Mutex::new(Events::default())),
        }
    }

    struct TestRecorder {
        token: CancellationToken,
        event_tx: mpsc::Sender<Event>,
        _shutdown_complete: mpsc::Receiver<()>,
    }

    fn start_recorder(runner: RunRecordingFn, restart_sleep: std::time::Duration) -> TestRecorder {
        let token = CancellationToken::new();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let tempdir = tempdir().unwrap();

        let event_tx = new_recorder_with_runner(
            token.clone(),
            shutdown_tx,
            DummyMonitorHooks::new(),
            DummyLogger::new(),
            test_config(),
            test_input(mock_muxer(Vec::new())),
            test_env(tempdir.path()),
            runner,
            restart_sleep,
        );

        TestRecorder {
            token,
            event_tx,
            _shutdown_complete: shutdown_rx,
        }
    }

    fn event(time: UnixNano, rec_duration: i64) -> Event {
        Event {
            time,
            rec_duration: Duration::new(rec_duration),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_recorder_timeout() {
        let (on_run_tx, mut on_run_rx) = mpsc::channel(1);
        let (on_cancel_tx, mut on_cancel_rx) = mpsc::channel(1);
        let runner: RunRecordingFn = Arc::new(move |token, _| {
            let on_run_tx = on_run_tx.clone();
            let on_cancel_tx = on_cancel_tx.clone();
            Box::pin(async move {
                _ = on_run_tx.send(()).await;
                token.cancelled().await;
                _ = on_cancel_tx.send(()).await;
                Ok(())
            })
        });

        let recorder = start_recorder(runner, std::time::Duration::from_secs(3600));

        // An event with an expired deadline starts a session that is
        // cancelled immediately.
        let time = UnixNano::now().checked_sub(Duration::new(HOUR)).unwrap();
        recorder
            .event_tx
            .send(event(time, NANOSECOND))
            .await
            .unwrap();

        on_run_rx.recv().await.unwrap();
        on_cancel_rx.recv().await.unwrap();
        recorder.token.cancel();
    }

    #[tokio::test]
    async fn test_recorder_overlapping_events() {
        let (on_run_tx, mut on_run_rx) = mpsc::channel(1);
        let (on_cancel_tx, mut on_cancel_rx) = mpsc::channel(1);
        let runner: RunRecordingFn = Arc::new(move |token, _| {
            let on_run_tx = on_run_tx.clone();
            let on_cancel_tx = on_cancel_tx.clone();
            Box::pin(async move {
                _ = on_run_tx.send(()).await;
                token.cancelled().await;
                _ = on_cancel_tx.send(()).await;
                Ok(())
            })
        });

        let recorder = start_recorder(runner, std::time::Duration::from_secs(3600));

        let start = Instant::now();
        let now = UnixNano::now();
        recorder
            .event_tx
            .send(event(now, 20 * MILLISECOND))
            .await
            .unwrap();
        recorder
            .event_tx
            .send(event(now, 60 * MILLISECOND))
            .await
            .unwrap();

        // Only a single session is started and it runs until the
        // longest deadline.
        on_run_rx.recv().await.unwrap();
        on_cancel_rx.recv().await.unwrap();
        assert!(start.elapsed() >= std::time::Duration::from_millis(55));
        assert!(on_run_rx.try_recv().is_err());

        recorder.token.cancel();
    }

    #[tokio::test]
    async fn test_recorder_monotonic_deadline() {
        let (on_cancel_tx, mut on_cancel_rx) = mpsc::channel(1);
        let runner: RunRecordingFn = Arc::new(move |token, _| {
            let on_cancel_tx = on_cancel_tx.clone();
            Box::pin(async move {
                token.cancelled().await;
                _ = on_cancel_tx.send(()).await;
                Ok(())
            })
        });

        let recorder = start_recorder(runner, std::time::Duration::from_secs(3600));

        let now = UnixNano::now();
        recorder
            .event_tx
            .send(event(now, 30 * MILLISECOND))
            .await
            .unwrap();
        recorder
            .event_tx
            .send(event(now, MILLISECOND))
            .await
            .unwrap();

        // The second trigger must not shorten the deadline.
        tokio::select! {
            () = sleep(std::time::Duration::from_millis(15)) => {}
            _ = on_cancel_rx.recv() => panic!("the second trigger reset the timeout"),
        }

        recorder.token.cancel();
    }

    #[tokio::test]
    async fn test_recorder_crash_and_restart() {
        let (on_run_tx, mut on_run_rx) = mpsc::channel(1);
        let runner: RunRecordingFn = Arc::new(move |_, _| {
            let on_run_tx = on_run_tx.clone();
            Box::pin(async move {
                _ = on_run_tx.send(()).await;
                Err("mock".into())
            })
        });

        let recorder = start_recorder(runner, std::time::Duration::from_millis(1));

        let now = UnixNano::now();
        recorder
            .event_tx
            .send(event(now, HOUR))
            .await
            .unwrap();

        on_run_rx.recv().await.unwrap();
        on_run_rx.recv().await.unwrap();
        on_run_rx.recv().await.unwrap();
        recorder.token.cancel();
    }

    #[tokio::test]
    async fn test_recorder_normal_exit() {
        let (on_run_tx, mut on_run_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = mpsc::channel::<Result<(), ()>>(1);
        let exit_rx = Arc::new(Mutex::new(exit_rx));
        let runner: RunRecordingFn = Arc::new(move |_, _| {
            let on_run_tx = on_run_tx.clone();
            let exit_rx = exit_rx.clone();
            Box::pin(async move {
                _ = on_run_tx.send(()).await;
                _ = exit_rx.lock().await.recv().await;
                Ok(())
            })
        });

        let recorder = start_recorder(runner, std::time::Duration::from_millis(1));

        let now = UnixNano::now();
        recorder.event_tx.send(event(now, HOUR)).await.unwrap();

        // The session loop starts the next file after a normal exit.
        on_run_rx.recv().await.unwrap();
        exit_tx.send(Ok(())).await.unwrap();
        on_run_rx.recv().await.unwrap();
        exit_tx.send(Ok(())).await.unwrap();
        on_run_rx.recv().await.unwrap();
        recorder.token.cancel();
    }

    #[tokio::test]
    async fn test_generate_video_skipped_segment() {
        fn seg(id: u64, start_secs: i64) -> Arc<Segment> {
            Arc::new(Segment {
                id,
                start_time: UnixNano::new(start_secs * SECOND),
                rendered_duration: Duration::from_secs(1),
                parts: Vec::new(),
            })
        }

        let muxer = mock_muxer(vec![seg(5, 0), seg(7, 2)]);
        let first_segment = muxer.next_segment(0).await.unwrap();
        assert_eq!(5, first_segment.id);

        let mut meta = Vec::new();
        let mut mdat = Vec::new();
        let header = MetaHeader::from_stream_info(UnixNano::new(0), &StreamInfo::default());
        let mut w = VideoWriter::new(&mut meta, &mut mdat, &header).await.unwrap();

        let token = CancellationToken::new();
        let err = generate_video(
            &token,
            &mut w,
            &muxer,
            &first_segment,
            Duration::from_secs(3600),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            GenerateVideoError::SkippedSegment { expected: 6, got: 7 }
        ));
    }

    #[tokio::test]
    async fn test_generate_video_stop_time() {
        fn seg(id: u64, start_secs: i64) -> Arc<Segment> {
            Arc::new(Segment {
                id,
                start_time: UnixNano::new(start_secs * SECOND),
                rendered_duration: Duration::from_secs(1),
                parts: Vec::new(),
            })
        }

        let muxer = mock_muxer(vec![seg(1, 0), seg(2, 1), seg(3, 2)]);
        let first_segment = muxer.next_segment(0).await.unwrap();

        let mut meta = Vec::new();
        let mut mdat = Vec::new();
        let header = MetaHeader::from_stream_info(UnixNano::new(0), &StreamInfo::default());
        let mut w = VideoWriter::new(&mut meta, &mut mdat, &header).await.unwrap();

        let token = CancellationToken::new();
        let (last_id, end_time) = generate_video(
            &token,
            &mut w,
            &muxer,
            &first_segment,
            Duration::from_millis(500),
        )
        .await
        .unwrap();

        // Segment 2 starts after the stop time and is the last one.
        assert_eq!(2, last_id);
        assert_eq!(UnixNano::new(2 * SECOND), end_time);
    }

    #[test]
    fn test_generate_recorder_args() {
        let config = MonitorConfig::new(RawConfig::from([
            ("id".to_owned(), "id".to_owned()),
            ("logLevel".to_owned(), "1".to_owned()),
        ]));
        let args = generate_recorder_args(
            &config,
            Duration::from_minutes_f64(3.0),
            Path::new("path"),
            "hls.m3u8",
        );
        assert_eq!(
            "-y -threads 1 -loglevel 1 -live_start_index -2 -i hls.m3u8 -t 180 -c:v copy path.mp4",
            args.join(" "),
        );
    }

    #[test]
    fn test_query_and_prune() {
        fn e(time: i64) -> Event {
            event(UnixNano::new(time), 1)
        }

        let mut events = Events::default();
        events.push(e(1));
        events.push(e(2));
        events.push(e(3));
        events.push(e(4));

        // Events before the window are dropped, events after it are
        // kept for the next query.
        let got = events.query_and_prune(UnixNano::new(2), UnixNano::new(4));
        assert_eq!(vec![e(2), e(3)], got);
        assert_eq!(vec![e(2), e(3), e(4)], events.0);

        let got = events.query_and_prune(UnixNano::new(4), UnixNano::new(5));
        assert_eq!(vec![e(4)], got);
        assert_eq!(vec![e(4)], events.0);
    }

    #[tokio::test]
    async fn test_save_recording() {
        let tempdir = tempdir().unwrap();
        let c = test_context(tempdir.path());

        let file_path = tempdir.path().join("recording");
        try_save_recording(
            &c,
            &file_path,
            UnixNano::new(MINUTE),
            UnixNano::new(11 * MINUTE),
        )
        .await
        .unwrap();

        let got = std::fs::read_to_string(file_path.with_extension("json")).unwrap();
        let want = "{
    \"start\": \"1970-01-01T00:01:00Z\",
    \"end\": \"1970-01-01T00:11:00Z\",
    \"events\": []
}";
        assert_eq!(want, got);
    }

    #[tokio::test]
    async fn test_generate_video_raw_files() {
        let tempdir = tempdir().unwrap();
        let file_path = tempdir.path().join("recording");

        let segment = Arc::new(Segment {
            id: 1,
            start_time: UnixNano::new(0),
            rendered_duration: Duration::from_secs(1),
            parts: vec![Arc::new(MuxerPart {
                video_samples: vec![VideoSample {
                    pts: UnixH264::new(100),
                    dts: UnixH264::new(100),
                    next_dts: UnixH264::new(190),
                    avcc: bytes::Bytes::from_static(&[1, 2, 3]),
                    idr_present: true,
                }],
                audio_samples: Vec::new(),
            })],
        });
        let muxer = mock_muxer(vec![segment.clone()]);

        let token = CancellationToken::new();
        let (last_id, _) = generate_video_raw(
            &token,
            &muxer,
            &segment,
            &StreamInfo::default(),
            UnixNano::new(0),
            &file_path,
            Duration::from_secs(3600),
        )
        .await
        .unwrap();
        assert_eq!(1, last_id);

        let mdat = std::fs::read(file_path.with_extension("mdat")).unwrap();
        assert_eq!(vec![1, 2, 3], mdat);

        let meta = std::fs::metadata(file_path.with_extension("meta")).unwrap();
        assert!(meta.len() > 0);
    }
}
