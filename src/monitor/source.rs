// SPDX-License-Identifier: GPL-2.0-or-later

use crate::log_monitor;
use common::{
    ArcHlsMuxer, ArcLogger, ArcMsgLogger, ArcVideoServer, Cancelled, ConfigEnv, LogLevel,
    MsgLogger, PathConf, ServerPath, StreamInfo, StreamType,
    monitor::{ArcMonitorHooks, MonitorConfig},
};
use std::{path::Path, process::Stdio, sync::Arc};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::Command,
    sync::{mpsc, watch},
    time::sleep,
};
use tokio_util::sync::CancellationToken;

const CRASH_BACKOFF: std::time::Duration = std::time::Duration::from_secs(1);
const STREAM_INFO_POLL: std::time::Duration = std::time::Duration::from_secs(3);

// Grace window between a stop request and a forced kill.
const PROCESS_STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(10);

// Keeps the external ingest process alive and through it the HLS
// muxer path populated, until cancelled.
pub struct InputProcess {
    stream_type: StreamType,
    server_path_rx: watch::Receiver<Option<ServerPath>>,
}

#[derive(Debug, Error)]
#[error("muxer unavailable")]
pub struct HlsMuxerUnavailableError;

impl InputProcess {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        token: CancellationToken,
        shutdown_complete: mpsc::Sender<()>,
        logger: ArcLogger,
        video_server: ArcVideoServer,
        hooks: ArcMonitorHooks,
        config: MonitorConfig,
        stream_type: StreamType,
        env: ConfigEnv,
    ) -> Arc<Self> {
        let msg_logger: ArcMsgLogger = Arc::new(InputLogger {
            logger,
            config: config.clone(),
            stream_type,
        });

        let (server_path_tx, server_path_rx) = watch::channel(None);

        let supervisor = InputSupervisor {
            logger: msg_logger,
            video_server,
            hooks,
            config,
            stream_type,
            env,
        };

        tokio::spawn(async move {
            let _shutdown_complete = shutdown_complete;
            loop {
                match supervisor.run(&token, &server_path_tx).await {
                    Ok(()) => {
                        supervisor.logger.log(LogLevel::Info, "stopped");
                        return;
                    }
                    Err(e) => supervisor.logger.log(LogLevel::Error, &format!("crashed: {e}")),
                }
                server_path_tx.send_replace(None);

                tokio::select! {
                    () = token.cancelled() => {
                        supervisor.logger.log(LogLevel::Info, "stopped");
                        return;
                    }
                    () = sleep(CRASH_BACKOFF) => {}
                }
            }
        });

        Arc::new(Self {
            stream_type,
            server_path_rx,
        })
    }

    #[must_use]
    pub fn is_sub_input(&self) -> bool {
        self.stream_type.is_sub()
    }

    // Snapshot of the attached server path.
    pub fn server_path(&self) -> Result<ServerPath, HlsMuxerUnavailableError> {
        self.server_path_rx
            .borrow()
            .clone()
            .ok_or(HlsMuxerUnavailableError)
    }

    // Current muxer handle, if the path is attached.
    pub fn muxer(&self) -> Result<ArcHlsMuxer, HlsMuxerUnavailableError> {
        Ok(self.server_path()?.hls_muxer)
    }

    // Stream info of the muxer. Polls until the muxer has determined
    // the info or the token is cancelled.
    pub async fn stream_info(&self, token: &CancellationToken) -> Result<StreamInfo, Cancelled> {
        loop {
            if let Ok(muxer) = self.muxer() {
                if let Some(info) = muxer.stream_info() {
                    return Ok(info);
                }
            }
            tokio::select! {
                () = token.cancelled() => return Err(Cancelled),
                () = sleep(STREAM_INFO_POLL) => {}
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn test_new(stream_type: StreamType, server_path: ServerPath) -> Arc<Self> {
        let (_tx, server_path_rx) = watch::channel(Some(server_path));
        Arc::new(Self {
            stream_type,
            server_path_rx,
        })
    }
}

struct InputSupervisor {
    logger: ArcMsgLogger,
    video_server: ArcVideoServer,
    hooks: ArcMonitorHooks,
    config: MonitorConfig,
    stream_type: StreamType,
    env: ConfigEnv,
}

#[derive(Debug, Error)]
enum RunInputError {
    #[error("empty path name")]
    EmptyPathName,

    #[error("new path: {0}")]
    NewPath(common::DynError),

    #[error("run process: {0}")]
    RunProcess(#[from] RunProcessError),

    #[error("process exited: {0}")]
    Exited(std::process::ExitStatus),
}

impl InputSupervisor {
    // One attach-and-ingest attempt. Returns Ok only when cancelled.
    async fn run(
        &self,
        token: &CancellationToken,
        server_path_tx: &watch::Sender<Option<ServerPath>>,
    ) -> Result<(), RunInputError> {
        use RunInputError::*;

        let path_name = self.rtsp_path_name()?;
        let server_path = self
            .video_server
            .new_path(
                token.clone(),
                &path_name,
                PathConf {
                    monitor_id: self.config.id().to_owned(),
                    is_sub: self.stream_type.is_sub(),
                },
            )
            .await
            .map_err(NewPath)?;

        let mut args = generate_args(&self.config, &server_path, self.stream_type);
        self.hooks
            .on_input_start(&self.config, self.stream_type, &mut args);

        server_path_tx.send_replace(Some(server_path));

        self.logger.log(
            LogLevel::Info,
            &format!(
                "starting: {} {}",
                self.env.ffmpeg_bin.to_string_lossy(),
                args.join(" ")
            ),
        );

        let exit = run_process(
            token,
            &self.logger,
            ffmpeg_log_level(self.config.log_level()),
            &self.env.ffmpeg_bin,
            &args,
            None,
        )
        .await?;

        match exit {
            ProcessExit::Cancelled => Ok(()),
            ProcessExit::Exited(status) => Err(Exited(status)),
        }
    }

    fn rtsp_path_name(&self) -> Result<String, RunInputError> {
        let id = self.config.id();
        if id.is_empty() {
            return Err(RunInputError::EmptyPathName);
        }
        if self.stream_type.is_sub() {
            Ok(id.to_owned() + "_sub")
        } else {
            Ok(id.to_owned())
        }
    }
}

// Argument list for the external RTSP ingest process.
pub(crate) fn generate_args(
    config: &MonitorConfig,
    server_path: &ServerPath,
    stream_type: StreamType,
) -> Vec<String> {
    let mut args = vec![
        "-threads".to_owned(),
        "1".to_owned(),
        "-loglevel".to_owned(),
        config.log_level().to_owned(),
    ];

    if !config.hwaccel().is_empty() {
        args.push("-hwaccel".to_owned());
        args.push(config.hwaccel().to_owned());
    }

    if !config.input_opts().is_empty() {
        args.extend(config.input_opts().split(' ').map(str::to_owned));
    }

    let input = if stream_type.is_sub() {
        config.sub_input()
    } else {
        config.main_input()
    };
    args.push("-i".to_owned());
    args.push(input.to_owned());

    if config.audio_enabled() {
        args.push("-c:a".to_owned());
        args.push(config.audio_encoder().to_owned());
    } else {
        args.push("-an".to_owned());
    }

    args.push("-c:v".to_owned());
    args.push(config.video_encoder().to_owned());
    args.push("-f".to_owned());
    args.push("rtsp".to_owned());
    args.push("-rtsp_transport".to_owned());
    args.push(server_path.rtsp_protocol.clone());
    args.push(server_path.rtsp_address.clone());
    args
}

// Maps a ffmpeg log level to the level its output is logged at.
pub(crate) fn ffmpeg_log_level(level: &str) -> LogLevel {
    match level {
        "quiet" | "panic" | "fatal" | "error" => LogLevel::Error,
        "warning" => LogLevel::Warning,
        "verbose" | "debug" | "trace" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

struct InputLogger {
    logger: ArcLogger,
    config: MonitorConfig,
    stream_type: StreamType,
}

impl MsgLogger for InputLogger {
    fn log(&self, level: LogLevel, msg: &str) {
        let msg = format!("{} process: {}", self.stream_type.name(), msg);
        log_monitor(
            &self.logger,
            level,
            self.config.id(),
            &self.config.censor_log(&msg),
        );
    }
}

pub(crate) enum ProcessExit {
    Cancelled,
    Exited(std::process::ExitStatus),
}

#[derive(Debug, Error)]
pub(crate) enum RunProcessError {
    #[error("spawn: {0}")]
    Spawn(std::io::Error),

    #[error("wait: {0}")]
    Wait(std::io::Error),
}

// Runs an external process until it exits or the token is cancelled.
// Stdout and stderr are line-routed to the logger at `output_level`.
// On cancellation the process is asked to quit and killed if it
// hasn't exited within the grace window.
pub(crate) async fn run_process(
    token: &CancellationToken,
    logger: &ArcMsgLogger,
    output_level: LogLevel,
    program: &Path,
    args: &[String],
    stdin_data: Option<Vec<u8>>,
) -> Result<ProcessExit, RunProcessError> {
    use RunProcessError::*;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(Spawn)?;

    let mut stdin = child.stdin.take();

    if let Some(stdout) = child.stdout.take() {
        let logger = logger.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logger.log(output_level, &line);
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let logger = logger.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                logger.log(output_level, &line);
            }
        });
    }

    if let Some(data) = stdin_data {
        if let Some(mut stdin) = stdin.take() {
            // The process may exit without reading everything.
            _ = stdin.write_all(&data).await;
            _ = stdin.flush().await;
        }
    }

    tokio::select! {
        status = child.wait() => {
            return Ok(ProcessExit::Exited(status.map_err(Wait)?));
        }
        () = token.cancelled() => {}
    }

    // Request a graceful quit by closing stdin.
    if let Some(mut stdin) = stdin.take() {
        _ = stdin.write_all(b"q").await;
        _ = stdin.flush().await;
    }

    tokio::select! {
        _ = child.wait() => {}
        () = sleep(PROCESS_STOP_GRACE) => {
            _ = child.kill().await;
        }
    }
    Ok(ProcessExit::Cancelled)
}
