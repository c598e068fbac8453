// SPDX-License-Identifier: GPL-2.0-or-later

#![allow(clippy::module_name_repetitions)]

use crate::{DynError, Event, StreamType, ValueMissingError, recording::RecordingData};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::BTreeMap, collections::HashMap, path::Path, sync::Arc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

// Raw monitor configuration. Opaque string map, unknown keys are
// preserved when a config is loaded and written back to disk.
pub type RawConfig = BTreeMap<String, String>;

pub type MonitorConfigs = HashMap<String, MonitorConfig>;

// Immutable wrapper around a `RawConfig` with typed accessors.
// Updates happen only by atomic replacement in the manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MonitorConfig(RawConfig);

impl MonitorConfig {
    #[must_use]
    pub fn new(raw: RawConfig) -> Self {
        Self(raw)
    }

    #[must_use]
    pub fn raw(&self) -> &RawConfig {
        &self.0
    }

    #[must_use]
    pub fn raw_mut(&mut self) -> &mut RawConfig {
        &mut self.0
    }

    fn get(&self, key: &str) -> &str {
        self.0.get(key).map_or("", String::as_str)
    }

    // Monitor ID.
    #[must_use]
    pub fn id(&self) -> &str {
        self.get("id")
    }

    // Monitor name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.get("name")
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.get("enable") == "true"
    }

    #[must_use]
    pub fn input_opts(&self) -> &str {
        self.get("inputOptions")
    }

    #[must_use]
    pub fn audio_encoder(&self) -> &str {
        self.get("audioEncoder")
    }

    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        !matches!(self.audio_encoder(), "" | "none")
    }

    #[must_use]
    pub fn video_encoder(&self) -> &str {
        self.get("videoEncoder")
    }

    // Main input URL. May contain credentials.
    #[must_use]
    pub fn main_input(&self) -> &str {
        self.get("mainInput")
    }

    // Sub input URL. May contain credentials.
    #[must_use]
    pub fn sub_input(&self) -> &str {
        self.get("subInput")
    }

    #[must_use]
    pub fn sub_input_enabled(&self) -> bool {
        !self.sub_input().is_empty()
    }

    // Maximum length of a single recording in minutes. Parsed at use.
    #[must_use]
    pub fn video_length(&self) -> &str {
        self.get("videoLength")
    }

    #[must_use]
    pub fn always_record(&self) -> bool {
        self.get("alwaysRecord") == "true"
    }

    // Camera timestamp offset in milliseconds. Parsed at use.
    #[must_use]
    pub fn timestamp_offset(&self) -> &str {
        self.get("timestampOffset")
    }

    // The ffmpeg log level.
    #[must_use]
    pub fn log_level(&self) -> &str {
        self.get("logLevel")
    }

    #[must_use]
    pub fn hwaccel(&self) -> &str {
        self.get("hwaccel")
    }

    // Replaces the input URLs with placeholders. The URLs may contain
    // credentials that must not end up in the log.
    #[must_use]
    pub fn censor_log(&self, msg: &str) -> String {
        let mut msg = msg.to_owned();
        if !self.main_input().is_empty() {
            msg = msg.replace(self.main_input(), "$MainInput");
        }
        if !self.sub_input().is_empty() {
            msg = msg.replace(self.sub_input(), "$SubInput");
        }
        msg
    }
}

impl Serialize for MonitorConfig {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MonitorConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Self(RawConfig::deserialize(deserializer)?))
    }
}

// Common information about a monitor without any secrets.
// This is accessible by normal users.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct MonitorInfo {
    pub id: String,
    pub name: String,
    pub enable: String,

    #[serde(rename = "audioEnabled")]
    pub audio_enabled: String,

    #[serde(rename = "subInputEnabled")]
    pub sub_input_enabled: String,
}

impl MonitorInfo {
    #[must_use]
    pub fn new(config: &MonitorConfig) -> Self {
        fn bool_str(v: bool) -> String {
            if v { "true".to_owned() } else { "false".to_owned() }
        }
        Self {
            id: config.id().to_owned(),
            name: config.name().to_owned(),
            enable: bool_str(config.enabled()),
            audio_enabled: bool_str(config.audio_enabled()),
            sub_input_enabled: bool_str(config.sub_input_enabled()),
        }
    }
}

pub type ArcMonitor = Arc<dyn MonitorImpl + Send + Sync>;

#[async_trait]
pub trait MonitorImpl {
    // Snapshot of the current config.
    fn config(&self) -> MonitorConfig;

    // Validates the event and forwards it to the recorder.
    // Blocks until the recorder has accepted the event.
    async fn send_event(&self, event: Event) -> Result<(), SendEventError>;

    async fn stop(&self);
}

#[derive(Debug, Error)]
pub enum SendEventError {
    #[error("invalid event: {0}")]
    Validate(#[from] ValueMissingError),

    #[error("cancelled")]
    Cancelled,
}

pub type ArcMonitorHooks = Arc<dyn MonitorHooks + Send + Sync>;

#[async_trait]
pub trait MonitorHooks {
    async fn on_monitor_start(&self, token: CancellationToken, monitor: ArcMonitor);

    // May mutate the ingest process argument list.
    fn on_input_start(&self, config: &MonitorConfig, stream_type: StreamType, args: &mut Vec<String>);

    // Must not block.
    fn on_event(&self, config: &MonitorConfig, event: &Event);

    // May mutate the thumbnail process argument list.
    fn on_rec_save(&self, config: &MonitorConfig, args: &mut Vec<String>);

    fn on_rec_saved(&self, config: &MonitorConfig, file_path: &Path, data: &RecordingData);

    // Migrates raw configs before they're admitted to the manager.
    fn migrate_monitor(&self, raw: &mut RawConfig) -> Result<(), DynError>;
}

pub struct DummyMonitorHooks;

impl DummyMonitorHooks {
    #[allow(clippy::new_ret_no_self)]
    #[must_use]
    pub fn new() -> ArcMonitorHooks {
        Arc::new(Self {})
    }
}

#[async_trait]
impl MonitorHooks for DummyMonitorHooks {
    async fn on_monitor_start(&self, _: CancellationToken, _: ArcMonitor) {}
    fn on_input_start(&self, _: &MonitorConfig, _: StreamType, _: &mut Vec<String>) {}
    fn on_event(&self, _: &MonitorConfig, _: &Event) {}
    fn on_rec_save(&self, _: &MonitorConfig, _: &mut Vec<String>) {}
    fn on_rec_saved(&self, _: &MonitorConfig, _: &Path, _: &RecordingData) {}
    fn migrate_monitor(&self, _: &mut RawConfig) -> Result<(), DynError> {
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum MonitorRestartError {
    #[error("monitor does not exist '{0}'")]
    NotExist(String),
}

#[derive(Debug, Error)]
pub enum MonitorSetError {
    #[error("serialize config: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("write config to file: {0}")]
    WriteFile(std::io::Error),
}

#[derive(Debug, Error)]
pub enum MonitorDeleteError {
    #[error("monitor does not exist '{0}'")]
    NotExist(String),

    #[error("remove file: {0}")]
    RemoveFile(#[from] std::io::Error),
}
