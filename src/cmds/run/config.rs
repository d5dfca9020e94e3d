// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Runtime configuration file (`/etc/weaponwatch.toml`).

use crate::nms::NmsConfig;
use crate::push::Alert;
use serde::Deserialize;
use std::path::PathBuf;
use url::Url;

fn default_state_dir() -> PathBuf {
    crate::DEFAULT_STATE_DIR.into()
}

fn default_class_names() -> Vec<String> {
    ["Gun", "Knife", "Rifle"].map(String::from).to_vec()
}

fn default_fps() -> u32 {
    10
}

fn default_push_endpoint() -> Url {
    Url::parse(crate::push::DEFAULT_ENDPOINT).expect("default endpoint is a valid URL")
}

/// Top-level configuration file object.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    /// Directory holding the event status file.
    ///
    /// default: `/var/lib/weaponwatch`.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// The video source, e.g. `file:///run/weaponwatch/camera.y4m`.
    pub source: Url,

    #[serde(default)]
    pub detector: DetectorConfig,

    #[serde(default)]
    pub nms: NmsConfig,

    /// Display names of the model's classes, indexed by class id.
    ///
    /// Detections of classes beyond the end of this list are discarded.
    #[serde(default = "default_class_names")]
    pub class_names: Vec<String>,

    pub recording: RecordingConfig,

    #[serde(default)]
    pub push: PushConfig,

    /// Uploads finished recordings if present.
    #[serde(default)]
    pub upload: Option<UploadConfig>,

    #[serde(default)]
    pub confirmation: ConfirmationConfig,
}

#[derive(Debug, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum DetectorConfig {
    /// Never detects; events come only from the operator's keys.
    #[default]
    None,

    /// Replays per-frame candidates from a JSON-lines file.
    Replay { path: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct RecordingConfig {
    /// Directory in which footage is written while recording.
    pub dir: PathBuf,

    /// Where finished footage is handed off.
    ///
    /// default: `ACTIVE_EVENT.y4m` within `dir`.
    #[serde(default)]
    pub handoff_path: Option<PathBuf>,

    /// Frame rate written to the footage header.
    #[serde(default = "default_fps")]
    pub fps: u32,

    /// Finishes recordings automatically after this many seconds.
    ///
    /// Otherwise only the operator's `f` command finishes a recording. With `--no-operator`
    /// and no limit, a recording runs until end of stream or a signal stops the pipeline, and
    /// that discards the footage without handing it off.
    #[serde(default)]
    pub max_duration_sec: Option<u64>,
}

impl RecordingConfig {
    pub fn footage_path(&self) -> PathBuf {
        self.dir.join("footage.y4m")
    }

    pub fn handoff_path(&self) -> PathBuf {
        self.handoff_path
            .clone()
            .unwrap_or_else(|| self.dir.join("ACTIVE_EVENT.y4m"))
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    #[serde(default = "default_push_endpoint")]
    pub endpoint: Url,

    /// Optional Expo access token for enhanced push security.
    #[serde(default)]
    pub access_token: Option<String>,

    /// Device tokens of the primary verifiers.
    #[serde(default)]
    pub tokens: Vec<String>,

    /// Overrides the detection alert's text.
    #[serde(default)]
    pub alert: Option<Alert>,
}

impl Default for PushConfig {
    fn default() -> Self {
        PushConfig {
            endpoint: default_push_endpoint(),
            access_token: None,
            tokens: Vec::new(),
            alert: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct UploadConfig {
    /// Recordings are `PUT` beneath this URL.
    pub base_url: Url,

    #[serde(default)]
    pub bearer_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationConfig {
    /// Detections scoring at least this confirm the event without a verifier.
    #[serde(default)]
    pub auto_confirm_score: Option<f32>,

    /// Escalates events left unconfirmed this long to the secondary verifiers.
    #[serde(default)]
    pub escalate_after_sec: Option<u64>,

    #[serde(default)]
    pub secondary_tokens: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal() {
        let c: ConfigFile = toml::from_str(
            r#"
            source = "file:///run/weaponwatch/camera.y4m"

            [recording]
            dir = "/var/lib/weaponwatch/recordings"
            "#,
        )
        .unwrap();
        assert_eq!(c.state_dir, PathBuf::from(crate::DEFAULT_STATE_DIR));
        assert_eq!(c.detector, DetectorConfig::None);
        assert_eq!(c.nms, NmsConfig::default());
        assert_eq!(c.class_names, ["Gun", "Knife", "Rifle"]);
        assert_eq!(c.recording.fps, 10);
        assert_eq!(
            c.recording.handoff_path(),
            PathBuf::from("/var/lib/weaponwatch/recordings/ACTIVE_EVENT.y4m")
        );
        assert_eq!(c.push.endpoint.as_str(), crate::push::DEFAULT_ENDPOINT);
        assert!(c.upload.is_none());
        assert!(c.confirmation.auto_confirm_score.is_none());
    }

    #[test]
    fn full() {
        let c: ConfigFile = toml::from_str(
            r#"
            stateDir = "/tmp/ww"
            source = "file:///tmp/in.y4m"
            classNames = ["Gun", "Knife"]

            [detector]
            type = "replay"
            path = "/tmp/detections.jsonl"

            [nms]
            iouThreshold = 0.4
            scoreThreshold = 0.6

            [recording]
            dir = "/tmp/rec"
            handoffPath = "/srv/share/ACTIVE_EVENT.y4m"
            fps = 15
            maxDurationSec = 30

            [push]
            tokens = ["ExponentPushToken[aaa]"]

            [push.alert]
            title = "Gun!"
            body = "Check the camera."

            [upload]
            baseUrl = "https://storage.example/bucket/"

            [confirmation]
            autoConfirmScore = 0.95
            escalateAfterSec = 20
            secondaryTokens = ["ExponentPushToken[bbb]"]
            "#,
        )
        .unwrap();
        assert_eq!(
            c.detector,
            DetectorConfig::Replay {
                path: "/tmp/detections.jsonl".into()
            }
        );
        assert_eq!(c.nms.iou_threshold, 0.4);
        assert_eq!(c.nms.max_total_size, 50);
        assert_eq!(c.recording.max_duration_sec, Some(30));
        assert_eq!(
            c.recording.handoff_path(),
            PathBuf::from("/srv/share/ACTIVE_EVENT.y4m")
        );
        let alert = c.push.alert.unwrap();
        assert_eq!(alert.title, "Gun!");
        assert_eq!(alert.sound, "emergencysos.wav");
        assert_eq!(c.confirmation.escalate_after_sec, Some(20));
    }

    #[test]
    fn unknown_field_rejected() {
        toml::from_str::<ConfigFile>(
            r#"
            source = "file:///tmp/in.y4m"
            bogus = 1
            [recording]
            dir = "/tmp/rec"
            "#,
        )
        .unwrap_err();
    }
}
