// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Push notifications to the verifiers' phones, via the Expo push service.

use base::{bail, err, Error};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_ENDPOINT: &str = "https://exp.host/--/api/v2/push/send";
const TIMEOUT: Duration = Duration::from_secs(10);

/// The text and presentation of one kind of alert.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct Alert {
    pub title: String,
    pub body: String,
    #[serde(default = "default_channel_id")]
    pub channel_id: String,
    #[serde(default = "default_sound")]
    pub sound: String,
}

fn default_channel_id() -> String {
    "weapon_detected".to_owned()
}

fn default_sound() -> String {
    "emergencysos.wav".to_owned()
}

impl Alert {
    fn new(title: &str, body: &str) -> Self {
        Alert {
            title: title.to_owned(),
            body: body.to_owned(),
            channel_id: default_channel_id(),
            sound: default_sound(),
        }
    }

    /// Sent to the primary verifiers when an event is first detected.
    pub fn detected() -> Self {
        Self::new(
            "Weapon Detected!",
            "A potential weapon has been detected. Please check immediately.",
        )
    }

    /// Sent to the secondary verifiers when the primaries haven't confirmed in time.
    pub fn secondary_verification() -> Self {
        Self::new(
            "SECONDARY VERIFICATION REQUIRED",
            "Primary verifier did not respond",
        )
    }

    /// Sent to the primary verifiers alongside [`Alert::secondary_verification`].
    pub fn verification_timeout() -> Self {
        Self::new(
            "VERIFICATION TIMEOUT",
            "Threat control passed to secondary verifier",
        )
    }

    pub fn to_message(&self, token: &str) -> PushMessage {
        PushMessage {
            to: token.to_owned(),
            title: self.title.clone(),
            body: self.body.clone(),
            channel_id: self.channel_id.clone(),
            sound: self.sound.clone(),
            priority: "high",
        }
    }
}

/// One notification to one device, in the Expo wire format.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    pub to: String,
    pub title: String,
    pub body: String,
    pub channel_id: String,
    pub sound: String,
    pub priority: &'static str,
}

/// Delivers push notifications. A trait for test injection.
pub trait Pusher: Send + Sync {
    /// Sends one message, returning an error if it wasn't accepted for delivery.
    fn send(&self, msg: &PushMessage) -> Result<(), Error>;
}

/// Sends `alert` to each of `tokens`, returning the number of failures.
///
/// Failures are logged and otherwise ignored: a missed notification must never
/// take down the worker that sent it.
pub fn send_all(pusher: &dyn Pusher, alert: &Alert, tokens: &[String]) -> usize {
    let mut failures = 0;
    for token in tokens {
        match pusher.send(&alert.to_message(token)) {
            Ok(()) => tracing::info!(title = %alert.title, "push notification sent"),
            Err(e) => {
                failures += 1;
                tracing::warn!(
                    err = %e.chain(),
                    title = %alert.title,
                    "unable to send push notification",
                );
            }
        }
    }
    failures
}

#[derive(Debug, Deserialize)]
struct Response {
    #[serde(default)]
    data: Option<Ticket>,
    #[serde(default)]
    errors: Vec<TicketError>,
}

#[derive(Debug, Deserialize)]
struct Ticket {
    status: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TicketError {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// Posts messages to the Expo push API.
pub struct ExpoPusher {
    client: reqwest::blocking::Client,
    endpoint: Url,
    access_token: Option<String>,
}

impl ExpoPusher {
    /// Creates a pusher. Must not be called from within an async runtime.
    pub fn new(endpoint: Url, access_token: Option<String>) -> Result<Self, Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(TIMEOUT)
            .user_agent(concat!("weaponwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| err!(Internal, msg("unable to build HTTP client"), source(e)))?;
        Ok(ExpoPusher {
            client,
            endpoint,
            access_token,
        })
    }
}

fn interpret(status: reqwest::StatusCode, resp: Response) -> Result<Option<String>, Error> {
    if let Some(e) = resp.errors.first() {
        bail!(
            Unavailable,
            msg(
                "push service returned {status}: {} ({})",
                e.message,
                e.code.as_deref().unwrap_or("no code")
            )
        );
    }
    if !status.is_success() {
        bail!(Unavailable, msg("push service returned {status}"));
    }
    match resp.data {
        Some(t) if t.status == "ok" => Ok(t.id),
        Some(t) => bail!(
            Unavailable,
            msg(
                "push ticket status {:?}: {}",
                t.status,
                t.message.as_deref().unwrap_or("no message")
            )
        ),
        None => bail!(Unavailable, msg("push service returned no ticket")),
    }
}

impl Pusher for ExpoPusher {
    fn send(&self, msg: &PushMessage) -> Result<(), Error> {
        let mut req = self
            .client
            .post(self.endpoint.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .json(msg);
        if let Some(t) = &self.access_token {
            req = req.bearer_auth(t);
        }
        let resp = req
            .send()
            .map_err(|e| err!(Unavailable, msg("unable to reach push service"), source(e)))?;
        let status = resp.status();
        let body: Response = resp
            .json()
            .map_err(|e| err!(Unavailable, msg("bad push service response ({status})"), source(e)))?;
        let id = interpret(status, body)?;
        debug!(ticket = ?id, "push accepted");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use base::Mutex;

    /// Records every message; fails while `fail` is set.
    #[derive(Default)]
    pub struct MockPusher {
        pub sent: Mutex<Vec<PushMessage>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    impl MockPusher {
        pub fn failing() -> Self {
            let p = Self::default();
            p.fail.store(true, std::sync::atomic::Ordering::SeqCst);
            p
        }

        pub fn titles(&self) -> Vec<String> {
            self.sent.lock().iter().map(|m| m.title.clone()).collect()
        }
    }

    impl Pusher for MockPusher {
        fn send(&self, msg: &PushMessage) -> Result<(), Error> {
            self.sent.lock().push(msg.clone());
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                bail!(Unavailable, msg("mock push failure"));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::MockPusher;
    use super::*;

    #[test]
    fn wire_format() {
        let m = Alert::detected().to_message("ExponentPushToken[abc]");
        assert_eq!(
            serde_json::to_value(&m).unwrap(),
            serde_json::json!({
                "to": "ExponentPushToken[abc]",
                "title": "Weapon Detected!",
                "body": "A potential weapon has been detected. Please check immediately.",
                "channelId": "weapon_detected",
                "sound": "emergencysos.wav",
                "priority": "high",
            })
        );
    }

    #[test]
    fn interpret_responses() {
        let ok: Response =
            serde_json::from_str(r#"{"data": {"status": "ok", "id": "XXXX"}}"#).unwrap();
        assert_eq!(
            interpret(reqwest::StatusCode::OK, ok).unwrap(),
            Some("XXXX".to_owned())
        );

        let ticket_err: Response = serde_json::from_str(
            r#"{"data": {"status": "error", "message": "not registered",
                "details": {"error": "DeviceNotRegistered"}}}"#,
        )
        .unwrap();
        let e = interpret(reqwest::StatusCode::OK, ticket_err).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Unavailable);
        assert!(e.to_string().contains("not registered"), "{e}");

        let req_err: Response = serde_json::from_str(
            r#"{"errors": [{"code": "VALIDATION_ERROR", "message": "bad token"}]}"#,
        )
        .unwrap();
        let e = interpret(reqwest::StatusCode::BAD_REQUEST, req_err).unwrap_err();
        assert!(e.to_string().contains("bad token"), "{e}");
    }

    #[test]
    fn send_all_counts_failures() {
        let tokens = vec!["a".to_owned(), "b".to_owned()];
        let p = MockPusher::default();
        assert_eq!(send_all(&p, &Alert::detected(), &tokens), 0);
        assert_eq!(p.sent.lock().len(), 2);

        let p = MockPusher::failing();
        assert_eq!(send_all(&p, &Alert::detected(), &tokens), 2);
    }
}
