// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Upload of finished footage to remote storage.

use base::{bail, err, Error};
use std::path::Path;
use std::time::Duration;
use tracing::info;
use url::Url;

const TIMEOUT: Duration = Duration::from_secs(300);

/// Stores a finished recording remotely. A trait for test injection.
pub trait Uploader: Send + Sync {
    fn upload(&self, local_path: &Path, remote_key: &str) -> Result<(), Error>;
}

/// Returns the remote key for an event's footage, e.g.
/// `events/20240301T120000Z-0190d1b2-....y4m`.
pub fn remote_key(when: jiff::Timestamp, event_id: uuid::Uuid) -> String {
    format!("events/{}-{event_id}.y4m", when.strftime("%Y%m%dT%H%M%SZ"))
}

/// `PUT`s files beneath a base URL over HTTPS, optionally with a bearer token.
///
/// The body is sent as-is: confidentiality in transit comes from TLS alone, and there's no
/// client-side encryption (such as a KMS-wrapped data key) before the upload. A bucket that
/// must hold only ciphertext needs server-side encryption or a proxy that adds it.
pub struct HttpUploader {
    client: reqwest::blocking::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpUploader {
    /// Creates an uploader. Must not be called from within an async runtime.
    pub fn new(mut base_url: Url, bearer_token: Option<String>) -> Result<Self, Error> {
        if base_url.cannot_be_a_base() {
            bail!(InvalidArgument, msg("upload URL {base_url} can't be a base"));
        }
        if !base_url.path().ends_with('/') {
            let p = format!("{}/", base_url.path());
            base_url.set_path(&p);
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(TIMEOUT)
            .user_agent(concat!("weaponwatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| err!(Internal, msg("unable to build HTTP client"), source(e)))?;
        Ok(HttpUploader {
            client,
            base_url,
            bearer_token,
        })
    }

    fn url_for(&self, remote_key: &str) -> Result<Url, Error> {
        self.base_url
            .join(remote_key)
            .map_err(|e| err!(InvalidArgument, msg("bad remote key {remote_key:?}"), source(e)))
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, local_path: &Path, remote_key: &str) -> Result<(), Error> {
        let url = self.url_for(remote_key)?;
        let f = std::fs::File::open(local_path)
            .map_err(|e| err!(e, msg("unable to open {}", local_path.display())))?;
        let len = f.metadata()?.len();
        let mut req = self
            .client
            .put(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "video/x-yuv4mpeg")
            .body(reqwest::blocking::Body::sized(f, len));
        if let Some(t) = &self.bearer_token {
            req = req.bearer_auth(t);
        }
        let resp = req
            .send()
            .map_err(|e| err!(Unavailable, msg("unable to upload to {url}"), source(e)))?;
        let status = resp.status();
        if !status.is_success() {
            bail!(Unavailable, msg("upload to {url} returned {status}"));
        }
        info!(%url, bytes = len, "uploaded footage");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use base::Mutex;
    use std::path::PathBuf;

    /// Records uploads (checking that the file exists); optionally fails them.
    #[derive(Default)]
    pub struct MockUploader {
        pub uploads: Mutex<Vec<(PathBuf, String, u64)>>,
        pub fail: bool,
    }

    impl Uploader for MockUploader {
        fn upload(&self, local_path: &Path, remote_key: &str) -> Result<(), Error> {
            let len = std::fs::metadata(local_path)?.len();
            self.uploads
                .lock()
                .push((local_path.to_owned(), remote_key.to_owned(), len));
            if self.fail {
                bail!(Unavailable, msg("mock upload failure"));
            }
            Ok(())
        }
    }
}
