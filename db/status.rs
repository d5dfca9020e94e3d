// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The shared event status record.
//!
//! This is the single source of truth for "is there an active event". The
//! notifier sets `detected`, the confirmer sets `confirmed`, the orchestrator
//! polls `confirmed` to decide when to record, and the recorder closes the
//! event. Some of those may be in other processes (`weaponwatch confirm`), so
//! the file-backed store serializes every read-modify-write with `flock` and
//! replaces the document by atomic rename.

use crate::fs::{self, nix_err};
use base::{bail, err, Error};
use nix::fcntl::{FlockArg, OFlag};
use nix::sys::stat::Mode;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STATUS_FILENAME: &str = "status.json";
const STATUS_TMP_FILENAME: &str = "status.json.tmp";
const LOCK_FILENAME: &str = "status.lock";

/// The persisted status document: `{ "detected": bool, "confirmed": bool }`.
///
/// `confirmed` implies `detected`; a document violating that is treated as corrupt.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStatus {
    pub detected: bool,
    pub confirmed: bool,
}

/// The result of applying a confirmation signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Confirmation {
    /// `confirmed` went from false to true.
    Confirmed,

    /// Already confirmed; nothing changed.
    AlreadyConfirmed,

    /// Nothing has been detected, so there's nothing to confirm; nothing changed.
    NotDetected,
}

impl EventStatus {
    pub fn is_valid(&self) -> bool {
        self.detected || !self.confirmed
    }

    /// Sets `detected`, returning true iff this was the false→true transition.
    pub fn mark_detected(&mut self) -> bool {
        let transitioned = !self.detected;
        self.detected = true;
        transitioned
    }

    /// Sets `confirmed` if there is an unconfirmed detection.
    pub fn confirm(&mut self) -> Confirmation {
        if !self.detected {
            Confirmation::NotDetected
        } else if self.confirmed {
            Confirmation::AlreadyConfirmed
        } else {
            self.confirmed = true;
            Confirmation::Confirmed
        }
    }
}

/// Shared, atomically-updated storage for an [`EventStatus`].
pub trait StatusStore: Send + Sync {
    fn read(&self) -> Result<EventStatus, Error>;

    /// Atomically reads the current status, applies `f`, and persists the result.
    ///
    /// Returns the status before and after `f`. Fails without writing if `f` produces an
    /// invalid status.
    fn update(
        &self,
        f: &mut dyn FnMut(&mut EventStatus),
    ) -> Result<(EventStatus, EventStatus), Error>;

    /// Sets `detected`, returning true iff this call made the false→true transition.
    fn mark_detected(&self) -> Result<bool, Error> {
        let mut transitioned = false;
        self.update(&mut |s| transitioned = s.mark_detected())?;
        Ok(transitioned)
    }

    fn confirm(&self) -> Result<Confirmation, Error> {
        let mut c = Confirmation::NotDetected;
        self.update(&mut |s| c = s.confirm())?;
        Ok(c)
    }

    /// Closes the event, returning to `{detected: false, confirmed: false}`.
    fn reset(&self) -> Result<(), Error> {
        self.update(&mut |s| *s = EventStatus::default())?;
        Ok(())
    }
}

fn apply(
    before: EventStatus,
    f: &mut dyn FnMut(&mut EventStatus),
) -> Result<EventStatus, Error> {
    let mut after = before;
    f(&mut after);
    if !after.is_valid() {
        bail!(
            Internal,
            msg("refusing to persist {after:?}: confirmed without detected")
        );
    }
    Ok(after)
}

/// An in-memory store, for when all parties are threads of one process.
#[derive(Debug, Default)]
pub struct MemoryStore(base::Mutex<EventStatus>);

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StatusStore for MemoryStore {
    fn read(&self) -> Result<EventStatus, Error> {
        Ok(*self.0.lock())
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut EventStatus),
    ) -> Result<(EventStatus, EventStatus), Error> {
        let mut l = self.0.lock();
        let before = *l;
        let after = apply(before, f)?;
        *l = after;
        Ok((before, after))
    }
}

/// What was found on disk when loading the status file.
enum Loaded {
    Ok(EventStatus),

    /// Missing or corrupt; holds the default status, which should be written back.
    NeedsRepair(EventStatus),
}

/// A store backed by `status.json` in a state directory, shareable across processes.
///
/// Every operation holds an `flock` on `status.lock` in the same directory: shared for
/// reads, exclusive for updates. `flock` locks belong to the open file description, so
/// threads within this process additionally serialize on an in-process mutex.
pub struct FileStore {
    dir: fs::Dir,
    path: PathBuf,
    lock_file: std::fs::File,
    in_process: base::Mutex<()>,
}

impl FileStore {
    /// Opens the store in `dir`, creating the directory and status file as needed.
    ///
    /// A corrupt status file is replaced with the idle status.
    pub fn open(dir: &Path) -> Result<Self, Error> {
        let d = fs::Dir::open(dir, true)
            .map_err(|e| nix_err(e, format!("unable to open state dir {}", dir.display())))?;
        let lock_file = fs::openat(
            d.0,
            LOCK_FILENAME,
            OFlag::O_CREAT | OFlag::O_RDWR | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|e| nix_err(e, format!("unable to open {LOCK_FILENAME}")))?;
        let store = FileStore {
            dir: d,
            path: dir.join(STATUS_FILENAME),
            lock_file,
            in_process: base::Mutex::new(()),
        };
        store.update(&mut |_| {})?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_lock<R>(
        &self,
        arg: FlockArg,
        f: impl FnOnce() -> Result<R, Error>,
    ) -> Result<R, Error> {
        let _guard = self.in_process.lock();
        let fd = self.lock_file.as_raw_fd();
        nix::fcntl::flock(fd, arg)
            .map_err(|e| nix_err(e, format!("unable to lock {LOCK_FILENAME}")))?;
        let r = f();
        if let Err(err) = nix::fcntl::flock(fd, FlockArg::Unlock) {
            warn!(%err, "unable to unlock {}", LOCK_FILENAME);
        }
        r
    }

    /// Loads the status file. The caller must hold the lock.
    fn load(&self) -> Result<Loaded, Error> {
        let mut f = match fs::openat(
            self.dir.0,
            STATUS_FILENAME,
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ) {
            Ok(f) => f,
            Err(nix::Error::ENOENT) => {
                debug!(path = %self.path.display(), "no status file; starting idle");
                return Ok(Loaded::NeedsRepair(EventStatus::default()));
            }
            Err(e) => return Err(nix_err(e, format!("unable to open {}", self.path.display()))),
        };
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)
            .map_err(|e| Error::from(e).with_msg(format!("unable to read {}", self.path.display())))?;
        match parse(&buf) {
            Ok(s) => Ok(Loaded::Ok(s)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    err = %e.chain(),
                    "corrupt status file; treating as no event and reinitializing",
                );
                Ok(Loaded::NeedsRepair(EventStatus::default()))
            }
        }
    }

    /// Writes the status file. The caller must hold the exclusive lock.
    fn store(&self, s: &EventStatus) -> Result<(), Error> {
        let mut data = serde_json::to_vec_pretty(s).map_err(|e| err!(Internal, source(e)))?;
        data.push(b'\n');
        self.dir
            .replace_file(STATUS_FILENAME, STATUS_TMP_FILENAME, &data)
    }
}

fn parse(buf: &[u8]) -> Result<EventStatus, Error> {
    let s: EventStatus = serde_json::from_slice(buf)
        .map_err(|e| err!(DataLoss, msg("status file is not valid JSON"), source(e)))?;
    if !s.is_valid() {
        bail!(DataLoss, msg("status file has confirmed without detected"));
    }
    Ok(s)
}

impl StatusStore for FileStore {
    fn read(&self) -> Result<EventStatus, Error> {
        let loaded = self.with_lock(FlockArg::LockShared, || self.load())?;
        match loaded {
            Loaded::Ok(s) => Ok(s),
            Loaded::NeedsRepair(_) => {
                // Repairing means writing, which needs the exclusive lock.
                let (_, after) = self.update(&mut |_| {})?;
                Ok(after)
            }
        }
    }

    fn update(
        &self,
        f: &mut dyn FnMut(&mut EventStatus),
    ) -> Result<(EventStatus, EventStatus), Error> {
        self.with_lock(FlockArg::LockExclusive, || {
            let (before, needs_write) = match self.load()? {
                Loaded::Ok(s) => (s, false),
                Loaded::NeedsRepair(s) => (s, true),
            };
            let after = apply(before, f)?;
            if needs_write || after != before {
                self.store(&after)?;
            }
            Ok((before, after))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use std::sync::Arc;

    fn read_raw(dir: &Path) -> String {
        std::fs::read_to_string(dir.join(STATUS_FILENAME)).unwrap()
    }

    #[test]
    fn open_creates_idle_file() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let state = tmpdir.path().join("state");
        let store = FileStore::open(&state).unwrap();
        assert_eq!(store.read().unwrap(), EventStatus::default());
        let raw: serde_json::Value = serde_json::from_str(&read_raw(&state)).unwrap();
        assert_eq!(
            raw,
            serde_json::json!({"detected": false, "confirmed": false})
        );
    }

    #[test]
    fn open_keeps_existing_event() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        std::fs::write(
            tmpdir.path().join(STATUS_FILENAME),
            r#"{"detected": true, "confirmed": false}"#,
        )
        .unwrap();
        let store = FileStore::open(tmpdir.path()).unwrap();
        assert_eq!(
            store.read().unwrap(),
            EventStatus {
                detected: true,
                confirmed: false
            }
        );
    }

    #[test]
    fn corrupt_file_is_reinitialized() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let store = FileStore::open(tmpdir.path()).unwrap();
        std::fs::write(tmpdir.path().join(STATUS_FILENAME), "{\"detec").unwrap();
        assert_eq!(store.read().unwrap(), EventStatus::default());
        let repaired: EventStatus = serde_json::from_str(&read_raw(tmpdir.path())).unwrap();
        assert_eq!(repaired, EventStatus::default());
    }

    #[test]
    fn confirmed_without_detected_is_corrupt() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        std::fs::write(
            tmpdir.path().join(STATUS_FILENAME),
            r#"{"detected": false, "confirmed": true}"#,
        )
        .unwrap();
        let store = FileStore::open(tmpdir.path()).unwrap();
        assert_eq!(store.read().unwrap(), EventStatus::default());
    }

    #[test]
    fn lifecycle() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let store = FileStore::open(tmpdir.path()).unwrap();

        assert_eq!(store.confirm().unwrap(), Confirmation::NotDetected);
        assert_eq!(store.read().unwrap(), EventStatus::default());

        assert!(store.mark_detected().unwrap());
        assert!(!store.mark_detected().unwrap());
        assert_eq!(store.confirm().unwrap(), Confirmation::Confirmed);
        assert_eq!(store.confirm().unwrap(), Confirmation::AlreadyConfirmed);
        assert_eq!(
            store.read().unwrap(),
            EventStatus {
                detected: true,
                confirmed: true
            }
        );

        store.reset().unwrap();
        assert_eq!(store.read().unwrap(), EventStatus::default());
        assert!(!tmpdir.path().join(STATUS_TMP_FILENAME).exists());
    }

    #[test]
    fn invalid_update_is_refused() {
        let store = MemoryStore::new();
        let e = store.update(&mut |s| s.confirmed = true).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::Internal);
        assert_eq!(store.read().unwrap(), EventStatus::default());
    }

    /// Two independently-opened stores (as two processes would have) see each other's writes
    /// and never clobber each other's field.
    #[test]
    fn separate_handles_share_state() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let a = FileStore::open(tmpdir.path()).unwrap();
        let b = FileStore::open(tmpdir.path()).unwrap();
        assert!(a.mark_detected().unwrap());
        assert_eq!(b.confirm().unwrap(), Confirmation::Confirmed);
        assert_eq!(
            a.read().unwrap(),
            EventStatus {
                detected: true,
                confirmed: true
            }
        );
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        testutil::init();
        let tmpdir = testutil::tempdir();
        let store = Arc::new(FileStore::open(tmpdir.path()).unwrap());
        let transitions: usize = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || store.mark_detected().unwrap())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(transitions, 1);
    }
}
