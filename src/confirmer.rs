// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The confirmer worker: turns confirmation signals into the `confirmed` flag,
//! and escalates events nobody has confirmed in time.

use crate::push::{self, Alert, Pusher};
use base::clock::{Clocks, Duration, Instant};
use base::{err, Error};
use db::{Confirmation, StatusStore};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, info, warn};

/// How often the store is checked for unconfirmed events when escalation is enabled.
const ESCALATION_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum ConfirmSignal {
    /// A verifier (or the auto-confirm policy) says the event is real.
    Confirm { source: &'static str },

    /// The notifier persisted a false→true transition of `detected`: a new event has begun.
    Detected,
    Stop,
}

/// The sending half of the confirmer's queue.
#[derive(Clone)]
pub struct ConfirmChannel(mpsc::Sender<ConfirmSignal>);

impl ConfirmChannel {
    pub fn confirm(&self, source: &'static str) -> Result<(), Error> {
        self.send(ConfirmSignal::Confirm { source })
    }

    pub fn detected(&self) -> Result<(), Error> {
        self.send(ConfirmSignal::Detected)
    }

    pub fn stop(&self) -> Result<(), Error> {
        self.send(ConfirmSignal::Stop)
    }

    fn send(&self, s: ConfirmSignal) -> Result<(), Error> {
        self.0
            .send(s)
            .map_err(|_| err!(FailedPrecondition, msg("confirmer has exited")))
    }
}

/// Pushes a second round of alerts when an event stays unconfirmed too long.
pub struct Escalation {
    pub after: Duration,
    pub pusher: Arc<dyn Pusher>,
    pub primary_tokens: Vec<String>,
    pub secondary_tokens: Vec<String>,
}

/// State of the worker thread created by [`start`].
pub struct Confirmer<C: Clocks + Clone> {
    clocks: C,
    store: Arc<dyn StatusStore>,
    escalation: Option<Escalation>,

    /// When the current unconfirmed event was first seen, if there is one.
    pending_since: Option<Instant>,

    /// True iff the current event has already been escalated.
    escalated: bool,
}

pub fn start<C: Clocks + Clone>(
    clocks: C,
    store: Arc<dyn StatusStore>,
    escalation: Option<Escalation>,
) -> Result<(ConfirmChannel, thread::JoinHandle<()>), Error> {
    let mut confirmer = Confirmer::new(clocks, store, escalation);
    let (snd, rcv) = mpsc::channel();
    let join = thread::Builder::new()
        .name("confirmer".to_owned())
        .spawn(move || {
            while confirmer.iter(&rcv) {}
            debug!("confirmer exiting");
        })?;
    Ok((ConfirmChannel(snd), join))
}

impl<C: Clocks + Clone> Confirmer<C> {
    pub fn new(clocks: C, store: Arc<dyn StatusStore>, escalation: Option<Escalation>) -> Self {
        Confirmer {
            clocks,
            store,
            escalation,
            pending_since: None,
            escalated: false,
        }
    }

    /// Waits for and processes one signal (or, with escalation enabled, one poll interval).
    /// Returns true iff the loop should continue.
    pub fn iter(&mut self, signals: &mpsc::Receiver<ConfirmSignal>) -> bool {
        let signal = if self.escalation.is_some() {
            match self.clocks.recv_timeout(signals, ESCALATION_POLL) {
                Ok(s) => Some(s),
                Err(mpsc::RecvTimeoutError::Timeout) => None,
                Err(mpsc::RecvTimeoutError::Disconnected) => return false,
            }
        } else {
            match signals.recv() {
                Ok(s) => Some(s),
                Err(_) => return false,
            }
        };
        match signal {
            Some(ConfirmSignal::Stop) => return false,
            Some(ConfirmSignal::Confirm { source }) => self.confirm(source),
            Some(ConfirmSignal::Detected) => self.new_event(),
            None => {}
        }
        self.check_escalation();
        true
    }

    /// Re-arms escalation for an event that just began.
    fn new_event(&mut self) {
        if self.escalation.is_none() {
            return;
        }
        debug!("new event; escalation timer started");
        self.pending_since = Some(self.clocks.monotonic());
        self.escalated = false;
    }

    fn confirm(&mut self, source: &'static str) {
        match self.store.confirm() {
            Ok(Confirmation::Confirmed) => info!(source, "event confirmed"),
            Ok(Confirmation::AlreadyConfirmed) => {
                debug!(source, "event already confirmed; ignoring")
            }
            Ok(Confirmation::NotDetected) => {
                info!(source, "nothing detected; ignoring confirmation")
            }
            Err(e) => warn!(err = %e.chain(), source, "unable to confirm event"),
        }
    }

    fn check_escalation(&mut self) {
        let Some(esc) = &self.escalation else {
            return;
        };
        let status = match self.store.read() {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e.chain(), "unable to read event status");
                return;
            }
        };
        if !status.detected {
            // Event closed (or never opened); arm for the next one.
            self.pending_since = None;
            self.escalated = false;
            return;
        }
        if status.confirmed {
            self.pending_since = None;
            return;
        }
        if self.escalated {
            return;
        }
        let now = self.clocks.monotonic();
        let since = *self.pending_since.get_or_insert(now);
        if now - since < esc.after {
            return;
        }
        self.escalated = true;
        warn!(
            "event unconfirmed after {:?}; escalating to {} secondary verifier(s)",
            esc.after,
            esc.secondary_tokens.len()
        );
        push::send_all(
            &*esc.pusher,
            &Alert::secondary_verification(),
            &esc.secondary_tokens,
        );
        push::send_all(
            &*esc.pusher,
            &Alert::verification_timeout(),
            &esc.primary_tokens,
        );
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::push::testutil::MockPusher;
    use base::clock::SimulatedClocks;
    use db::{EventStatus, MemoryStore};

    fn status(detected: bool, confirmed: bool) -> EventStatus {
        EventStatus {
            detected,
            confirmed,
        }
    }

    #[test]
    fn confirm_requires_detection() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let store = Arc::new(MemoryStore::new());
        let mut c = Confirmer::new(clocks, store.clone(), None);
        let (snd, rcv) = mpsc::channel();

        snd.send(ConfirmSignal::Confirm { source: "test" }).unwrap();
        assert!(c.iter(&rcv));
        assert_eq!(store.read().unwrap(), status(false, false));

        store.mark_detected().unwrap();
        snd.send(ConfirmSignal::Confirm { source: "test" }).unwrap();
        assert!(c.iter(&rcv));
        assert_eq!(store.read().unwrap(), status(true, true));

        snd.send(ConfirmSignal::Confirm { source: "test" }).unwrap();
        assert!(c.iter(&rcv));
        assert_eq!(store.read().unwrap(), status(true, true));

        snd.send(ConfirmSignal::Stop).unwrap();
        assert!(!c.iter(&rcv));
    }

    /// The detect, re-detect, confirm sequence across the notifier and confirmer.
    #[test]
    fn notify_then_confirm_scenario() {
        use crate::control::{ControlMessage, WorkerChannel};
        use crate::detect::Detection;
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let store = Arc::new(MemoryStore::new());
        let pusher = Arc::new(MockPusher::default());
        let mut n = crate::notifier::Notifier::new(
            store.clone(),
            pusher.clone(),
            Alert::detected(),
            vec!["primary".to_owned()],
        );
        let mut c = Confirmer::new(clocks, store.clone(), None);
        let (nch, nrcv) = WorkerChannel::new("notifier");
        let (csnd, crcv) = mpsc::channel();

        nch.send(ControlMessage::DetectionBatch(Detection::synthetic()))
            .unwrap();
        assert!(n.iter(&nrcv));
        assert_eq!(store.read().unwrap(), status(true, false));
        assert_eq!(pusher.sent.lock().len(), 1);

        nch.send(ControlMessage::DetectionBatch(Detection::synthetic()))
            .unwrap();
        assert!(n.iter(&nrcv));
        assert_eq!(store.read().unwrap(), status(true, false));
        assert_eq!(pusher.sent.lock().len(), 1);

        csnd.send(ConfirmSignal::Confirm { source: "operator" })
            .unwrap();
        assert!(c.iter(&crcv));
        assert_eq!(store.read().unwrap(), status(true, true));
    }

    fn escalation(pusher: Arc<MockPusher>) -> Escalation {
        Escalation {
            after: Duration::from_secs(20),
            pusher,
            primary_tokens: vec!["primary".to_owned()],
            secondary_tokens: vec!["secondary".to_owned()],
        }
    }

    #[test]
    fn escalates_once_per_event() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let store = Arc::new(MemoryStore::new());
        let pusher = Arc::new(MockPusher::default());
        let mut c = Confirmer::new(clocks.clone(), store.clone(), Some(escalation(pusher.clone())));
        let (_snd, rcv) = mpsc::channel();

        // Idle: nothing happens however long we wait.
        for _ in 0..30 {
            assert!(c.iter(&rcv));
        }
        assert!(pusher.sent.lock().is_empty());

        store.mark_detected().unwrap();
        for _ in 0..20 {
            assert!(c.iter(&rcv));
        }
        assert!(pusher.sent.lock().is_empty(), "escalated too early");
        assert!(c.iter(&rcv));
        assert_eq!(
            pusher.titles(),
            ["SECONDARY VERIFICATION REQUIRED", "VERIFICATION TIMEOUT"]
        );
        assert_eq!(pusher.sent.lock()[0].to, "secondary");
        assert_eq!(pusher.sent.lock()[1].to, "primary");

        for _ in 0..60 {
            assert!(c.iter(&rcv));
        }
        assert_eq!(pusher.sent.lock().len(), 2);

        // The next event escalates again.
        store.reset().unwrap();
        assert!(c.iter(&rcv));
        store.mark_detected().unwrap();
        for _ in 0..22 {
            assert!(c.iter(&rcv));
        }
        assert_eq!(pusher.sent.lock().len(), 4);
    }

    /// The recorder's reset can be followed by a re-detection before any poll sees the gap.
    /// The next event still gets its full escalation delay.
    #[test]
    fn redetect_after_confirmed_event_waits_full_delay() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let store = Arc::new(MemoryStore::new());
        let pusher = Arc::new(MockPusher::default());
        let mut c = Confirmer::new(clocks, store.clone(), Some(escalation(pusher.clone())));
        let (snd, rcv) = mpsc::channel();

        store.mark_detected().unwrap();
        snd.send(ConfirmSignal::Detected).unwrap();
        assert!(c.iter(&rcv));
        for _ in 0..5 {
            assert!(c.iter(&rcv));
        }
        snd.send(ConfirmSignal::Confirm { source: "test" }).unwrap();
        assert!(c.iter(&rcv));
        for _ in 0..60 {
            assert!(c.iter(&rcv));
        }
        assert!(pusher.sent.lock().is_empty());

        store.reset().unwrap();
        store.mark_detected().unwrap();
        snd.send(ConfirmSignal::Detected).unwrap();
        assert!(c.iter(&rcv));
        for _ in 0..19 {
            assert!(c.iter(&rcv));
        }
        assert!(pusher.sent.lock().is_empty(), "escalated before the delay");
        assert!(c.iter(&rcv));
        assert_eq!(
            pusher.titles(),
            ["SECONDARY VERIFICATION REQUIRED", "VERIFICATION TIMEOUT"]
        );
    }

    /// An escalated event that closes straight into a new one doesn't suppress the new one's
    /// escalation.
    #[test]
    fn redetect_after_escalated_event_escalates_again() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let store = Arc::new(MemoryStore::new());
        let pusher = Arc::new(MockPusher::default());
        let mut c = Confirmer::new(clocks, store.clone(), Some(escalation(pusher.clone())));
        let (snd, rcv) = mpsc::channel();

        store.mark_detected().unwrap();
        snd.send(ConfirmSignal::Detected).unwrap();
        assert!(c.iter(&rcv));
        for _ in 0..20 {
            assert!(c.iter(&rcv));
        }
        assert_eq!(pusher.sent.lock().len(), 2);

        store.reset().unwrap();
        store.mark_detected().unwrap();
        snd.send(ConfirmSignal::Detected).unwrap();
        assert!(c.iter(&rcv));
        for _ in 0..19 {
            assert!(c.iter(&rcv));
        }
        assert_eq!(pusher.sent.lock().len(), 2);
        assert!(c.iter(&rcv));
        assert_eq!(pusher.sent.lock().len(), 4);
    }

    #[test]
    fn confirmed_events_are_not_escalated() {
        db::testutil::init();
        let clocks = SimulatedClocks::new(jiff::Timestamp::UNIX_EPOCH);
        let store = Arc::new(MemoryStore::new());
        let pusher = Arc::new(MockPusher::default());
        let mut c = Confirmer::new(clocks, store.clone(), Some(escalation(pusher.clone())));
        let (snd, rcv) = mpsc::channel();
        store.mark_detected().unwrap();
        assert!(c.iter(&rcv));
        snd.send(ConfirmSignal::Confirm { source: "test" }).unwrap();
        assert!(c.iter(&rcv));
        for _ in 0..60 {
            assert!(c.iter(&rcv));
        }
        assert!(pusher.sent.lock().is_empty());
        drop(snd);
        assert!(!c.iter(&rcv));
    }

    #[test]
    fn thread_lifecycle() {
        db::testutil::init();
        let store = Arc::new(MemoryStore::new());
        store.mark_detected().unwrap();
        let (ch, join) = start(base::clock::RealClocks {}, store.clone(), None).unwrap();
        ch.confirm("test").unwrap();
        ch.stop().unwrap();
        join.join().unwrap();
        assert_eq!(store.read().unwrap(), status(true, true));
        ch.confirm("test").unwrap_err();
    }
}
