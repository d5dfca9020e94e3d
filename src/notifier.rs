// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The notifier worker: marks events detected and alerts the verifiers.

use crate::confirmer::ConfirmChannel;
use crate::control::{ControlMessage, WorkerChannel};
use crate::push::{self, Alert, Pusher};
use base::Error;
use db::{Confirmation, StatusStore};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, error, info, warn};

/// State of the worker thread created by [`start`].
pub struct Notifier {
    store: Arc<dyn StatusStore>,
    pusher: Arc<dyn Pusher>,
    alert: Alert,
    tokens: Vec<String>,

    /// Batches with a detection scoring at least this also confirm the event.
    auto_confirm_score: Option<f32>,

    /// Told about each new event, so its escalation timer starts from the detection.
    confirmer: Option<ConfirmChannel>,
}

/// Starts a notifier thread.
///
/// Returns a channel for sending it [`ControlMessage::DetectionBatch`]es and a handle to join
/// once [`ControlMessage::Stop`] has been sent.
pub fn start(
    mut notifier: Notifier,
) -> Result<(WorkerChannel, thread::JoinHandle<()>), Error> {
    let (channel, rcv) = WorkerChannel::new("notifier");
    let join = thread::Builder::new()
        .name("notifier".to_owned())
        .spawn(move || {
            while notifier.iter(&rcv) {}
            debug!("notifier exiting");
        })?;
    Ok((channel, join))
}

impl Notifier {
    pub fn new(
        store: Arc<dyn StatusStore>,
        pusher: Arc<dyn Pusher>,
        alert: Alert,
        tokens: Vec<String>,
    ) -> Self {
        Notifier {
            store,
            pusher,
            alert,
            tokens,
            auto_confirm_score: None,
            confirmer: None,
        }
    }

    pub fn auto_confirm(mut self, score: Option<f32>) -> Self {
        self.auto_confirm_score = score;
        self
    }

    pub fn confirmer(mut self, confirmer: ConfirmChannel) -> Self {
        self.confirmer = Some(confirmer);
        self
    }

    /// Processes a single message. Returns true iff the loop should continue.
    pub fn iter(&mut self, cmds: &mpsc::Receiver<ControlMessage>) -> bool {
        let cmd = match cmds.recv() {
            Err(_) => return false, // all senders are gone.
            Ok(cmd) => cmd,
        };
        match cmd {
            ControlMessage::Stop => return false,
            ControlMessage::DetectionBatch(d) => {
                self.detected(d.len());
                if let (Some(min), Some(max)) = (self.auto_confirm_score, d.max_score()) {
                    if max >= min {
                        self.confirm_automatically(max);
                    }
                }
            }
            other => warn!("notifier ignoring unexpected {}", other.name()),
        }
        true
    }

    fn detected(&mut self, boxes: usize) {
        // The flag is persisted before any network call, so a failed push can't lose it.
        let transitioned = match self.store.mark_detected() {
            Ok(t) => t,
            Err(e) => {
                error!(err = %e.chain(), "unable to mark event detected");
                return;
            }
        };
        if !transitioned {
            debug!(boxes, "event already detected; not notifying again");
            return;
        }
        info!(boxes, "new event detected; notifying {} verifier(s)", self.tokens.len());
        if let Some(c) = &self.confirmer {
            if let Err(e) = c.detected() {
                debug!(err = %e, "not announcing new event");
            }
        }
        let failures = push::send_all(&*self.pusher, &self.alert, &self.tokens);
        if failures > 0 {
            warn!(failures, "some detection notifications weren't delivered");
        }
    }

    /// Confirms on behalf of the verifiers. Runs after [`Notifier::detected`] on the same queue,
    /// so the event is already marked detected unless the store failed.
    fn confirm_automatically(&mut self, score: f32) {
        match self.store.confirm() {
            Ok(Confirmation::Confirmed) => info!(score, source = "auto", "event confirmed"),
            Ok(_) => {}
            Err(e) => warn!(err = %e.chain(), "unable to auto-confirm event"),
        }
    }
}
