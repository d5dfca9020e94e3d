// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Messages from the orchestrator to its workers.

use crate::detect::Detection;
use base::{err, Error};
use db::Frame;
use std::sync::mpsc;

/// A message on a worker's inbound queue.
///
/// Each worker acts on the variants meant for it and ignores the rest.
#[derive(Debug)]
pub enum ControlMessage {
    /// Terminates the receiving worker's loop. Nothing queued after it is processed.
    Stop,

    /// Begins an active recording (recorder only).
    Start,

    /// A frame to write (recorder only).
    Frame(Frame),

    /// One frame's post-NMS detections (notifier only).
    DetectionBatch(Detection),

    /// Closes the current recording and hands it off (recorder only).
    Finish,
}

impl ControlMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ControlMessage::Stop => "Stop",
            ControlMessage::Start => "Start",
            ControlMessage::Frame(_) => "Frame",
            ControlMessage::DetectionBatch(_) => "DetectionBatch",
            ControlMessage::Finish => "Finish",
        }
    }
}

/// The sending half of a worker's queue.
///
/// Unbounded and ordered: a slow worker backs up rather than losing messages.
/// Can be cloned to allow multiple threads to send.
#[derive(Clone)]
pub struct WorkerChannel {
    name: &'static str,
    tx: mpsc::Sender<ControlMessage>,
}

impl WorkerChannel {
    pub fn new(name: &'static str) -> (Self, mpsc::Receiver<ControlMessage>) {
        let (tx, rx) = mpsc::channel();
        (WorkerChannel { name, tx }, rx)
    }

    /// Enqueues `msg`, failing only if the worker has already exited.
    pub fn send(&self, msg: ControlMessage) -> Result<(), Error> {
        let what = msg.name();
        self.tx.send(msg).map_err(|_| {
            err!(
                FailedPrecondition,
                msg("{} has exited; can't deliver {what}", self.name)
            )
        })
    }
}
