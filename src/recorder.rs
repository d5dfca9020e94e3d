// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The recorder worker: writes one event's footage and hands it off.
//!
//! Each recorder handles a single event and is a small state machine:
//!
//! ```text
//! Idle --Start--> Recording --Finish--> Finishing --> Stopped
//!   |                 |
//!   +------Stop-------+-----------------------------> Stopped
//! ```
//!
//! The sink is opened lazily on the first frame after `Start`, since only then
//! are the dimensions known. Frames received while `Idle` are dropped. On
//! `Finish` the sink is flushed and synced, the file is copied into place at
//! the hand-off path, optionally uploaded, and the event is closed by resetting
//! the status store. `Stop` aborts without any hand-off.

use crate::control::{ControlMessage, WorkerChannel};
use crate::upload::{self, Uploader};
use base::clock::{Clocks, TimerGuard};
use base::{err, Error};
use db::sink::{SinkOpener, VideoSink};
use db::{Frame, StatusStore};
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

/// Everything needed to create recorders, shared by all of them.
#[derive(Clone)]
pub struct Environment<C: Clocks + Clone> {
    pub clocks: C,
    pub store: Arc<dyn StatusStore>,
    pub sink_opener: Arc<dyn SinkOpener>,
    pub uploader: Option<Arc<dyn Uploader>>,

    /// Where the sink writes while recording.
    pub footage_path: PathBuf,

    /// The stable, well-known location of the most recent finished recording.
    pub handoff_path: PathBuf,
}

enum State {
    Idle,
    Recording { sink: Option<Box<dyn VideoSink>> },
    Finishing,
    Stopped,
}

impl State {
    fn name(&self) -> &'static str {
        match self {
            State::Idle => "Idle",
            State::Recording { .. } => "Recording",
            State::Finishing => "Finishing",
            State::Stopped => "Stopped",
        }
    }
}

/// How a recorder reached `Stopped`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Finished and handed off the given number of frames.
    HandedOff { frames: u64 },

    /// Stopped without a hand-off.
    Aborted,
}

pub struct Recorder<C: Clocks + Clone> {
    env: Environment<C>,
    event_id: Uuid,
    state: State,
    dropped_while_idle: u64,
    outcome: Option<Outcome>,
}

/// Starts a recorder thread for a new event.
///
/// The thread exits on reaching `Stopped`. Its result reports how it got there, or the sink or
/// hand-off failure which stopped it.
pub fn start<C: Clocks + Clone>(
    env: &Environment<C>,
    event_id: Uuid,
    seq: usize,
) -> Result<(WorkerChannel, thread::JoinHandle<Result<Outcome, Error>>), Error> {
    let mut recorder = Recorder::new(env.clone(), event_id);
    let (channel, rcv) = WorkerChannel::new("recorder");
    let span = tracing::info_span!("event", id = %event_id);
    let join = thread::Builder::new()
        .name(format!("recorder-{seq}"))
        .spawn(move || {
            let _enter = span.enter();
            let r = recorder.run(&rcv);
            if let Err(e) = &r {
                warn!(err = %e.chain(), "recorder failed");
            }
            r
        })?;
    Ok((channel, join))
}

impl<C: Clocks + Clone> Recorder<C> {
    pub fn new(env: Environment<C>, event_id: Uuid) -> Self {
        Recorder {
            env,
            event_id,
            state: State::Idle,
            dropped_while_idle: 0,
            outcome: None,
        }
    }

    pub fn state_name(&self) -> &'static str {
        self.state.name()
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state, State::Stopped)
    }

    /// Processes messages until `Stopped`.
    pub fn run(&mut self, cmds: &mpsc::Receiver<ControlMessage>) -> Result<Outcome, Error> {
        while !self.is_stopped() {
            let cmd = match cmds.recv() {
                Ok(c) => c,
                Err(_) => {
                    debug!("all senders gone; aborting");
                    self.handle(ControlMessage::Stop)?;
                    break;
                }
            };
            self.handle(cmd)?;
        }
        Ok(self.outcome.unwrap_or(Outcome::Aborted))
    }

    /// Applies one message to the state machine.
    ///
    /// An error means a sink or hand-off failure; the recorder is then `Stopped`.
    pub fn handle(&mut self, cmd: ControlMessage) -> Result<(), Error> {
        let state = std::mem::replace(&mut self.state, State::Stopped);
        self.state = match (state, cmd) {
            (State::Stopped, cmd) => {
                trace!("stopped; ignoring {}", cmd.name());
                State::Stopped
            }
            (State::Idle, ControlMessage::Stop) => {
                info!("stopped before recording started");
                self.outcome = Some(Outcome::Aborted);
                State::Stopped
            }
            (State::Recording { sink }, ControlMessage::Stop) => {
                self.abort(sink);
                State::Stopped
            }
            (State::Idle, ControlMessage::Start) => {
                info!(
                    dropped_while_idle = self.dropped_while_idle,
                    "recording started"
                );
                State::Recording { sink: None }
            }
            (State::Idle, ControlMessage::Frame(_)) => {
                self.dropped_while_idle += 1;
                State::Idle
            }
            (State::Idle, ControlMessage::Finish) => {
                debug!("finish while idle; nothing to hand off");
                State::Idle
            }
            (State::Recording { sink }, ControlMessage::Frame(f)) => State::Recording {
                sink: Some(self.write(sink, &f)?),
            },
            (State::Recording { sink }, ControlMessage::Finish) => {
                self.state = State::Finishing;
                let r = self.finish(sink);
                self.state = State::Stopped;
                self.outcome = Some(Outcome::HandedOff { frames: r? });
                State::Stopped
            }
            (s @ State::Recording { .. }, ControlMessage::Start) => {
                debug!("already recording; ignoring Start");
                s
            }
            (s, cmd @ ControlMessage::DetectionBatch(_)) => {
                warn!("recorder ignoring unexpected {}", cmd.name());
                s
            }
            (State::Finishing, _) => {
                // Finishing runs to completion within a single `handle` call.
                unreachable!("recorder observed in Finishing state")
            }
        };
        Ok(())
    }

    /// Writes a frame, opening the sink first if this is the first frame.
    fn write(
        &self,
        sink: Option<Box<dyn VideoSink>>,
        frame: &Frame,
    ) -> Result<Box<dyn VideoSink>, Error> {
        let mut sink = match sink {
            Some(s) => s,
            None => {
                let dims = frame.dims();
                let path = &self.env.footage_path;
                let _t = TimerGuard::new(&self.env.clocks, || format!("opening {}", path.display()));
                let s = self
                    .env
                    .sink_opener
                    .open(path, dims)
                    .map_err(|e| err!(e, msg("unable to open sink {}", path.display())))?;
                info!(%dims, path = %path.display(), "opened footage file");
                s
            }
        };
        sink.write_frame(frame)
            .map_err(|e| err!(e, msg("unable to write frame")))?;
        Ok(sink)
    }

    fn abort(&mut self, sink: Option<Box<dyn VideoSink>>) {
        self.outcome = Some(Outcome::Aborted);
        let Some(sink) = sink else {
            info!("recording stopped before any frames arrived");
            return;
        };
        match sink.finish() {
            Ok(frames) => info!(frames, "recording aborted; no hand-off"),
            Err(e) => warn!(err = %e.chain(), "unable to close aborted recording"),
        }
    }

    /// Closes the sink and hands off the footage, returning the number of frames.
    fn finish(&mut self, sink: Option<Box<dyn VideoSink>>) -> Result<u64, Error> {
        let clocks = &self.env.clocks;
        let frames = match sink {
            None => {
                warn!("finished before any frames arrived; nothing to hand off");
                0
            }
            Some(sink) => {
                let frames = {
                    let _t = TimerGuard::new(clocks, || "closing footage file");
                    sink.finish()
                        .map_err(|e| err!(e, msg("unable to close footage file")))?
                };
                let (from, to) = (&self.env.footage_path, &self.env.handoff_path);
                let bytes = {
                    let _t = TimerGuard::new(clocks, || format!("copying to {}", to.display()));
                    db::copy_into_place(from, to)?
                };
                info!(frames, bytes, path = %to.display(), "footage handed off");
                if let Some(u) = &self.env.uploader {
                    let key = upload::remote_key(clocks.realtime(), self.event_id);
                    let _t = TimerGuard::new(clocks, || format!("uploading {key}"));
                    if let Err(e) = u.upload(to, &key) {
                        warn!(err = %e.chain(), %key, "upload failed; footage kept locally");
                    }
                }
                frames
            }
        };
        match self.env.store.reset() {
            Ok(()) => info!("event closed"),
            Err(e) => warn!(err = %e.chain(), "unable to close event"),
        }
        Ok(frames)
    }
}
