// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! The main loop: pulls frames, runs detection, and drives the workers.

use crate::confirmer::{self, ConfirmChannel, Escalation};
use crate::control::{ControlMessage, WorkerChannel};
use crate::detect::{Detection, Detector};
use crate::nms::{self, NmsConfig};
use crate::notifier::{self, Notifier};
use crate::operator::OperatorCommand;
use crate::push::{Alert, Pusher};
use crate::recorder::{self, Outcome};
use crate::stream::{self, FrameSource};
use base::clock::{Clocks, Duration, Instant, TimerGuard};
use base::{err, Error};
use db::{Frame, StatusStore};
use std::sync::{mpsc, Arc};
use std::thread;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

/// How often the store is checked for confirmation while not recording.
pub const STATUS_POLL: Duration = Duration::from_millis(250);

/// Shared state the orchestrator borrows from its caller.
pub struct Environment<'a, C: Clocks + Clone> {
    pub clocks: C,
    pub opener: &'a dyn stream::Opener,
    pub store: Arc<dyn StatusStore>,
    pub shutdown_rx: &'a base::shutdown::Receiver,
}

/// Per-session policy.
pub struct Config {
    pub source: Url,
    pub nms: NmsConfig,
    pub class_names: Vec<String>,
    pub auto_confirm_score: Option<f32>,

    /// Recordings are finished automatically after this long.
    pub max_recording: Option<Duration>,
}

/// The collaborators handed to the worker threads.
pub struct Workers<C: Clocks + Clone> {
    pub pusher: Arc<dyn Pusher>,
    pub alert: Alert,
    pub tokens: Vec<String>,
    pub escalation: Option<Escalation>,
    pub recorder: recorder::Environment<C>,
}

struct ActiveRecorder {
    channel: WorkerChannel,
    join: thread::JoinHandle<Result<Outcome, Error>>,

    /// When `Start` was sent, or `None` while idle.
    recording_since: Option<Instant>,
}

enum Flow {
    Continue,
    Quit,
}

pub struct Orchestrator<'a, C: Clocks + Clone> {
    clocks: C,
    opener: &'a dyn stream::Opener,
    store: Arc<dyn StatusStore>,
    shutdown_rx: base::shutdown::Receiver,
    cfg: Config,
    detector: Box<dyn Detector>,
    operator: Option<mpsc::Receiver<OperatorCommand>>,

    notifier: Option<(WorkerChannel, thread::JoinHandle<()>)>,
    confirmer: Option<(ConfirmChannel, thread::JoinHandle<()>)>,
    recorder_env: recorder::Environment<C>,
    recorder: Option<ActiveRecorder>,
    recorders_started: usize,
    last_status_poll: Option<Instant>,
}

impl<'a, C: Clocks + Clone> Orchestrator<'a, C> {
    /// Starts the worker threads. They're stopped and joined by [`Orchestrator::run`], or on
    /// drop if `run` is never called.
    pub fn new(
        env: &Environment<'a, C>,
        cfg: Config,
        detector: Box<dyn Detector>,
        workers: Workers<C>,
        operator: Option<mpsc::Receiver<OperatorCommand>>,
    ) -> Result<Self, Error> {
        cfg.nms.validate()?;
        let mut o = Orchestrator {
            clocks: env.clocks.clone(),
            opener: env.opener,
            store: env.store.clone(),
            shutdown_rx: env.shutdown_rx.clone(),
            detector,
            operator,
            notifier: None,
            confirmer: None,
            recorder_env: workers.recorder,
            recorder: None,
            recorders_started: 0,
            last_status_poll: None,
            cfg,
        };
        let (confirm_ch, confirm_join) =
            confirmer::start(o.clocks.clone(), o.store.clone(), workers.escalation)?;
        let notifier = Notifier::new(
            o.store.clone(),
            workers.pusher,
            workers.alert,
            workers.tokens,
        )
        .auto_confirm(o.cfg.auto_confirm_score)
        .confirmer(confirm_ch.clone());
        o.confirmer = Some((confirm_ch, confirm_join));
        o.notifier = Some(notifier::start(notifier)?);
        o.spawn_recorder()?;
        Ok(o)
    }

    /// Runs until quit, shutdown, end of stream, or a fatal error; then stops and joins every
    /// worker.
    pub fn run(&mut self) -> Result<(), Error> {
        let r = match self.open_source() {
            Ok(mut source) => {
                let r = self.run_loop(&mut source);

                // Workers are joined before the source is released.
                let stopped = self.stop_workers();
                drop(source);
                r.and(stopped)
            }
            Err(e) => self.stop_workers().and(Err(e)),
        };
        info!("session ended");
        r
    }

    fn open_source(&self) -> Result<Box<dyn FrameSource>, Error> {
        let url = &self.cfg.source;
        info!(%url, "opening source");
        let _t = TimerGuard::new(&self.clocks, || format!("opening {url}"));
        self.opener.open(url)
    }

    fn run_loop(&mut self, source: &mut Box<dyn FrameSource>) -> Result<(), Error> {
        let mut reconnected = false;
        loop {
            if self.shutdown_rx.check().is_err() {
                info!("shutdown requested");
                return Ok(());
            }
            if let Flow::Quit = self.handle_operator()? {
                info!("operator quit");
                return Ok(());
            }
            let frame = {
                let _t = TimerGuard::new(&self.clocks, || "reading frame");
                source.next()
            };
            let frame = match frame {
                Ok(Some(f)) => {
                    reconnected = false;
                    f
                }
                Ok(None) => {
                    info!("end of stream");
                    return Ok(());
                }
                Err(e) if !reconnected => {
                    warn!(err = %e.chain(), "source failed; reconnecting once");
                    reconnected = true;
                    *source = self
                        .open_source()
                        .map_err(|e| err!(e, msg("unable to reconnect to source")))?;
                    continue;
                }
                Err(e) => return Err(err!(e, msg("source failed again after reconnecting"))),
            };
            self.process_frame(frame)?;
        }
    }

    fn process_frame(&mut self, frame: Frame) -> Result<(), Error> {
        let detection = match self.detect(&frame) {
            Ok(d) => d,
            Err(e) => {
                warn!(err = %e.chain(), "inference failed; skipping frame");
                return Ok(());
            }
        };
        if !detection.is_empty() {
            info!(
                "detected {}",
                detection.describe(&self.cfg.class_names)
            );
            self.send_to_notifier(ControlMessage::DetectionBatch(detection))?;
        }
        self.feed_recorder(frame)
    }

    fn detect(&mut self, frame: &Frame) -> Result<Detection, Error> {
        let candidates = {
            let _t = TimerGuard::new(&self.clocks, || "inference");
            self.detector.infer(frame)?
        };
        let mut d = nms::process(&candidates, &self.cfg.nms, frame.dims())?;
        d.retain_known_classes(self.cfg.class_names.len());
        Ok(d)
    }

    /// Sends a frame to the recorder if recording, first checking whether recording should
    /// start or finish.
    fn feed_recorder(&mut self, frame: Frame) -> Result<(), Error> {
        let now = self.clocks.monotonic();
        let since = self.recorder.as_ref().and_then(|r| r.recording_since);
        match since {
            None => {
                if !self.poll_confirmed(now) {
                    return Ok(());
                }
                info!("event confirmed; recording");
                self.start_recording(now)?;
            }
            Some(since) => {
                if let Some(max) = self.cfg.max_recording {
                    if now - since >= max {
                        info!("recording reached {max:?}; finishing");
                        return self.finish_recording();
                    }
                }
            }
        }
        self.send_to_recorder(ControlMessage::Frame(frame))
    }

    /// Returns true if the store says the current event is confirmed, checking at most once per
    /// [`STATUS_POLL`].
    fn poll_confirmed(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_status_poll {
            if now - last < STATUS_POLL {
                return false;
            }
        }
        self.last_status_poll = Some(now);
        match self.store.read() {
            Ok(s) => s.confirmed,
            Err(e) => {
                warn!(err = %e.chain(), "unable to read event status");
                false
            }
        }
    }

    fn handle_operator(&mut self) -> Result<Flow, Error> {
        let Some(rcv) = &self.operator else {
            return Ok(Flow::Continue);
        };
        let cmd = match rcv.try_recv() {
            Ok(c) => c,
            Err(mpsc::TryRecvError::Empty) => return Ok(Flow::Continue),
            Err(mpsc::TryRecvError::Disconnected) => {
                debug!("operator input closed");
                self.operator = None;
                return Ok(Flow::Continue);
            }
        };
        match cmd {
            OperatorCommand::Quit => return Ok(Flow::Quit),
            OperatorCommand::ForceNotify => {
                info!("operator forced a detection");
                self.send_to_notifier(ControlMessage::DetectionBatch(Detection::synthetic()))?;
            }
            OperatorCommand::ForceRecord => {
                if self.is_recording() {
                    info!("already recording");
                } else {
                    info!("operator started recording");
                    let now = self.clocks.monotonic();
                    self.start_recording(now)?;
                }
            }
            OperatorCommand::Confirm => {
                if let Some((c, _)) = &self.confirmer {
                    c.confirm("operator")?;
                }
            }
            OperatorCommand::Finish => {
                if self.is_recording() {
                    info!("operator finished recording");
                    self.finish_recording()?;
                } else {
                    info!("not recording; nothing to finish");
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn is_recording(&self) -> bool {
        matches!(
            self.recorder,
            Some(ActiveRecorder {
                recording_since: Some(_),
                ..
            })
        )
    }

    fn spawn_recorder(&mut self) -> Result<(), Error> {
        let id = Uuid::now_v7();
        let (channel, join) = recorder::start(&self.recorder_env, id, self.recorders_started)?;
        self.recorders_started += 1;
        debug!(event = %id, "recorder ready");
        self.recorder = Some(ActiveRecorder {
            channel,
            join,
            recording_since: None,
        });
        Ok(())
    }

    fn start_recording(&mut self, now: Instant) -> Result<(), Error> {
        self.send_to_recorder(ControlMessage::Start)?;
        if let Some(r) = &mut self.recorder {
            r.recording_since = Some(now);
        }
        Ok(())
    }

    /// Finishes the current recording, waits for its hand-off, and readies the next recorder.
    fn finish_recording(&mut self) -> Result<(), Error> {
        self.send_to_recorder(ControlMessage::Finish)?;
        let Some(r) = self.recorder.take() else {
            return Ok(());
        };
        let outcome = {
            let _t = TimerGuard::new(&self.clocks, || "waiting for hand-off");
            join_recorder(r.join)?
        };
        info!(?outcome, "recording finished");
        self.last_status_poll = None;
        self.spawn_recorder()
    }

    fn send_to_notifier(&self, msg: ControlMessage) -> Result<(), Error> {
        match &self.notifier {
            Some((ch, _)) => ch.send(msg),
            None => Ok(()),
        }
    }

    /// Sends to the recorder. If it has exited, joins it and returns the error which stopped it.
    fn send_to_recorder(&mut self, msg: ControlMessage) -> Result<(), Error> {
        let Some(r) = &self.recorder else {
            return Ok(());
        };
        let Err(e) = r.channel.send(msg) else {
            return Ok(());
        };
        let Some(r) = self.recorder.take() else {
            return Err(e);
        };
        join_recorder(r.join)?;
        Err(e)
    }

    /// Sends `Stop` to every worker and joins them all, returning the first failure.
    fn stop_workers(&mut self) -> Result<(), Error> {
        if let Some((ch, _)) = &self.notifier {
            let _ = ch.send(ControlMessage::Stop);
        }
        if let Some((ch, _)) = &self.confirmer {
            let _ = ch.stop();
        }
        if let Some(r) = &self.recorder {
            let _ = r.channel.send(ControlMessage::Stop);
        }
        let mut result = Ok(());
        if let Some((_, join)) = self.notifier.take() {
            if join.join().is_err() {
                error!("notifier panicked; look for previous panic message");
            }
        }
        if let Some((_, join)) = self.confirmer.take() {
            if join.join().is_err() {
                error!("confirmer panicked; look for previous panic message");
            }
        }
        if let Some(r) = self.recorder.take() {
            if let Err(e) = join_recorder(r.join) {
                result = Err(e);
            }
        }
        debug!("all workers joined");
        result
    }
}

impl<C: Clocks + Clone> Drop for Orchestrator<'_, C> {
    fn drop(&mut self) {
        if self.notifier.is_some() || self.confirmer.is_some() || self.recorder.is_some() {
            if let Err(e) = self.stop_workers() {
                warn!(err = %e.chain(), "worker failed during teardown");
            }
        }
    }
}

fn join_recorder(join: thread::JoinHandle<Result<Outcome, Error>>) -> Result<Outcome, Error> {
    match join.join() {
        Ok(r) => r,
        Err(_) => Err(err!(Internal, msg("recorder panicked; look for previous panic message"))),
    }
}
