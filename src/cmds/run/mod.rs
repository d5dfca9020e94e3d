// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use crate::confirmer::Escalation;
use crate::detect::{Detector, NullDetector, ReplayDetector};
use crate::operator;
use crate::orchestrator::{self, Orchestrator};
use crate::push::{Alert, ExpoPusher, Pusher};
use crate::recorder;
use crate::stream;
use crate::upload::{HttpUploader, Uploader};
use base::clock::{self, Duration};
use base::{bail, err, Error};
use bpaf::Bpaf;
use db::sink::Y4mSinkOpener;
use db::{FileStore, StatusStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};

use self::config::{ConfigFile, DetectorConfig, RecordingConfig};

pub mod config;

/// Runs the detection pipeline until end of stream, quit, or a signal.
#[derive(Bpaf, Debug)]
#[bpaf(command("run"))]
pub struct Args {
    #[bpaf(external(crate::parse_config_path))]
    config: PathBuf,

    /// Doesn't read operator commands from standard input.
    no_operator: bool,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let config: ConfigFile = super::read_config(&args.config)?;

    // The pipeline does blocking I/O on its own threads; the runtime only waits for signals.
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (shutdown_tx, shutdown_rx) = base::shutdown::channel();
    let operator = !args.no_operator;
    let join = thread::Builder::new()
        .name("pipeline".to_owned())
        .spawn(move || pipeline(config, operator, shutdown_rx))?;
    let r = rt.block_on(async_run(shutdown_tx, join));

    // tokio normally waits for all spawned tasks to complete, but in the immediate shutdown
    // path, we don't want to wait for the pipeline.
    rt.shutdown_background();

    r
}

type PipelineHandle = thread::JoinHandle<Result<i32, Error>>;

async fn async_run(
    shutdown_tx: base::shutdown::Sender,
    pipeline: PipelineHandle,
) -> Result<i32, Error> {
    let mut shutdown_tx = Some(shutdown_tx);
    let mut int = signal(SignalKind::interrupt())?;
    let mut term = signal(SignalKind::terminate())?;
    let mut inner = tokio::task::spawn_blocking(move || pipeline.join());

    tokio::select! {
        _ = int.recv() => {
            info!("received SIGINT; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        _ = term.recv() => {
            info!("received SIGTERM; shutting down gracefully. \
                   Send another SIGINT or SIGTERM to shut down immediately.");
            shutdown_tx.take();
        },
        result = &mut inner => return flatten(result),
    }

    tokio::select! {
        _ = int.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGINT)")),
        _ = term.recv() => bail!(Cancelled, msg("immediate shutdown due to second signal (SIGTERM)")),
        result = &mut inner => flatten(result),
    }
}

fn flatten(
    r: Result<thread::Result<Result<i32, Error>>, tokio::task::JoinError>,
) -> Result<i32, Error> {
    match r {
        Ok(Ok(r)) => r,
        Ok(Err(_)) => bail!(Internal, msg("pipeline panicked; look for previous panic message")),
        Err(e) => Err(err!(Internal, msg("unable to wait for pipeline"), source(e))),
    }
}

#[cfg(target_os = "linux")]
fn notify_systemd(state: libsystemd::daemon::NotifyState) {
    if let Err(e) = libsystemd::daemon::notify(false, &[state]) {
        warn!(err = %e, "unable to notify systemd");
    }
}

fn open_detector(config: &DetectorConfig) -> Result<Box<dyn Detector>, Error> {
    Ok(match config {
        DetectorConfig::None => {
            info!("no detector configured; events come from operator commands only");
            Box::new(NullDetector)
        }
        DetectorConfig::Replay { path } => Box::new(ReplayDetector::open(path)?),
    })
}

/// Returns true iff something can finish a recording and hand it off, warning if not.
fn recordings_can_finish(rec: &RecordingConfig, operator: bool) -> bool {
    if operator || rec.max_duration_sec.is_some() {
        return true;
    }
    warn!(
        "no operator and no recording.maxDurationSec; \
         recordings will be discarded at end of stream or shutdown rather than handed off"
    );
    false
}

/// Builds the collaborators and runs one session. Runs on a plain thread: the HTTP clients
/// block, and must be created and dropped outside any async runtime.
fn pipeline(
    config: ConfigFile,
    operator: bool,
    shutdown_rx: base::shutdown::Receiver,
) -> Result<i32, Error> {
    let clocks = clock::RealClocks {};
    let store: Arc<dyn StatusStore> = Arc::new(FileStore::open(&config.state_dir)?);

    // A new session starts with no event, whatever the last one left behind.
    store.reset()?;
    info!(dir = %config.state_dir.display(), "event status initialized");

    let pusher: Arc<dyn Pusher> = Arc::new(ExpoPusher::new(
        config.push.endpoint.clone(),
        config.push.access_token.clone(),
    )?);
    if config.push.tokens.is_empty() {
        warn!("no push tokens configured; detections won't notify anyone");
    }
    let uploader = match &config.upload {
        None => None,
        Some(u) => {
            let u = HttpUploader::new(u.base_url.clone(), u.bearer_token.clone())?;
            Some(Arc::new(u) as Arc<dyn Uploader>)
        }
    };
    let rec = &config.recording;
    std::fs::create_dir_all(&rec.dir)
        .map_err(|e| err!(e, msg("unable to create recording dir {}", rec.dir.display())))?;
    if rec.fps == 0 {
        bail!(InvalidArgument, msg("recording fps must be positive"));
    }
    recordings_can_finish(rec, operator);
    let escalation = match config.confirmation.escalate_after_sec {
        None => None,
        Some(_) if config.confirmation.secondary_tokens.is_empty() => {
            warn!("escalateAfterSec is set but there are no secondaryTokens; not escalating");
            None
        }
        Some(secs) => Some(Escalation {
            after: Duration::from_secs(secs),
            pusher: pusher.clone(),
            primary_tokens: config.push.tokens.clone(),
            secondary_tokens: config.confirmation.secondary_tokens.clone(),
        }),
    };
    let env = orchestrator::Environment {
        clocks,
        opener: &stream::OPENER,
        store: store.clone(),
        shutdown_rx: &shutdown_rx,
    };
    let cfg = orchestrator::Config {
        source: config.source.clone(),
        nms: config.nms.clone(),
        class_names: config.class_names.clone(),
        auto_confirm_score: config.confirmation.auto_confirm_score,
        max_recording: rec.max_duration_sec.map(Duration::from_secs),
    };
    let workers = orchestrator::Workers {
        pusher,
        alert: config.push.alert.clone().unwrap_or_else(Alert::detected),
        tokens: config.push.tokens.clone(),
        escalation,
        recorder: recorder::Environment {
            clocks,
            store,
            sink_opener: Arc::new(Y4mSinkOpener::new(rec.fps)),
            uploader,
            footage_path: rec.footage_path(),
            handoff_path: rec.handoff_path(),
        },
    };
    let detector = open_detector(&config.detector)?;
    let operator = if operator {
        Some(operator::start()?)
    } else {
        None
    };
    let mut o = Orchestrator::new(&env, cfg, detector, workers, operator)?;

    #[cfg(target_os = "linux")]
    notify_systemd(libsystemd::daemon::NotifyState::Ready);
    info!("ready");

    let r = o.run();

    #[cfg(target_os = "linux")]
    notify_systemd(libsystemd::daemon::NotifyState::Stopping);

    r?;
    info!("exiting");
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording(max_duration_sec: Option<u64>) -> RecordingConfig {
        RecordingConfig {
            dir: "/tmp/weaponwatch".into(),
            handoff_path: None,
            fps: 10,
            max_duration_sec,
        }
    }

    #[test]
    fn recordings_need_a_way_to_finish() {
        db::testutil::init();
        assert!(recordings_can_finish(&recording(None), true));
        assert!(recordings_can_finish(&recording(Some(60)), false));
        assert!(!recordings_can_finish(&recording(None), false));
    }
}
