// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Operator commands typed on the console while the pipeline runs.

use base::Error;
use std::io::BufRead;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Stop the session.
    Quit,

    /// Act as if a weapon were detected in the current frame.
    ForceNotify,

    /// Start recording without waiting for confirmation.
    ForceRecord,

    /// Confirm the current event.
    Confirm,

    /// Finish the current recording and hand it off.
    Finish,
}

impl OperatorCommand {
    pub fn parse(line: &str) -> Option<Self> {
        Some(match line.trim() {
            "q" | "quit" => OperatorCommand::Quit,
            "n" | "notify" => OperatorCommand::ForceNotify,
            "r" | "record" => OperatorCommand::ForceRecord,
            "c" | "confirm" => OperatorCommand::Confirm,
            "f" | "finish" => OperatorCommand::Finish,
            _ => return None,
        })
    }
}

const HELP: &str = "commands: q(uit) n(otify) r(ecord) c(onfirm) f(inish)";

/// Reads commands from `input` until EOF, a read error, or the receiver going away.
fn read_commands<R: BufRead>(input: R, snd: &mpsc::Sender<OperatorCommand>) {
    for line in input.lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                warn!(err = %e, "unable to read operator input");
                return;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(cmd) = OperatorCommand::parse(&line) else {
            info!("unknown command {:?}; {HELP}", line.trim());
            continue;
        };
        debug!(?cmd, "operator command");
        if snd.send(cmd).is_err() {
            return;
        }
    }
    debug!("operator input closed");
}

/// Starts the `operator` thread reading standard input.
///
/// The thread isn't joined: it may be blocked reading the terminal when the session ends.
pub fn start() -> Result<mpsc::Receiver<OperatorCommand>, Error> {
    let (snd, rcv) = mpsc::channel();
    info!("{HELP}");
    thread::Builder::new()
        .name("operator".to_owned())
        .spawn(move || read_commands(std::io::stdin().lock(), &snd))?;
    Ok(rcv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        assert_eq!(OperatorCommand::parse("q\n"), Some(OperatorCommand::Quit));
        assert_eq!(OperatorCommand::parse(" n "), Some(OperatorCommand::ForceNotify));
        assert_eq!(OperatorCommand::parse("record"), Some(OperatorCommand::ForceRecord));
        assert_eq!(OperatorCommand::parse("x"), None);
    }

    #[test]
    fn reads_until_eof() {
        db::testutil::init();
        let (snd, rcv) = mpsc::channel();
        read_commands(&b"n\n\nbogus\nc\nf\nq\n"[..], &snd);
        drop(snd);
        let got: Vec<_> = rcv.iter().collect();
        assert_eq!(
            got,
            [
                OperatorCommand::ForceNotify,
                OperatorCommand::Confirm,
                OperatorCommand::Finish,
                OperatorCommand::Quit
            ]
        );
    }
}
