// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::Error;
use bpaf::{Bpaf, Parser};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

mod cmds;
mod confirmer;
mod control;
mod detect;
mod nms;
mod notifier;
mod operator;
mod orchestrator;
mod push;
mod recorder;
mod stream;
mod upload;

const DEFAULT_CONFIG_PATH: &str = "/etc/weaponwatch.toml";
const DEFAULT_STATE_DIR: &str = "/var/lib/weaponwatch";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// weaponwatch: weapon detection, verification, and recording.
#[derive(Bpaf, Debug)]
#[bpaf(options, version(VERSION))]
enum Args {
    // See docstrings of `cmds::*::Args` structs for a description of the respective subcommands.
    Confirm(#[bpaf(external(cmds::confirm::args))] cmds::confirm::Args),
    Reset(#[bpaf(external(cmds::reset::args))] cmds::reset::Args),
    Run(#[bpaf(external(cmds::run::args))] cmds::run::Args),
    Status(#[bpaf(external(cmds::status::args))] cmds::status::Args),
}

impl Args {
    fn run(self) -> Result<i32, Error> {
        match self {
            Args::Confirm(a) => cmds::confirm::run(a),
            Args::Reset(a) => cmds::reset::run(a),
            Args::Run(a) => cmds::run::run(a),
            Args::Status(a) => cmds::status::run(a),
        }
    }
}

fn parse_config_path() -> impl Parser<PathBuf> {
    bpaf::long("config")
        .help("Path to the TOML configuration file.")
        .argument::<PathBuf>("PATH")
        .fallback(DEFAULT_CONFIG_PATH.into())
        .debug_fallback()
}

fn main() {
    // If using the clock will fail, find out now *before* trying to log
    // anything (with timestamps...) so we can print a helpful error.
    if let Err(e) = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC) {
        eprintln!(
            "clock_gettime failed: {e}\n\n\
             This indicates a broken environment."
        );
        std::process::exit(1);
    }

    base::tracing_setup::install();

    // Get the program name from the OS (e.g. if invoked as `target/debug/ww`: `ww`),
    // falling back to the crate name if conversion to a path/UTF-8 string fails.
    let progname = std::env::args_os().next().map(PathBuf::from);
    let progname = progname
        .as_deref()
        .and_then(Path::file_name)
        .and_then(OsStr::to_str)
        .unwrap_or(env!("CARGO_PKG_NAME"));

    let args = match args()
        .fallback_to_usage()
        .run_inner(bpaf::Args::current_args().set_name(progname))
    {
        Ok(a) => a,
        Err(e) => std::process::exit(e.exit_code()),
    };
    tracing::trace!("Parsed command-line arguments: {args:#?}");

    match args.run() {
        Err(e) => {
            error!(err = %e.chain(), "exiting due to error");
            ::std::process::exit(1);
        }
        Ok(rv) => {
            debug!("exiting with status {}", rv);
            std::process::exit(rv)
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    fn bpaf_invariants() {
        super::args().check_invariants(false);
    }

    #[test]
    fn parses_subcommands() {
        let a = super::args()
            .run_inner(&["confirm", "--state-dir", "/tmp/ww"][..])
            .unwrap();
        assert!(matches!(a, super::Args::Confirm(_)));
        let a = super::args()
            .run_inner(&["run", "--config", "/tmp/ww.toml", "--no-operator"][..])
            .unwrap();
        assert!(matches!(a, super::Args::Run(_)));
    }
}
