// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::StateDirArgs;
use base::Error;
use bpaf::Bpaf;
use db::StatusStore;
use tracing::info;

/// Closes the current event, clearing both the detected and confirmed flags.
///
/// A running pipeline then treats the next detection as a new event. Recording already in
/// progress isn't affected.
#[derive(Bpaf, Debug)]
#[bpaf(command("reset"))]
pub struct Args {
    #[bpaf(external(super::state_dir_args))]
    state: StateDirArgs,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let store = args.state.open_store()?;
    let (old, _) = store.update(&mut |s: &mut db::EventStatus| *s = Default::default())?;
    info!(
        detected = old.detected,
        confirmed = old.confirmed,
        "event closed"
    );
    Ok(0)
}
