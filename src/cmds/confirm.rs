// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::StateDirArgs;
use base::Error;
use bpaf::Bpaf;
use db::{Confirmation, StatusStore};
use tracing::info;

/// Confirms the current event, as a verifier would.
///
/// Safe to run alongside `weaponwatch run`; the status file is locked for the update. Exits
/// with status 1 if there's no detected event to confirm.
#[derive(Bpaf, Debug)]
#[bpaf(command("confirm"))]
pub struct Args {
    #[bpaf(external(super::state_dir_args))]
    state: StateDirArgs,
}

pub fn run(args: Args) -> Result<i32, Error> {
    let store = args.state.open_store()?;
    Ok(match store.confirm()? {
        Confirmation::Confirmed => {
            info!(path = %store.path().display(), "event confirmed");
            0
        }
        Confirmation::AlreadyConfirmed => {
            info!("event was already confirmed");
            0
        }
        Confirmation::NotDetected => {
            info!("no event detected; nothing to confirm");
            1
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::{EventStatus, FileStore};

    fn args(dir: &std::path::Path) -> Args {
        Args {
            state: StateDirArgs {
                config: "/nonexistent/weaponwatch.toml".into(),
                state_dir: Some(dir.to_owned()),
            },
        }
    }

    #[test]
    fn confirm_while_undetected_is_a_no_op() {
        db::testutil::init();
        let tmpdir = db::testutil::tempdir();
        assert_eq!(run(args(tmpdir.path())).unwrap(), 1);
        let store = FileStore::open(tmpdir.path()).unwrap();
        assert_eq!(store.read().unwrap(), EventStatus::default());
    }

    #[test]
    fn confirm_detected() {
        db::testutil::init();
        let tmpdir = db::testutil::tempdir();
        FileStore::open(tmpdir.path())
            .unwrap()
            .mark_detected()
            .unwrap();
        assert_eq!(run(args(tmpdir.path())).unwrap(), 0);
        assert_eq!(run(args(tmpdir.path())).unwrap(), 0);
        let store = FileStore::open(tmpdir.path()).unwrap();
        assert_eq!(
            store.read().unwrap(),
            EventStatus {
                detected: true,
                confirmed: true
            }
        );
    }
}
