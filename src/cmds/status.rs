// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use super::StateDirArgs;
use base::{err, Error};
use bpaf::Bpaf;
use db::StatusStore;

/// Prints the event status document.
#[derive(Bpaf, Debug)]
#[bpaf(command("status"))]
pub struct Args {
    #[bpaf(external(super::state_dir_args))]
    state: StateDirArgs,
}

pub fn run(args: Args) -> Result<i32, Error> {
    println!("{}", document(&args.state.open_store()?)?);
    Ok(0)
}

/// Renders the current status as pretty-printed JSON.
fn document(store: &dyn StatusStore) -> Result<String, Error> {
    let status = store.read()?;
    serde_json::to_string_pretty(&status)
        .map_err(|e| err!(Internal, msg("unable to serialize status"), source(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::FileStore;

    #[test]
    fn document_tracks_store() {
        db::testutil::init();
        let tmpdir = db::testutil::tempdir();
        let store = FileStore::open(tmpdir.path()).unwrap();
        let doc: serde_json::Value = serde_json::from_str(&document(&store).unwrap()).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({"detected": false, "confirmed": false})
        );

        store.mark_detected().unwrap();
        store.confirm().unwrap();
        let doc: serde_json::Value = serde_json::from_str(&document(&store).unwrap()).unwrap();
        assert_eq!(doc, serde_json::json!({"detected": true, "confirmed": true}));
    }

    #[test]
    fn run_against_state_dir() {
        db::testutil::init();
        let tmpdir = db::testutil::tempdir();
        let state = tmpdir.path().join("state");
        let args = Args {
            state: StateDirArgs {
                config: "/nonexistent/weaponwatch.toml".into(),
                state_dir: Some(state.clone()),
            },
        };
        assert_eq!(run(args).unwrap(), 0);
        assert!(state.join(db::status::STATUS_FILENAME).exists());
    }
}
