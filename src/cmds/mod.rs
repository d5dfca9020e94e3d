// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

use base::{err, Error};
use bpaf::Bpaf;
use db::FileStore;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tracing::debug;

pub mod confirm;
pub mod reset;
pub mod run;
pub mod status;

/// Reads and parses a TOML configuration file.
fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T, Error> {
    let config = std::fs::read_to_string(path)
        .map_err(|e| err!(e, msg("unable to read {}", path.display())))?;
    toml::from_str(&config).map_err(|e| {
        err!(
            InvalidArgument,
            msg("unable to parse {}", path.display()),
            source(e)
        )
    })
}

/// Arguments shared by the commands which only touch the event status file.
#[derive(Bpaf, Debug, PartialEq, Eq)]
pub struct StateDirArgs {
    #[bpaf(external(crate::parse_config_path))]
    config: PathBuf,

    /// Directory holding the event status file.
    ///
    /// Overrides the config file's `stateDir`; with this, the config file isn't read.
    #[bpaf(argument("PATH"))]
    state_dir: Option<PathBuf>,
}

impl StateDirArgs {
    fn resolve(&self) -> Result<PathBuf, Error> {
        if let Some(d) = &self.state_dir {
            return Ok(d.clone());
        }
        let config: run::config::ConfigFile = read_config(&self.config)?;
        debug!(config = %self.config.display(), "using stateDir from config");
        Ok(config.state_dir)
    }

    /// Opens the status file, which a running pipeline may share.
    fn open_store(&self) -> Result<FileStore, Error> {
        let dir = self.resolve()?;
        FileStore::open(&dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_config_errors() {
        db::testutil::init();
        let tmpdir = db::testutil::tempdir();
        let missing = tmpdir.path().join("missing.toml");
        let e = read_config::<run::config::ConfigFile>(&missing).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::NotFound);
        assert!(e.to_string().contains("unable to read"), "{e}");

        let bad = tmpdir.path().join("bad.toml");
        std::fs::write(&bad, "source = 12\n").unwrap();
        let e = read_config::<run::config::ConfigFile>(&bad).unwrap_err();
        assert_eq!(e.kind(), base::ErrorKind::InvalidArgument);
    }

    #[test]
    fn state_dir_override_skips_config() {
        let args = StateDirArgs {
            config: "/nonexistent/weaponwatch.toml".into(),
            state_dir: Some("/tmp/state".into()),
        };
        assert_eq!(args.resolve().unwrap(), PathBuf::from("/tmp/state"));
    }

    #[test]
    fn state_dir_from_config() {
        db::testutil::init();
        let tmpdir = db::testutil::tempdir();
        let path = tmpdir.path().join("weaponwatch.toml");
        std::fs::write(
            &path,
            "stateDir = \"/srv/ww\"\nsource = \"file:///tmp/in.y4m\"\n[recording]\ndir = \"/tmp\"\n",
        )
        .unwrap();
        let args = StateDirArgs {
            config: path,
            state_dir: None,
        };
        assert_eq!(args.resolve().unwrap(), PathBuf::from("/srv/ww"));
    }
}
