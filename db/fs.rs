// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Filesystem utilities.

use base::{err, Error};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::NixPath;
use std::io::Write;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

/// Converts a `nix` error into an [`Error`] with the matching kind.
pub(crate) fn nix_err(e: nix::Error, msg: String) -> Error {
    Error::new(std::io::Error::from(e).kind().into())
        .with_msg(msg)
        .with_source(e)
}

/// Opens the given `path` within `dirfd` with the specified flags.
pub fn openat<P: ?Sized + NixPath>(
    dirfd: RawFd,
    path: &P,
    oflag: OFlag,
    mode: Mode,
) -> Result<std::fs::File, nix::Error> {
    let fd = nix::fcntl::openat(dirfd, path, oflag, mode)?;
    Ok(unsafe { std::fs::File::from_raw_fd(fd) })
}

/// A file descriptor associated with a directory.
#[derive(Debug)]
pub struct Dir(pub RawFd);

impl Drop for Dir {
    fn drop(&mut self) {
        if let Err(err) = nix::unistd::close(self.0) {
            tracing::warn!(%err, "unable to close directory");
        }
    }
}

impl Dir {
    /// Opens the given path as a directory, optionally creating it first.
    pub fn open<P: ?Sized + NixPath>(path: &P, mkdir: bool) -> Result<Dir, nix::Error> {
        if mkdir {
            match nix::unistd::mkdir(path, Mode::S_IRWXU | Mode::S_IRGRP | Mode::S_IXGRP) {
                Ok(()) | Err(nix::Error::EEXIST) => {}
                Err(e) => return Err(e),
            }
        }
        let fd = nix::fcntl::open(
            path,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(Dir(fd))
    }

    pub fn rename<P1: ?Sized + NixPath, P2: ?Sized + NixPath>(
        &self,
        from: &P1,
        to: &P2,
    ) -> Result<(), nix::Error> {
        nix::fcntl::renameat(Some(self.0), from, Some(self.0), to)
    }

    /// Syncs the directory itself, making renames and creations within it durable.
    pub fn sync(&self) -> Result<(), nix::Error> {
        nix::unistd::fsync(self.0)
    }

    /// Atomically replaces `name` within this directory with `data`.
    ///
    /// Writes to `tmp_name` first, syncs it, renames it over `name`, then syncs the directory.
    /// Concurrent readers see either the old contents or the new, never a mix.
    pub fn replace_file(&self, name: &str, tmp_name: &str, data: &[u8]) -> Result<(), Error> {
        let mut f = openat(
            self.0,
            tmp_name,
            OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
            Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
        )
        .map_err(|e| nix_err(e, format!("unable to open {tmp_name}")))?;
        f.write_all(data)
            .map_err(|e| Error::from(e).with_msg(format!("unable to write {tmp_name}")))?;
        f.sync_all()
            .map_err(|e| Error::from(e).with_msg(format!("unable to sync {tmp_name}")))?;
        drop(f);
        self.rename(tmp_name, name)
            .map_err(|e| nix_err(e, format!("unable to rename {tmp_name} to {name}")))?;
        self.sync()
            .map_err(|e| nix_err(e, "unable to sync dir".to_owned()))
    }
}

/// Durably copies `src` to `dst`, replacing any existing file.
///
/// The data goes to a `.tmp` sibling of `dst` which is synced and renamed into place, so readers
/// of `dst` never see a partial copy. Returns the number of bytes copied.
pub fn copy_into_place(src: &Path, dst: &Path) -> Result<u64, Error> {
    let name = dst
        .file_name()
        .ok_or_else(|| err!(InvalidArgument, msg("{} has no file name", dst.display())))?;
    let parent = match dst.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp_name = name.to_owned();
    tmp_name.push(".tmp");
    let dir = Dir::open(parent, false)
        .map_err(|e| nix_err(e, format!("unable to open {}", parent.display())))?;
    let mut from = std::fs::File::open(src)
        .map_err(|e| err!(e, msg("unable to open {}", src.display())))?;
    let mut to = openat(
        dir.0,
        tmp_name.as_os_str(),
        OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC | OFlag::O_CLOEXEC,
        Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IROTH,
    )
    .map_err(|e| nix_err(e, format!("unable to create {tmp_name:?}")))?;
    let len = std::io::copy(&mut from, &mut to)
        .map_err(|e| err!(e, msg("unable to copy {} to {tmp_name:?}", src.display())))?;
    to.sync_all()
        .map_err(|e| err!(e, msg("unable to sync {tmp_name:?}")))?;
    drop(to);
    dir.rename(tmp_name.as_os_str(), name)
        .map_err(|e| nix_err(e, format!("unable to rename {tmp_name:?} to {}", dst.display())))?;
    dir.sync()
        .map_err(|e| nix_err(e, format!("unable to sync {}", parent.display())))?;
    Ok(len)
}
