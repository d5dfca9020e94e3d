// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program.
//!
//! The signal handler holds the [`Sender`]; dropping it requests shutdown.
//! Blocking code holds clones of the [`Receiver`] and checks it between units
//! of work.

use std::sync::Arc;

use crate::Mutex;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

pub struct Sender(Arc<Mutex<bool>>);

impl Drop for Sender {
    fn drop(&mut self) {
        *self.0.lock() = true;
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Mutex<bool>>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if *self.0.lock() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }
}

/// Returns a sender and receiver for graceful shutdown.
///
/// Dropping the sender will request shutdown.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Mutex::new(false));
    (Sender(inner.clone()), Receiver(inner))
}

#[cfg(test)]
mod tests {
    #[test]
    fn simple_check() {
        let (tx, rx) = super::channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn every_clone_sees_shutdown() {
        let (tx, rx) = super::channel();
        let rx2 = rx.clone();
        let h = std::thread::spawn(move || {
            while rx2.check().is_ok() {
                std::thread::yield_now();
            }
        });
        drop(tx);
        h.join().unwrap();
        rx.check().unwrap_err();
    }
}
