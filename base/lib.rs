// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

pub mod clock;
mod error;
pub mod shutdown;
pub mod tracing_setup;

pub use crate::error::{Chain, Error, ErrorKind};

#[doc(hidden)]
pub use crate::error::Wrap;

use std::sync::MutexGuard;

/// A `std::sync::Mutex` which treats poisoning as fatal.
///
/// A panic while holding one of these means the protected state can't be
/// trusted; every thread touching it should go down too.
#[derive(Debug, Default)]
pub struct Mutex<T>(std::sync::Mutex<T>);

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Mutex(std::sync::Mutex::new(value))
    }

    #[track_caller]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock().expect("not poisoned")
    }
}
