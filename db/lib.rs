// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! weaponwatch's persistence layer.
//!
//! This holds the two things which outlive a single frame: the shared event
//! status record, which several workers (and possibly several processes)
//! read-modify-write, and the footage files written while an event is being
//! recorded.

pub mod frame;
mod fs;
pub mod sink;
pub mod status;
pub mod y4m;

// This is only for #[cfg(test)], but it's also used by the dependent crate, and it appears that
// #[cfg(test)] is not passed on to dependencies.
pub mod testutil;

pub use crate::frame::{Dimensions, Frame};
pub use crate::fs::copy_into_place;
pub use crate::status::{Confirmation, EventStatus, FileStore, MemoryStore, StatusStore};
