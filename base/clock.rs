// This file is part of weaponwatch, a weapon detection and alerting pipeline.
// Copyright (C) 2024 The weaponwatch Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Clock interface and implementations for testability.

use std::ops::{Add, Sub};
use std::sync::{mpsc, Arc};
use std::thread;

pub use std::time::Duration;

use crate::Mutex;
use tracing::warn;

/// A reading of a monotonic clock, as time elapsed since some unspecified start point.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Instant(pub Duration);

impl Sub for Instant {
    type Output = Duration;

    /// Returns the elapsed time, saturating at zero if `rhs` is later.
    fn sub(self, rhs: Instant) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}

/// Abstract interface to the system clocks. This is for testability.
pub trait Clocks: Send + Sync + 'static {
    /// Gets the current wall time.
    fn realtime(&self) -> jiff::Timestamp;

    /// Gets the current time from a monotonic clock.
    ///
    /// On Linux, this uses `CLOCK_BOOTTIME`, which includes suspended time.
    /// On other systems, it uses `CLOCK_MONOTONIC`.
    fn monotonic(&self) -> Instant;

    /// Causes the current thread to sleep for the specified time.
    fn sleep(&self, how_long: Duration);

    /// Calls `rcv.recv_timeout` or substitutes a test implementation.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError>;
}

#[derive(Copy, Clone, Debug, Default)]
pub struct RealClocks {}

impl RealClocks {
    fn get(&self, clock: nix::time::ClockId) -> Instant {
        let ts = nix::time::clock_gettime(clock).expect("clock_gettime is infallible");

        // On 32-bit arm builds, `tv_sec` is an `i32` and requires conversion.
        // On other platforms, the `.into()` is a no-op.
        #[allow(clippy::useless_conversion)]
        let secs: i64 = ts.tv_sec().into();
        Instant(Duration::new(
            u64::try_from(secs).unwrap_or(0),
            u32::try_from(ts.tv_nsec()).unwrap_or(0),
        ))
    }
}

impl Clocks for RealClocks {
    fn realtime(&self) -> jiff::Timestamp {
        jiff::Timestamp::now()
    }

    #[cfg(target_os = "linux")]
    fn monotonic(&self) -> Instant {
        self.get(nix::time::ClockId::CLOCK_BOOTTIME)
    }

    #[cfg(not(target_os = "linux"))]
    fn monotonic(&self) -> Instant {
        self.get(nix::time::ClockId::CLOCK_MONOTONIC)
    }

    fn sleep(&self, how_long: Duration) {
        thread::sleep(how_long)
    }

    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        rcv.recv_timeout(timeout)
    }
}

/// Logs a warning if the TimerGuard lives "too long", using the label created by a supplied
/// function.
pub struct TimerGuard<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> {
    clocks: &'a C,
    label_f: Option<F>,
    start: Instant,
}

impl<'a, C: Clocks + ?Sized, S: AsRef<str>, F: FnOnce() -> S + 'a> TimerGuard<'a, C, S, F> {
    pub fn new(clocks: &'a C, label_f: F) -> Self {
        TimerGuard {
            clocks,
            label_f: Some(label_f),
            start: clocks.monotonic(),
        }
    }
}

impl<'a, C, S, F> Drop for TimerGuard<'a, C, S, F>
where
    C: Clocks + ?Sized,
    S: AsRef<str>,
    F: FnOnce() -> S + 'a,
{
    fn drop(&mut self) {
        let elapsed = self.clocks.monotonic() - self.start;
        if elapsed.as_secs() >= 1 {
            if let Some(label_f) = self.label_f.take() {
                warn!("{} took {:?}!", label_f().as_ref(), elapsed);
            }
        }
    }
}

/// Simulated clock for testing.
#[derive(Clone)]
pub struct SimulatedClocks(Arc<SimulatedClocksInner>);

struct SimulatedClocksInner {
    boot: jiff::Timestamp,
    uptime: Mutex<Duration>,
}

impl SimulatedClocks {
    pub fn new(boot: jiff::Timestamp) -> Self {
        SimulatedClocks(Arc::new(SimulatedClocksInner {
            boot,
            uptime: Mutex::new(Duration::ZERO),
        }))
    }
}

impl Clocks for SimulatedClocks {
    fn realtime(&self) -> jiff::Timestamp {
        let uptime = jiff::SignedDuration::try_from(*self.0.uptime.lock())
            .expect("simulated uptime fits in a SignedDuration");
        self.0.boot + uptime
    }

    fn monotonic(&self) -> Instant {
        Instant(*self.0.uptime.lock())
    }

    /// Advances the clock by the specified amount without actually sleeping.
    fn sleep(&self, how_long: Duration) {
        let mut l = self.0.uptime.lock();
        *l += how_long;
    }

    /// Advances the clock by the specified amount if data is not immediately available.
    fn recv_timeout<T>(
        &self,
        rcv: &mpsc::Receiver<T>,
        timeout: Duration,
    ) -> Result<T, mpsc::RecvTimeoutError> {
        let r = rcv.recv_timeout(Duration::ZERO);
        if r.is_err() {
            self.sleep(timeout);
        }
        r
    }
}
