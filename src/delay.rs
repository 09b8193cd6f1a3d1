// Copyright 2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

use rand::{thread_rng, Rng as _};

use std::time::Duration;

/// An endless delay sequence with a constant period, each step jittered
/// down to a configurable fraction of the period so that the overlay's
/// periodic traffic does not synchronize across nodes.
pub(crate) struct Periodic {
    period: Duration,
    jitter: f32,
}

impl Periodic {
    pub(crate) fn new(period: Duration) -> Self {
        Self { period, jitter: 1.0 }
    }

    pub(crate) fn with_jitter(mut self, jitter: f32) -> Self {
        assert!((0.0..=1.0).contains(&jitter));

        self.jitter = jitter;
        self
    }
}

impl Iterator for Periodic {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        let period_millis = self.period.as_millis() as u64;

        let next_millis = if self.jitter == 1.0 || period_millis == 0 {
            period_millis
        } else {
            thread_rng().gen_range(((period_millis as f32 * self.jitter) as u64)..period_millis)
        };

        Some(Duration::from_millis(next_millis))
    }
}
