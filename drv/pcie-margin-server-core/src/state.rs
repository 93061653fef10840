// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Shared margining state, mutated from both interrupt context and the
//! cooperative task. Everything in here is only ever touched inside a
//! critical section; the types themselves carry no locking.

use drv_pcie_margin_api::{StepMargin, MAX_ERROR_COUNT_LIMIT};
use lanemask::{Lane, LaneMask, MAX_LANES};

/// Where a lane stands in the step-margining rotation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StepState {
    /// No session requested.
    Idle,
    /// A session is pending; the executor will get to this lane.
    Scheduled,
    /// The executor is running this lane's iteration right now.
    Executing,
}

/// A session parked by the link-recovery intercept, to be restored on
/// the next ready interrupt.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RecoverySnapshot {
    pub last_active_lane: Lane,
    pub saved: LaneMask,
}

pub(crate) struct MarginState {
    /// Readiness state as last told to the link partner.
    pub ready: bool,
    /// True while an execute request is outstanding in the task queue or
    /// the executor is mid-iteration. The single-flight guard: at most
    /// one request exists while this is set, none while it is clear.
    pub in_flight: bool,
    /// Error threshold, compared in software on PHY revisions without
    /// the hardware compare.
    pub error_count_limit: u8,
    /// True between a link-recovery intercept and the re-arm that
    /// consumes `recovery`.
    pub stopped_for_recovery: bool,
    pub recovery: Option<RecoverySnapshot>,
    /// The lane the executor most recently worked on; seeds the recovery
    /// snapshot's resume target.
    pub active_lane: Option<Lane>,
    steps: [StepState; MAX_LANES],
    last_step: [Option<StepMargin>; MAX_LANES],
}

impl MarginState {
    pub fn new() -> Self {
        Self {
            ready: false,
            in_flight: false,
            error_count_limit: MAX_ERROR_COUNT_LIMIT,
            stopped_for_recovery: false,
            recovery: None,
            active_lane: None,
            steps: [StepState::Idle; MAX_LANES],
            last_step: [None; MAX_LANES],
        }
    }

    /// Returns all lane and session state to its armed-and-empty shape.
    ///
    /// `in_flight` deliberately survives: it tracks whether an execute
    /// request is outstanding in the queue, and resetting lane state does
    /// not drain the queue. A stale request finds its lane Idle, retires,
    /// and drops the flag itself.
    pub fn reset(&mut self) {
        self.error_count_limit = MAX_ERROR_COUNT_LIMIT;
        self.stopped_for_recovery = false;
        self.recovery = None;
        self.active_lane = None;
        self.steps = [StepState::Idle; MAX_LANES];
        self.last_step = [None; MAX_LANES];
    }

    pub fn step(&self, lane: Lane) -> StepState {
        self.steps[usize::from(lane.index())]
    }

    pub fn set_step(&mut self, lane: Lane, state: StepState) {
        self.steps[usize::from(lane.index())] = state;
    }

    pub fn last_step(&self, lane: Lane) -> Option<StepMargin> {
        self.last_step[usize::from(lane.index())]
    }

    pub fn set_last_step(&mut self, lane: Lane, step: Option<StepMargin>) {
        self.last_step[usize::from(lane.index())] = step;
    }

    /// Lanes with a pending or active session.
    pub fn scheduled_lanes(&self) -> LaneMask {
        self.steps
            .iter()
            .enumerate()
            .filter(|(_, step)| !matches!(step, StepState::Idle))
            .filter_map(|(index, _)| Lane::new(index as u8))
            .collect()
    }

    /// Next lane in the rotation, cyclically after `lane`.
    pub fn next_scheduled_after(&self, lane: Lane) -> Option<Lane> {
        self.scheduled_lanes().next_after(lane)
    }
}
