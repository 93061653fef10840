// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The step-margining scheduler and executor.
//!
//! Scheduling happens in interrupt context when a type-3/4 command
//! arrives; execution happens on the cooperative task, one queued
//! request at a time. The single-flight rule -- at most one execute
//! request outstanding, ever -- is what `in_flight` enforces: whoever
//! sets it posts the request, whoever clears it has proven the rotation
//! is empty.

use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, ExecQueue, ExecuteRequest, MarginCtl,
    MarginError, MarginHal, MarginType, StepKind, StepMargin, StepStatus,
    MAX_ERROR_COUNT_LIMIT,
};
use lanemask::{Lane, LaneMask};
use ringlog::ringlog_entry_root;

use crate::state::StepState;
use crate::{MarginServerCore, Trace};

impl<H: MarginHal, Q: ExecQueue> MarginServerCore<H, Q> {
    /// A validated type-3/4 command for `lane`: put the lane in the
    /// rotation and make sure an executor pass is coming.
    ///
    /// Runs in interrupt context.
    pub(crate) fn schedule_step(&self, lane: Lane, ctl: MarginCtl) {
        // The partner polls set-up-in-progress until the executor gets
        // to this lane.
        self.echo_status(lane, ctl, StepStatus::SetUp.payload(0));

        let post = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.step(lane) == StepState::Idle {
                state.set_step(lane, StepState::Scheduled);
            }
            if state.in_flight {
                false
            } else {
                state.in_flight = true;
                true
            }
        });
        ringlog_entry_root!(Trace::Scheduled(lane.index()));

        if post {
            // Only the lane travels; the payload is re-read at execution
            // time since the partner may rewrite it first. The post runs
            // with interrupts live.
            if let Err(e) = self.queue.post(ExecuteRequest { lane }) {
                self.post_failed(lane, e);
                critical_section::with(|cs| {
                    self.state.borrow_ref_mut(cs).in_flight = false;
                });
            }
        }
    }

    /// One executor pass, invoked by the cooperative task per request
    /// drained from the queue.
    pub fn execute(&self, req: ExecuteRequest) {
        let lane = req.lane;
        ringlog_entry_root!(Trace::Execute(lane.index()));

        let live = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.step(lane) == StepState::Scheduled {
                state.set_step(lane, StepState::Executing);
                state.active_lane = Some(lane);
                true
            } else {
                // The session was torn down (abort, error limit, normal
                // settings, or recovery) after this request was queued;
                // the request just retires.
                false
            }
        });

        if live {
            self.margin_iteration(lane);
        }
        self.advance(lane);
    }

    fn margin_iteration(&self, lane: Lane) {
        // Re-read the command register; what is in it now is what we
        // execute, not what was there at scheduling time.
        let ctl = self.hal.margin_ctl(lane);
        let kind = match ctl.margin_type() {
            Some(MarginType::TimingStep) => StepKind::Timing,
            Some(MarginType::VoltageStep) => StepKind::Voltage,
            // No longer a step command; its replacement dispatches on
            // its own interrupt.
            _ => return,
        };
        let step = match StepMargin::decode(kind, ctl.payload()) {
            Ok(step) => step,
            Err(_) => {
                self.hal.report_diag(DiagCode::OffsetOutOfRange);
                return;
            }
        };

        // Reprogramming the sampler is the expensive part; skip it when
        // the partner re-issued the offset we already have in hardware.
        let redundant = critical_section::with(|cs| {
            self.state.borrow_ref(cs).last_step(lane) == Some(step)
        });
        if !redundant && self.hal.start_step(lane, step).is_err() {
            self.hal.report_diag(DiagCode::PhyTimeout);
            return;
        }

        let count = match self.hal.error_count(lane) {
            Ok(count) => count,
            Err(_) => {
                self.hal.report_diag(DiagCode::PhyTimeout);
                return;
            }
        };
        let limit = critical_section::with(|cs| {
            self.state.borrow_ref(cs).error_count_limit
        });
        if count > limit {
            self.error_limit_exceeded(lane);
            return;
        }

        // Verify before publish: an abort, error-limit, or control
        // command may have raced in from interrupt context since the
        // re-read above. Interrupt context wins; publish only if the
        // lane is still ours and the command is the one we executed.
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let unchanged = self.hal.margin_ctl(lane) == ctl;
            if state.step(lane) == StepState::Executing && unchanged {
                self.hal.update_status(lane, |status| {
                    status
                        .set_payload(StepStatus::InProgress.payload(count));
                });
                state.set_last_step(lane, Some(step));
                ringlog_entry_root!(Trace::Published(lane.index(), count));
            } else {
                state.set_last_step(lane, None);
                ringlog_entry_root!(Trace::Suppressed(lane.index()));
            }
        });
    }

    /// Keep the rotation going after a pass for `after`: post the next
    /// scheduled lane's request, or retire the session.
    fn advance(&self, after: Lane) {
        let mut retried = false;
        loop {
            let next = critical_section::with(|cs| {
                let mut state = self.state.borrow_ref_mut(cs);
                if state.step(after) == StepState::Executing {
                    // Still in the rotation; a lane is margined until
                    // the partner says otherwise.
                    state.set_step(after, StepState::Scheduled);
                }
                state.next_scheduled_after(after)
            });

            let Some(lane) = next else {
                // Rotation is empty. Drop the in-flight claim -- but a
                // command interrupt may have scheduled a lane between
                // the check above and here, seen in_flight still set,
                // and not posted. Look again once with the claim
                // released.
                let rearmed = critical_section::with(|cs| {
                    let mut state = self.state.borrow_ref_mut(cs);
                    state.in_flight = false;
                    if !retried && !state.scheduled_lanes().is_empty() {
                        state.in_flight = true;
                        true
                    } else {
                        false
                    }
                });
                if rearmed {
                    retried = true;
                    continue;
                }
                ringlog_entry_root!(Trace::SessionIdle);
                return;
            };

            match self.queue.post(ExecuteRequest { lane }) {
                Ok(()) => return,
                Err(e) => {
                    self.post_failed(lane, e);
                    if retried {
                        critical_section::with(|cs| {
                            self.state.borrow_ref_mut(cs).in_flight = false;
                        });
                        return;
                    }
                    retried = true;
                }
            }
        }
    }

    /// Error-limit-exceeded interrupt, raised by PHY revisions with the
    /// hardware compare.
    ///
    /// Runs in interrupt context.
    pub fn handle_error_excess_irq(&self) {
        for lane in self.hal.pending_error_excess() {
            self.error_limit_exceeded(lane);
            self.hal.ack_error_excess(lane);
        }
    }

    /// A lane blew through the error limit: stop it, tell the partner,
    /// and take it out of the rotation. The counter keeps its value so
    /// the excess stays observable until the partner clears the log.
    pub(crate) fn error_limit_exceeded(&self, lane: Lane) {
        if self
            .hal
            .stop_step(LaneMask::single(lane), ErrorCounters::Preserve)
            .is_err()
        {
            self.hal.report_diag(DiagCode::PhyTimeout);
        }
        let count = self
            .hal
            .error_count(lane)
            .unwrap_or(MAX_ERROR_COUNT_LIMIT);
        self.hal.update_status(lane, |status| {
            status.set_payload(StepStatus::TooManyErrors.payload(count));
        });
        if self.hal.set_error_counting(lane, false).is_err() {
            self.hal.report_diag(DiagCode::PhyTimeout);
        }
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.set_step(lane, StepState::Idle);
            state.set_last_step(lane, None);
        });
        ringlog_entry_root!(Trace::ErrorLimit(lane.index(), count));
    }

    pub(crate) fn post_failed(&self, lane: Lane, e: MarginError) {
        ringlog_entry_root!(Trace::PostFailed(lane.index(), e));
        self.hal.report_diag(match e {
            MarginError::QueueTimeout => DiagCode::ExecQueueTimeout,
            _ => DiagCode::ExecQueueFull,
        });
    }
}
