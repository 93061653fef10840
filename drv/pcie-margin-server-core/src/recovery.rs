// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link-recovery interception for PHY revisions whose margining sampler
//! does not survive the link leaving its normal operating state. The
//! session is parked rather than cancelled: margining resumes from the
//! interrupted lane on the next ready interrupt, without waiting for the
//! partner to resend an unchanged command.

use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, ExecQueue, ExecuteRequest, MarginHal,
};
use ringlog::ringlog_entry_root;

use crate::state::{RecoverySnapshot, StepState};
use crate::{MarginServerCore, Trace};

impl<H: MarginHal, Q: ExecQueue> MarginServerCore<H, Q> {
    /// The link left its normal operating state mid-session. Park the
    /// rotation and take the readiness bits away from the partner until
    /// the next ready interrupt restores everything.
    ///
    /// Runs in interrupt context. A no-op on PHY revisions whose
    /// sampler rides out recovery, and when no session is active.
    pub fn handle_link_recovery(&self) {
        if !H::NEEDS_RECOVERY_INTERCEPT {
            return;
        }

        let parked = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let mask = state.scheduled_lanes();
            if mask.is_empty() {
                return None;
            }
            // A pass that is mid-iteration right now loses the
            // verify-before-publish race once its lane goes Idle.
            let Some(last_active_lane) =
                state.active_lane.or_else(|| mask.first())
            else {
                return None;
            };
            for lane in mask {
                state.set_step(lane, StepState::Idle);
            }
            state.ready = false;
            state.stopped_for_recovery = true;
            state.recovery = Some(RecoverySnapshot {
                last_active_lane,
                saved: mask,
            });
            Some(mask)
        });

        let Some(mask) = parked else { return };
        if self.hal.stop_step(mask, ErrorCounters::Preserve).is_err() {
            self.hal.report_diag(DiagCode::PhyTimeout);
        }
        self.hal.set_ready(false);
        ringlog_entry_root!(Trace::RecoveryStop(mask.raw()));
    }

    /// Second half of the intercept, run from the ready interrupt after
    /// the parked lanes have been restored to the rotation: nudge the
    /// executor back to the lane that was being margined.
    pub(crate) fn resume_session(&self, snapshot: RecoverySnapshot) {
        let lane = snapshot.last_active_lane;
        let post = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            if state.in_flight {
                // A stale request is still draining; its advance step
                // will find the restored lanes.
                false
            } else {
                state.in_flight = true;
                true
            }
        });
        ringlog_entry_root!(Trace::RecoveryResume(lane.index()));

        if post {
            if let Err(e) = self.queue.post(ExecuteRequest { lane }) {
                self.post_failed(lane, e);
                critical_section::with(|cs| {
                    self.state.borrow_ref_mut(cs).in_flight = false;
                });
            }
        }
    }
}
