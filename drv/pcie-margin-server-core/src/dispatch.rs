// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Margining command dispatch: validate the control-register image the
//! link partner wrote and route it by margin type.

use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, ExecQueue, MarginCtl, MarginHal, MarginType,
    MAX_ERROR_COUNT_LIMIT, PAYLOAD_CLEAR_ERROR_LOG, PAYLOAD_GO_TO_NORMAL,
    PAYLOAD_NO_COMMAND, PAYLOAD_SET_LIMIT_MASK, RECEIVER_BROADCAST,
    RECEIVER_UPSTREAM,
};
use lanemask::{Lane, LaneMask};
use ringlog::ringlog_entry_root;

use crate::state::StepState;
use crate::{MarginServerCore, Trace};

impl<H: MarginHal, Q: ExecQueue> MarginServerCore<H, Q> {
    /// Margining command interrupt: decode and route every lane with a
    /// pending command.
    ///
    /// Runs in interrupt context.
    pub fn handle_command_irq(&self) {
        for lane in self.hal.pending_commands() {
            self.dispatch_lane(lane);
            // Acknowledged even when the command was dropped, so the
            // line deasserts.
            self.hal.ack_command(lane);
        }
    }

    fn dispatch_lane(&self, lane: Lane) {
        if !critical_section::with(|cs| self.state.borrow_ref(cs).ready) {
            // Not armed; whatever is in the register is stale.
            return;
        }

        let ctl = self.hal.margin_ctl(lane);
        ringlog_entry_root!(Trace::Command(lane.index(), ctl.into()));

        let Some(margin_type) = ctl.margin_type() else {
            self.drop_command(lane, DiagCode::BadMarginType);
            return;
        };

        if ctl.usage_model() {
            // Only the lane-margining usage model is defined.
            self.drop_command(lane, DiagCode::BadUsageModel);
            return;
        }

        // Receiver legality is type-dependent: commands margining this
        // port may broadcast or name our receiver, except type 7, which
        // must broadcast.
        let receiver = ctl.receiver_number();
        let legal = match margin_type {
            MarginType::NoCommand => receiver == RECEIVER_BROADCAST,
            _ => {
                receiver == RECEIVER_BROADCAST
                    || receiver == RECEIVER_UPSTREAM
            }
        };
        if !legal {
            self.drop_command(lane, DiagCode::BadReceiver);
            return;
        }

        match margin_type {
            MarginType::Report => self.report(lane, ctl),
            MarginType::Control => self.control(lane, ctl),
            MarginType::TimingStep | MarginType::VoltageStep => {
                self.schedule_step(lane, ctl)
            }
            MarginType::NoCommand => self.no_command(lane, ctl),
        }
    }

    pub(crate) fn drop_command(&self, lane: Lane, code: DiagCode) {
        ringlog_entry_root!(Trace::Dropped(lane.index(), code));
        self.hal.report_diag(code);
    }

    /// Echo the command into the lane's status register, substituting
    /// `payload`. One read-modify-write touching only the protocol
    /// fields; whatever shares the register with them is left alone.
    pub(crate) fn echo_status(&self, lane: Lane, ctl: MarginCtl, payload: u8) {
        self.hal.update_status(lane, |status| {
            status.set_receiver_number(ctl.receiver_number());
            status.set_margin_type(ctl.raw_margin_type());
            status.set_usage_model(ctl.usage_model());
            status.set_payload(payload);
        });
    }

    fn report(&self, lane: Lane, ctl: MarginCtl) {
        let Some(value) = self.hal.caps().report(ctl.payload()) else {
            self.drop_command(lane, DiagCode::BadPayload);
            return;
        };
        self.echo_status(lane, ctl, value);
    }

    fn control(&self, lane: Lane, ctl: MarginCtl) {
        match ctl.payload() {
            PAYLOAD_GO_TO_NORMAL => {
                self.go_to_normal(lane);
                self.echo_status(lane, ctl, PAYLOAD_GO_TO_NORMAL);
            }
            PAYLOAD_CLEAR_ERROR_LOG => {
                if self.hal.clear_error_count(lane).is_err() {
                    self.drop_command(lane, DiagCode::PhyTimeout);
                    return;
                }
                self.echo_status(lane, ctl, PAYLOAD_CLEAR_ERROR_LOG);
            }
            payload
                if payload & PAYLOAD_SET_LIMIT_MASK
                    == PAYLOAD_SET_LIMIT_MASK =>
            {
                let limit = payload & MAX_ERROR_COUNT_LIMIT;
                critical_section::with(|cs| {
                    self.state.borrow_ref_mut(cs).error_count_limit = limit;
                });
                if H::HAS_HW_ERROR_LIMIT
                    && self.hal.set_error_limit(limit).is_err()
                {
                    self.drop_command(lane, DiagCode::PhyTimeout);
                    return;
                }
                self.echo_status(lane, ctl, payload);
            }
            _ => self.drop_command(lane, DiagCode::BadPayload),
        }
    }

    /// "Go to normal settings": the lane leaves the rotation, its error
    /// log is cleared, and the limit returns to its reset value.
    fn go_to_normal(&self, lane: Lane) {
        if self
            .hal
            .stop_step(LaneMask::single(lane), ErrorCounters::Clear)
            .is_err()
        {
            // The lane must leave the rotation regardless.
            self.hal.report_diag(DiagCode::PhyTimeout);
        }
        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.set_step(lane, StepState::Idle);
            state.set_last_step(lane, None);
            state.error_count_limit = MAX_ERROR_COUNT_LIMIT;
        });
        if H::HAS_HW_ERROR_LIMIT
            && self.hal.set_error_limit(MAX_ERROR_COUNT_LIMIT).is_err()
        {
            self.hal.report_diag(DiagCode::PhyTimeout);
        }
    }

    fn no_command(&self, lane: Lane, ctl: MarginCtl) {
        if ctl.payload() != PAYLOAD_NO_COMMAND {
            self.drop_command(lane, DiagCode::BadPayload);
            return;
        }
        self.echo_status(lane, ctl, PAYLOAD_NO_COMMAND);
    }
}
