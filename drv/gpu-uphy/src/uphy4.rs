// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Margining driver for UPHY revision 4, the oldest supported PHY.
//!
//! All sixteen lanes share one pending-command register and one lane-
//! select register; per-lane PHY state is reached through an indirect
//! address/data pair that applies to whichever lanes are selected. The
//! revision has no hardware error-limit compare (the engine tracks the
//! limit in software) and its margining sampler does not survive link
//! recovery, so sessions on this PHY get parked and resumed around
//! recovery events.

use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, MarginCaps, MarginCtl, MarginError, MarginHal,
    MarginStatus, StepKind, StepMargin, caps,
};
use lanemask::{Lane, LaneMask};

use crate::{poll_clear, PhyRw};

mod regs {
    // Interrupt and readiness block.
    pub const MARGIN_INTR: u32 = 0x0010; // pending command per lane, W1C
    pub const MARGIN_READY: u32 = 0x0014;
    pub const FUSE_MARGIN: u32 = 0x0018;
    pub const DIAG_SCRATCH: u32 = 0x001c;

    pub const READY_BITS: u32 = 0b11; // MARGIN_READY | MARGIN_SW_READY
    pub const FUSE_BIT: u32 = 1 << 0;

    // Per-lane margining command/status images, one word per lane. Only
    // the low half carries protocol fields.
    pub const MARGIN_CTL_BASE: u32 = 0x0100; // stride 4
    pub const MARGIN_STAT_BASE: u32 = 0x0180; // stride 4

    // Indirect PHY access. A write to PHY_ADDR starts the transaction;
    // BUSY reads set until the PHY has serviced it.
    pub const LANE_SELECT: u32 = 0x0200;
    pub const PHY_ADDR: u32 = 0x0204; // [15:0] register, plus flags below
    pub const PHY_DATA: u32 = 0x0208;

    pub const PHY_WRITE: u32 = 1 << 30;
    pub const PHY_BUSY: u32 = 1 << 31;

    // PHY register file, reached indirectly, per selected lane.
    pub const RX_MARGIN_CTL: u32 = 0x0042;
    pub const RX_MARGIN_ERR: u32 = 0x0043;

    // RX_MARGIN_CTL fields.
    pub const MARGIN_EN: u32 = 1 << 0;
    pub const ERR_COUNT_EN: u32 = 1 << 1;
    pub const MARGIN_VOLTAGE: u32 = 1 << 2; // clear selects timing
    pub const TIMING_OFF_SHIFT: u32 = 4; // [9:4], two's complement
    pub const TIMING_OFF_MASK: u32 = 0x3f << TIMING_OFF_SHIFT;
    pub const VOLTAGE_OFF_SHIFT: u32 = 10; // [16:10], two's complement
    pub const VOLTAGE_OFF_MASK: u32 = 0x7f << VOLTAGE_OFF_SHIFT;

    // RX_MARGIN_ERR fields.
    pub const ERR_COUNT_MASK: u32 = 0xff;
}

static CAPS: MarginCaps = MarginCaps {
    control: caps::VOLTAGE_SUPPORTED
        | caps::IND_UP_DOWN_VOLTAGE
        | caps::IND_LEFT_RIGHT_TIMING,
    num_voltage_steps: 64,
    num_timing_steps: 16,
    max_timing_offset: 25,
    max_voltage_offset: 12,
    sampling_rate_voltage: 63,
    sampling_rate_timing: 63,
    sample_count: 0x34,
    max_lanes: 15,
};

pub struct Uphy4<P> {
    phy: P,
}

impl<P: PhyRw> Uphy4<P> {
    pub fn new(phy: P) -> Self {
        Self { phy }
    }

    fn select(&self, lanes: LaneMask) {
        self.phy.write(regs::LANE_SELECT, u32::from(lanes.raw()));
    }

    fn phy_read(&self, reg: u32) -> Result<u32, MarginError> {
        self.phy.write(regs::PHY_ADDR, reg);
        poll_clear(&self.phy, regs::PHY_ADDR, regs::PHY_BUSY)?;
        Ok(self.phy.read(regs::PHY_DATA))
    }

    fn phy_write(&self, reg: u32, value: u32) -> Result<(), MarginError> {
        self.phy.write(regs::PHY_DATA, value);
        self.phy.write(regs::PHY_ADDR, reg | regs::PHY_WRITE);
        poll_clear(&self.phy, regs::PHY_ADDR, regs::PHY_BUSY)
    }

    fn phy_modify(
        &self,
        reg: u32,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<(), MarginError> {
        let value = self.phy_read(reg)?;
        self.phy_write(reg, f(value))
    }

    fn stat_addr(lane: Lane) -> u32 {
        regs::MARGIN_STAT_BASE + 4 * u32::from(lane.index())
    }
}

impl<P: PhyRw> MarginHal for Uphy4<P> {
    const HAS_HW_ERROR_LIMIT: bool = false;
    const NEEDS_RECOVERY_INTERCEPT: bool = true;

    fn caps(&self) -> &MarginCaps {
        &CAPS
    }

    fn margining_fused(&self) -> bool {
        self.phy.read(regs::FUSE_MARGIN) & regs::FUSE_BIT != 0
    }

    fn set_ready(&self, ready: bool) {
        self.phy.modify(regs::MARGIN_READY, |v| {
            if ready {
                v | regs::READY_BITS
            } else {
                v & !regs::READY_BITS
            }
        });
    }

    fn margin_ctl(&self, lane: Lane) -> MarginCtl {
        let addr = regs::MARGIN_CTL_BASE + 4 * u32::from(lane.index());
        MarginCtl::from(self.phy.read(addr))
    }

    fn update_status(&self, lane: Lane, f: impl FnOnce(&mut MarginStatus)) {
        let addr = Self::stat_addr(lane);
        let mut status = MarginStatus::from(self.phy.read(addr));
        f(&mut status);
        self.phy.write(addr, status.into());
    }

    fn pending_commands(&self) -> LaneMask {
        LaneMask::from_raw(self.phy.read(regs::MARGIN_INTR) as u16)
    }

    fn ack_command(&self, lane: Lane) {
        self.phy.write(regs::MARGIN_INTR, 1 << lane.index());
    }

    fn pending_error_excess(&self) -> LaneMask {
        // No hardware limit compare on this revision; the line is not
        // wired.
        LaneMask::EMPTY
    }

    fn ack_error_excess(&self, _lane: Lane) {}

    fn start_step(
        &self,
        lane: Lane,
        step: StepMargin,
    ) -> Result<(), MarginError> {
        self.select(LaneMask::single(lane));
        self.phy_modify(regs::RX_MARGIN_CTL, |v| {
            let v = match step.kind {
                StepKind::Timing => {
                    (v & !(regs::TIMING_OFF_MASK | regs::MARGIN_VOLTAGE))
                        | (((step.offset as u32) & 0x3f)
                            << regs::TIMING_OFF_SHIFT)
                }
                StepKind::Voltage => {
                    (v & !regs::VOLTAGE_OFF_MASK)
                        | regs::MARGIN_VOLTAGE
                        | (((step.offset as u32) & 0x7f)
                            << regs::VOLTAGE_OFF_SHIFT)
                }
            };
            v | regs::MARGIN_EN
        })?;
        self.set_error_counting(lane, true)
    }

    fn stop_step(
        &self,
        lanes: LaneMask,
        counters: ErrorCounters,
    ) -> Result<(), MarginError> {
        if lanes.is_empty() {
            return Ok(());
        }
        self.select(lanes);
        self.phy_modify(regs::RX_MARGIN_CTL, |v| v & !regs::MARGIN_EN)?;
        if counters == ErrorCounters::Clear {
            self.phy_write(regs::RX_MARGIN_ERR, 0)?;
        }
        Ok(())
    }

    fn error_count(&self, lane: Lane) -> Result<u8, MarginError> {
        self.select(LaneMask::single(lane));
        Ok((self.phy_read(regs::RX_MARGIN_ERR)? & regs::ERR_COUNT_MASK) as u8)
    }

    fn clear_error_count(&self, lane: Lane) -> Result<(), MarginError> {
        self.select(LaneMask::single(lane));
        self.phy_write(regs::RX_MARGIN_ERR, 0)
    }

    fn set_error_counting(
        &self,
        lane: Lane,
        enabled: bool,
    ) -> Result<(), MarginError> {
        self.select(LaneMask::single(lane));
        self.phy_modify(regs::RX_MARGIN_CTL, |v| {
            if enabled {
                v | regs::ERR_COUNT_EN
            } else {
                v & !regs::ERR_COUNT_EN
            }
        })
    }

    fn set_error_limit(&self, _limit: u8) -> Result<(), MarginError> {
        // Tracked in software on this revision.
        Ok(())
    }

    fn report_diag(&self, code: DiagCode) {
        self.phy.write(regs::DIAG_SCRATCH, code as u32);
    }
}
