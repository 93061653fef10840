// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Margining driver for UPHY revision 5.
//!
//! Protocol-wise this is revision 4 with revised field widths: the
//! command and status images are packed two lanes to a 32-bit word (even
//! lane in the low half), the offset fields moved, and the error counter
//! grew to ten bits. Status updates MUST be read-modify-write of the
//! owning half-word; a full-register write would clobber the neighbor
//! lane's status. The error limit is still tracked in software and the
//! sampler still needs the link-recovery intercept.

use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, MarginCaps, MarginCtl, MarginError, MarginHal,
    MarginStatus, StepKind, StepMargin, caps,
};
use lanemask::{Lane, LaneMask};

use crate::{poll_clear, PhyRw};

mod regs {
    // Interrupt and readiness block.
    pub const MARGIN_INTR: u32 = 0x0020; // pending command per lane, W1C
    pub const MARGIN_READY: u32 = 0x0024;
    pub const FUSE_CFG: u32 = 0x0028;
    pub const DIAG_SCRATCH: u32 = 0x002c;

    pub const READY_BITS: u32 = 0b11;
    pub const FUSE_BIT: u32 = 1 << 3;

    // Command/status images, two lanes to a word: even lane in [15:0],
    // odd lane in [31:16].
    pub const MARGIN_CTL_BASE: u32 = 0x0300; // stride 4, eight words
    pub const MARGIN_STAT_BASE: u32 = 0x0320;

    // Indirect PHY access: the command register names the target and
    // carries the go/write flags; completion is polled in PHY_STATUS.
    pub const LANE_SELECT: u32 = 0x0400;
    pub const PHY_CMD: u32 = 0x0404; // [15:0] register, plus flags below
    pub const PHY_WDATA: u32 = 0x0408;
    pub const PHY_RDATA: u32 = 0x040c;
    pub const PHY_STATUS: u32 = 0x0410;

    pub const PHY_WRITE: u32 = 1 << 16;
    pub const PHY_GO: u32 = 1 << 17;
    pub const PHY_BUSY: u32 = 1 << 0;

    // PHY register file, reached indirectly, per selected lane.
    pub const RX_MARGIN_CTL: u32 = 0x0112;
    pub const RX_MARGIN_CNT: u32 = 0x0113;

    // RX_MARGIN_CTL fields.
    pub const MARGIN_EN: u32 = 1 << 0;
    pub const ERR_COUNT_EN: u32 = 1 << 1;
    pub const MARGIN_VOLTAGE: u32 = 1 << 2; // clear selects timing
    pub const TIMING_OFF_SHIFT: u32 = 6; // [11:6], two's complement
    pub const TIMING_OFF_MASK: u32 = 0x3f << TIMING_OFF_SHIFT;
    pub const VOLTAGE_OFF_SHIFT: u32 = 12; // [18:12], two's complement
    pub const VOLTAGE_OFF_MASK: u32 = 0x7f << VOLTAGE_OFF_SHIFT;

    // RX_MARGIN_CNT fields.
    pub const ERR_COUNT_MASK: u32 = 0x3ff;
}

static CAPS: MarginCaps = MarginCaps {
    control: caps::VOLTAGE_SUPPORTED
        | caps::IND_UP_DOWN_VOLTAGE
        | caps::IND_LEFT_RIGHT_TIMING,
    num_voltage_steps: 64,
    num_timing_steps: 16,
    max_timing_offset: 30,
    max_voltage_offset: 15,
    sampling_rate_voltage: 63,
    sampling_rate_timing: 63,
    sample_count: 0x38,
    max_lanes: 15,
};

pub struct Uphy5<P> {
    phy: P,
}

impl<P: PhyRw> Uphy5<P> {
    pub fn new(phy: P) -> Self {
        Self { phy }
    }

    fn select(&self, lanes: LaneMask) {
        self.phy.write(regs::LANE_SELECT, u32::from(lanes.raw()));
    }

    fn phy_read(&self, reg: u32) -> Result<u32, MarginError> {
        self.phy.write(regs::PHY_CMD, reg | regs::PHY_GO);
        poll_clear(&self.phy, regs::PHY_STATUS, regs::PHY_BUSY)?;
        Ok(self.phy.read(regs::PHY_RDATA))
    }

    fn phy_write(&self, reg: u32, value: u32) -> Result<(), MarginError> {
        self.phy.write(regs::PHY_WDATA, value);
        self.phy
            .write(regs::PHY_CMD, reg | regs::PHY_WRITE | regs::PHY_GO);
        poll_clear(&self.phy, regs::PHY_STATUS, regs::PHY_BUSY)
    }

    fn phy_modify(
        &self,
        reg: u32,
        f: impl FnOnce(u32) -> u32,
    ) -> Result<(), MarginError> {
        let value = self.phy_read(reg)?;
        self.phy_write(reg, f(value))
    }

    // Word address and bit position of a lane's half of a packed image.
    fn packed(base: u32, lane: Lane) -> (u32, u32) {
        let addr = base + 4 * u32::from(lane.index() / 2);
        let shift = 16 * u32::from(lane.index() % 2);
        (addr, shift)
    }
}

impl<P: PhyRw> MarginHal for Uphy5<P> {
    const HAS_HW_ERROR_LIMIT: bool = false;
    const NEEDS_RECOVERY_INTERCEPT: bool = true;

    fn caps(&self) -> &MarginCaps {
        &CAPS
    }

    fn margining_fused(&self) -> bool {
        self.phy.read(regs::FUSE_CFG) & regs::FUSE_BIT != 0
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
        let (addr, shift) = Self::packed(regs::MARGIN_CTL_BASE, lane);
        MarginCtl::from((self.phy.read(addr) >> shift) & 0xffff)
    }

    fn update_status(&self, lane: Lane, f: impl FnOnce(&mut MarginStatus)) {
        let (addr, shift) = Self::packed(regs::MARGIN_STAT_BASE, lane);
        let word = self.phy.read(addr);
        let mut status = MarginStatus::from((word >> shift) & 0xffff);
        f(&mut status);
        let raw: u32 = status.into();
        self.phy
            .write(addr, (word & !(0xffff << shift)) | ((raw & 0xffff) << shift));
    }

    fn pending_commands(&self) -> LaneMask {
        LaneMask::from_raw(self.phy.read(regs::MARGIN_INTR) as u16)
    }

    fn ack_command(&self, lane: Lane) {
        self.phy.write(regs::MARGIN_INTR, 1 << lane.index());
    }

    fn pending_error_excess(&self) -> LaneMask {
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
            self.phy_write(regs::RX_MARGIN_CNT, 0)?;
        }
        Ok(())
    }

    fn error_count(&self, lane: Lane) -> Result<u8, MarginError> {
        self.select(LaneMask::single(lane));
        let raw = self.phy_read(regs::RX_MARGIN_CNT)? & regs::ERR_COUNT_MASK;
        // The ten-bit counter saturates into the interface's eight.
        Ok(raw.min(u8::MAX as u32) as u8)
    }

    fn clear_error_count(&self, lane: Lane) -> Result<(), MarginError> {
        self.select(LaneMask::single(lane));
        self.phy_write(regs::RX_MARGIN_CNT, 0)
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
