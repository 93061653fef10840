// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Margining driver for UPHY revision 6, the newest supported PHY.
//!
//! This revision grew a per-lane interrupt register array (command and
//! error-limit events, both W1C in the same register), a hardware
//! error-limit compare with direct-mapped per-lane counters, and two
//! extra knobs that must be set before margining is enabled: the
//! per-generation-speed margin gates and the CDR offset scale, which is
//! dropped to its margining value for the session and restored to the
//! hardware default on stop. The margining sampler is independent of the
//! link state machine, so no link-recovery intercept is needed.

use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, MarginCaps, MarginCtl, MarginError, MarginHal,
    MarginStatus, StepKind, StepMargin, caps,
};
use lanemask::{Lane, LaneMask, MAX_LANES};

use crate::{poll_clear, PhyRw};

mod regs {
    // Readiness, fuse, and diagnostic block.
    pub const MARGIN_READY: u32 = 0x0040;
    pub const FUSE_FEATURE: u32 = 0x0044;
    pub const DIAG_SCRATCH: u32 = 0x0048;

    pub const READY_BITS: u32 = 0b11;
    pub const FUSE_BIT: u32 = 1 << 7;

    // Per-lane interrupt registers; both events are W1C.
    pub const LANE_INTR_BASE: u32 = 0x0500; // stride 4
    pub const INTR_CMD: u32 = 1 << 0;
    pub const INTR_ERR_LIMIT: u32 = 1 << 1;

    // Per-lane command/status images, one word per lane.
    pub const MARGIN_CTL_BASE: u32 = 0x0600; // stride 4
    pub const MARGIN_STAT_BASE: u32 = 0x0680; // stride 4

    // Margining control block.
    pub const LANE_SELECT: u32 = 0x0700;
    pub const MARGIN_SPEED_EN: u32 = 0x0704;
    pub const CDR_OFS_SCALE: u32 = 0x0708;
    pub const ERR_LIMIT: u32 = 0x070c; // [5:0]

    pub const SPEED_GATES: u32 = 0b11; // GEN4_EN | GEN5_EN
    pub const CDR_SCALE_DEFAULT: u32 = 0x4;
    pub const CDR_SCALE_MARGIN: u32 = 0x1;

    // Per-lane error counters, direct-mapped; write zero to clear.
    pub const ERR_COUNT_BASE: u32 = 0x0740; // stride 4, [7:0]
    pub const ERR_CTL_BASE: u32 = 0x0780; // stride 4
    pub const ERR_COUNT_MASK: u32 = 0xff;
    pub const COUNT_EN: u32 = 1 << 0;

    // Indirect PHY access pair.
    pub const PHY_ADDR: u32 = 0x07c0; // [15:0] register, plus flags below
    pub const PHY_DATA: u32 = 0x07c4;

    pub const PHY_WRITE: u32 = 1 << 30;
    pub const PHY_BUSY: u32 = 1 << 31;

    // PHY register file, reached indirectly, per selected lane.
    pub const RX_MARGIN_CTL: u32 = 0x0212;

    // RX_MARGIN_CTL fields. One offset field serves both axes.
    pub const MARGIN_EN: u32 = 1 << 0;
    pub const MARGIN_VOLTAGE: u32 = 1 << 1; // clear selects timing
    pub const OFFSET_SHIFT: u32 = 8; // [14:8], two's complement
    pub const OFFSET_MASK: u32 = 0x7f << OFFSET_SHIFT;
}

static CAPS: MarginCaps = MarginCaps {
    control: caps::VOLTAGE_SUPPORTED
        | caps::IND_UP_DOWN_VOLTAGE
        | caps::IND_LEFT_RIGHT_TIMING
        | caps::IND_ERROR_SAMPLER,
    num_voltage_steps: 64,
    num_timing_steps: 16,
    max_timing_offset: 35,
    max_voltage_offset: 20,
    sampling_rate_voltage: 63,
    sampling_rate_timing: 63,
    sample_count: 0x3c,
    max_lanes: 15,
};

pub struct Uphy6<P> {
    phy: P,
}

impl<P: PhyRw> Uphy6<P> {
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

    fn intr_addr(lane: Lane) -> u32 {
        regs::LANE_INTR_BASE + 4 * u32::from(lane.index())
    }

    fn count_addr(lane: Lane) -> u32 {
        regs::ERR_COUNT_BASE + 4 * u32::from(lane.index())
    }

    fn pending(&self, event: u32) -> LaneMask {
        (0..MAX_LANES as u8)
            .filter_map(Lane::new)
            .filter(|&lane| self.phy.read(Self::intr_addr(lane)) & event != 0)
            .collect()
    }
}

impl<P: PhyRw> MarginHal for Uphy6<P> {
    const HAS_HW_ERROR_LIMIT: bool = true;
    const NEEDS_RECOVERY_INTERCEPT: bool = false;

    fn caps(&self) -> &MarginCaps {
        &CAPS
    }

    fn margining_fused(&self) -> bool {
        self.phy.read(regs::FUSE_FEATURE) & regs::FUSE_BIT != 0
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
        let addr = regs::MARGIN_STAT_BASE + 4 * u32::from(lane.index());
        let mut status = MarginStatus::from(self.phy.read(addr));
        f(&mut status);
        self.phy.write(addr, status.into());
    }

    fn pending_commands(&self) -> LaneMask {
        self.pending(regs::INTR_CMD)
    }

    fn ack_command(&self, lane: Lane) {
        // W1C of the command bit alone; a pending error-limit event in
        // the same register must survive the acknowledge.
        self.phy.write(Self::intr_addr(lane), regs::INTR_CMD);
    }

    fn pending_error_excess(&self) -> LaneMask {
        self.pending(regs::INTR_ERR_LIMIT)
    }

    fn ack_error_excess(&self, lane: Lane) {
        self.phy.write(Self::intr_addr(lane), regs::INTR_ERR_LIMIT);
    }

    fn start_step(
        &self,
        lane: Lane,
        step: StepMargin,
    ) -> Result<(), MarginError> {
        self.select(LaneMask::single(lane));
        // The sampler margins at the reduced CDR gain, and only the link
        // generations that support margining may have it enabled; both
        // must be in place before the enable bit goes on.
        self.phy.write(regs::CDR_OFS_SCALE, regs::CDR_SCALE_MARGIN);
        self.phy
            .modify(regs::MARGIN_SPEED_EN, |v| v | regs::SPEED_GATES);
        self.phy_modify(regs::RX_MARGIN_CTL, |v| {
            let v = (v & !(regs::OFFSET_MASK | regs::MARGIN_VOLTAGE))
                | (((step.offset as u32) & 0x7f) << regs::OFFSET_SHIFT);
            let v = match step.kind {
                StepKind::Timing => v,
                StepKind::Voltage => v | regs::MARGIN_VOLTAGE,
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
        self.phy
            .modify(regs::MARGIN_SPEED_EN, |v| v & !regs::SPEED_GATES);
        self.phy.write(regs::CDR_OFS_SCALE, regs::CDR_SCALE_DEFAULT);
        if counters == ErrorCounters::Clear {
            for lane in lanes {
                self.phy.write(Self::count_addr(lane), 0);
            }
        }
        Ok(())
    }

    fn error_count(&self, lane: Lane) -> Result<u8, MarginError> {
        Ok((self.phy.read(Self::count_addr(lane)) & regs::ERR_COUNT_MASK)
            as u8)
    }

    fn clear_error_count(&self, lane: Lane) -> Result<(), MarginError> {
        self.phy.write(Self::count_addr(lane), 0);
        Ok(())
    }

    fn set_error_counting(
        &self,
        lane: Lane,
        enabled: bool,
    ) -> Result<(), MarginError> {
        let addr = regs::ERR_CTL_BASE + 4 * u32::from(lane.index());
        self.phy.modify(addr, |v| {
            if enabled {
                v | regs::COUNT_EN
            } else {
                v & !regs::COUNT_EN
            }
        });
        Ok(())
    }

    fn set_error_limit(&self, limit: u8) -> Result<(), MarginError> {
        self.phy.write(regs::ERR_LIMIT, u32::from(limit) & 0x3f);
        Ok(())
    }

    fn report_diag(&self, code: DiagCode) {
        self.phy.write(regs::DIAG_SCRATCH, code as u32);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;

    /// Revision 6 fake: same PHY_ADDR/PHY_DATA handshake shape as
    /// revision 4, plus the direct-mapped per-lane registers.
    struct FakePhy {
        direct: RefCell<BTreeMap<u32, u32>>,
        indirect: RefCell<BTreeMap<(u8, u32), u32>>,
        writes: RefCell<Vec<(u32, u32)>>,
        stuck_busy: Cell<bool>,
    }

    impl FakePhy {
        fn new() -> Self {
            Self {
                direct: RefCell::new(BTreeMap::new()),
                indirect: RefCell::new(BTreeMap::new()),
                writes: RefCell::new(Vec::new()),
                stuck_busy: Cell::new(false),
            }
        }

        fn load(&self, addr: u32, value: u32) {
            self.direct.borrow_mut().insert(addr, value);
        }

        fn lane_reg(&self, lane: u8, reg: u32) -> u32 {
            *self.indirect.borrow().get(&(lane, reg)).unwrap_or(&0)
        }

        fn get(&self, addr: u32) -> u32 {
            *self.direct.borrow().get(&addr).unwrap_or(&0)
        }

        /// Position of the first logged write matching `pred`.
        fn write_index(&self, pred: impl Fn(&(u32, u32)) -> bool) -> usize {
            self.writes.borrow().iter().position(pred).unwrap()
        }
    }

    impl PhyRw for &FakePhy {
        fn read(&self, addr: u32) -> u32 {
            if addr == regs::PHY_ADDR && self.stuck_busy.get() {
                return regs::PHY_BUSY;
            }
            *self.direct.borrow().get(&addr).unwrap_or(&0)
        }

        fn write(&self, addr: u32, value: u32) {
            self.writes.borrow_mut().push((addr, value));
            if addr == regs::PHY_ADDR {
                let reg = value & 0xffff;
                let sel = self.get(regs::LANE_SELECT) as u16;
                if value & regs::PHY_WRITE != 0 {
                    let data = self.get(regs::PHY_DATA);
                    let mut indirect = self.indirect.borrow_mut();
                    for lane in LaneMask::from_raw(sel) {
                        indirect.insert((lane.index(), reg), data);
                    }
                } else if sel != 0 {
                    let lane = sel.trailing_zeros() as u8;
                    let data = self.lane_reg(lane, reg);
                    self.direct.borrow_mut().insert(regs::PHY_DATA, data);
                }
            }
            self.direct.borrow_mut().insert(addr, value);
        }
    }

    fn lane(index: u8) -> Lane {
        Lane::new(index).unwrap()
    }

    #[test]
    fn start_gates_and_scale_precede_enable() {
        let phy = FakePhy::new();
        let hal = Uphy6::new(&phy);

        hal.start_step(
            lane(2),
            StepMargin {
                kind: StepKind::Voltage,
                offset: -33,
            },
        )
        .unwrap();

        let scale = phy.write_index(|&(addr, value)| {
            addr == regs::CDR_OFS_SCALE && value == regs::CDR_SCALE_MARGIN
        });
        let gates = phy.write_index(|&(addr, value)| {
            addr == regs::MARGIN_SPEED_EN && value & regs::SPEED_GATES != 0
        });
        let enable = phy.write_index(|&(addr, value)| {
            addr == regs::PHY_ADDR && value & regs::PHY_WRITE != 0
        });
        assert!(scale < enable);
        assert!(gates < enable);

        let ctl = phy.lane_reg(2, regs::RX_MARGIN_CTL);
        assert_eq!(
            ctl & (regs::MARGIN_EN | regs::MARGIN_VOLTAGE),
            regs::MARGIN_EN | regs::MARGIN_VOLTAGE
        );
        // -33 in the seven-bit two's-complement offset field.
        assert_eq!((ctl & regs::OFFSET_MASK) >> regs::OFFSET_SHIFT, 0x5f);
        // Counting enabled through the per-lane control register.
        assert_eq!(
            phy.get(regs::ERR_CTL_BASE + 4 * 2) & regs::COUNT_EN,
            regs::COUNT_EN
        );
    }

    #[test]
    fn stop_restores_scale_and_gates() {
        let phy = FakePhy::new();
        phy.load(regs::MARGIN_SPEED_EN, regs::SPEED_GATES);
        phy.load(regs::CDR_OFS_SCALE, regs::CDR_SCALE_MARGIN);
        phy.load(regs::ERR_COUNT_BASE + 4 * 6, 11);
        let hal = Uphy6::new(&phy);

        hal.stop_step(LaneMask::single(lane(6)), ErrorCounters::Preserve)
            .unwrap();

        assert_eq!(phy.get(regs::MARGIN_SPEED_EN) & regs::SPEED_GATES, 0);
        assert_eq!(phy.get(regs::CDR_OFS_SCALE), regs::CDR_SCALE_DEFAULT);
        assert_eq!(phy.get(regs::ERR_COUNT_BASE + 4 * 6), 11);

        hal.stop_step(LaneMask::single(lane(6)), ErrorCounters::Clear)
            .unwrap();
        assert_eq!(phy.get(regs::ERR_COUNT_BASE + 4 * 6), 0);
    }

    #[test]
    fn per_lane_interrupts() {
        let phy = FakePhy::new();
        phy.load(
            regs::LANE_INTR_BASE + 4 * 3,
            regs::INTR_CMD | regs::INTR_ERR_LIMIT,
        );
        phy.load(regs::LANE_INTR_BASE + 4 * 7, regs::INTR_ERR_LIMIT);
        let hal = Uphy6::new(&phy);

        let cmds: Vec<u8> =
            hal.pending_commands().iter().map(Lane::index).collect();
        assert_eq!(cmds, vec![3]);
        let excess: Vec<u8> =
            hal.pending_error_excess().iter().map(Lane::index).collect();
        assert_eq!(excess, vec![3, 7]);

        // Each acknowledge names exactly one event bit.
        hal.ack_command(lane(3));
        assert!(phy
            .writes
            .borrow()
            .contains(&(regs::LANE_INTR_BASE + 4 * 3, regs::INTR_CMD)));
        hal.ack_error_excess(lane(7));
        assert!(phy
            .writes
            .borrow()
            .contains(&(regs::LANE_INTR_BASE + 4 * 7, regs::INTR_ERR_LIMIT)));
    }

    #[test]
    fn hardware_error_limit_programmed() {
        let phy = FakePhy::new();
        let hal = Uphy6::new(&phy);

        hal.set_error_limit(42).unwrap();
        assert_eq!(phy.get(regs::ERR_LIMIT), 42);
    }

    #[test]
    fn direct_error_counter_access() {
        let phy = FakePhy::new();
        phy.load(regs::ERR_COUNT_BASE + 4 * 9, 0x17);
        let hal = Uphy6::new(&phy);

        assert_eq!(hal.error_count(lane(9)).unwrap(), 0x17);
        hal.clear_error_count(lane(9)).unwrap();
        assert_eq!(hal.error_count(lane(9)).unwrap(), 0);
    }

    #[test]
    fn indirect_timeout() {
        let phy = FakePhy::new();
        phy.stuck_busy.set(true);
        let hal = Uphy6::new(&phy);

        assert_eq!(
            hal.stop_step(LaneMask::single(lane(0)), ErrorCounters::Clear),
            Err(MarginError::Timeout)
        );
    }
}
