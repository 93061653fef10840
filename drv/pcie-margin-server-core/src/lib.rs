// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Engine for the PCIe receiver lane-margining protocol.
//!
//! This is the chip-independent half of the margining subsystem: the
//! command dispatcher, the single-flight step-margining scheduler and
//! executor, the readiness/abort state machine, and the link-recovery
//! interceptor, all over the `MarginHal` capability interface a PHY
//! driver provides. It is a library rather than a task so the firmware
//! image for each chip can embed it with its own HAL and interrupt glue,
//! and so the whole engine runs against fakes in host tests.
//!
//! # Execution contexts
//!
//! Two contexts run this code. The interrupt handlers
//! ([`MarginServerCore::handle_ready_irq`], [`handle_abort_irq`],
//! [`handle_command_irq`], [`handle_error_excess_irq`],
//! [`handle_link_recovery`]) run at interrupt priority; the executor
//! ([`MarginServerCore::execute`]) runs on the cooperative task that
//! drains the execute queue. Shared state lives behind a
//! `critical-section` mutex and every access is a short critical
//! section: a few loads and stores, at most a single register
//! read-modify-write, never a busy poll or a queue post. Interrupt
//! context always wins a race: the executor re-validates under a
//! critical section before publishing anything a handler might have
//! invalidated.
//!
//! [`handle_abort_irq`]: MarginServerCore::handle_abort_irq
//! [`handle_command_irq`]: MarginServerCore::handle_command_irq
//! [`handle_error_excess_irq`]: MarginServerCore::handle_error_excess_irq
//! [`handle_link_recovery`]: MarginServerCore::handle_link_recovery

#![cfg_attr(not(test), no_std)]

mod dispatch;
mod exec;
mod recovery;
mod state;


use core::cell::RefCell;

use critical_section::Mutex;
use drv_pcie_margin_api::{
    DiagCode, ErrorCounters, ExecQueue, ExecuteRequest, MarginError,
    MarginHal,
};
use lanemask::LaneMask;
use ringlog::*;

use state::{MarginState, StepState};

/// Startup configuration for the margining engine.
pub struct MarginConfig {
    /// Software margining enable. When clear the subsystem never arms,
    /// whatever the fuses say.
    pub enabled: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Trace {
    None,
    Armed { resumed: bool },
    ArmGateClosed,
    Abort,
    Command(u8, u32),
    Dropped(u8, DiagCode),
    Scheduled(u8),
    Execute(u8),
    Published(u8, u8),
    Suppressed(u8),
    ErrorLimit(u8, u8),
    RecoveryStop(u16),
    RecoveryResume(u8),
    PostFailed(u8, MarginError),
    SessionIdle,
}

ringlog!(Trace, 32, Trace::None);

/// The margining engine, generic over the chip-family HAL and the
/// execute-queue transport.
pub struct MarginServerCore<H, Q> {
    pub(crate) hal: H,
    pub(crate) queue: Q,
    pub(crate) config: MarginConfig,
    pub(crate) state: Mutex<RefCell<MarginState>>,
}

impl<H: MarginHal, Q: ExecQueue> MarginServerCore<H, Q> {
    pub fn new(hal: H, queue: Q, config: MarginConfig) -> Self {
        Self {
            hal,
            queue,
            config,
            state: Mutex::new(RefCell::new(MarginState::new())),
        }
    }

    /// Margining-ready interrupt: arm the subsystem, or resume a session
    /// parked by the link-recovery intercept.
    ///
    /// Runs in interrupt context.
    pub fn handle_ready_irq(&self) {
        if !(self.config.enabled && self.hal.margining_fused()) {
            // Gate closed: the interrupt is acknowledged by the caller's
            // glue, but the readiness bits stay clear so the partner
            // never starts margining.
            ringlog_entry!(Trace::ArmGateClosed);
            return;
        }

        let resume = critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            let snapshot = if state.stopped_for_recovery {
                state.recovery.take()
            } else {
                None
            };
            state.reset();
            state.ready = true;
            if let Some(snapshot) = &snapshot {
                for lane in snapshot.saved {
                    state.set_step(lane, StepState::Scheduled);
                }
            }
            snapshot
        });

        self.hal.set_ready(true);
        ringlog_entry!(Trace::Armed {
            resumed: resume.is_some()
        });

        if let Some(snapshot) = resume {
            self.resume_session(snapshot);
        }
    }

    /// Abort interrupt: unconditionally cancel all scheduled and
    /// in-flight margining work and disarm.
    ///
    /// Runs in interrupt context.
    pub fn handle_abort_irq(&self) {
        ringlog_entry!(Trace::Abort);

        // Quit stressing the link first. The error counters keep their
        // values; whatever the partner was measuring stays observable
        // until it explicitly clears the log.
        if self
            .hal
            .stop_step(LaneMask::ALL, ErrorCounters::Preserve)
            .is_err()
        {
            // Best effort; there is no recovery path for a stop that
            // times out while aborting.
            self.hal.report_diag(DiagCode::PhyTimeout);
        }
        self.hal.set_ready(false);

        critical_section::with(|cs| {
            let mut state = self.state.borrow_ref_mut(cs);
            state.ready = false;
            state.reset();
        });
    }
}

/// The production execute queue: a two-deep lock-free MPMC ring, legal
/// to post from interrupt context. Single-flight keeps steady-state
/// occupancy at one; the second slot absorbs a recovery resume racing a
/// stale request.
pub struct ExecWorkQueue {
    queue: heapless::mpmc::Q2<ExecuteRequest>,
}

impl ExecWorkQueue {
    pub const fn new() -> Self {
        Self {
            queue: heapless::mpmc::Q2::new(),
        }
    }

    /// Next request, if any. The cooperative task calls this from its
    /// event loop and sleeps when it returns `None`.
    pub fn take(&self) -> Option<ExecuteRequest> {
        self.queue.dequeue()
    }
}

impl Default for ExecWorkQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecQueue for &ExecWorkQueue {
    /// Lock-free, so the post completes in bounded time well inside the
    /// `EXEC_POST_TIMEOUT_MS` budget; the only failure is a full queue.
    fn post(&self, req: ExecuteRequest) -> Result<(), MarginError> {
        self.queue.enqueue(req).map_err(|_| MarginError::QueueFull)
    }
}
