// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol model for PCIe receiver lane margining.
//!
//! Lane margining lets the link partner (or production test gear) step a
//! receiver's sampling point in time or voltage and watch the error count,
//! without taking the link down. The partner writes a per-lane margining
//! control register; the firmware answers through a shadow status register
//! it maintains with the same field layout.
//!
//! This crate holds the wire-level model shared by the dispatcher, the
//! step-margining engine, and the per-chip-family HALs: the command and
//! status register images, payload encodings, capability reporting, the
//! error taxonomy, and the [`MarginHal`] capability interface each chip
//! family implements. Register *addresses* are chip business and live with
//! the HALs; everything in here is protocol.

#![cfg_attr(not(test), no_std)]

use bitfield::bitfield;
use derive_more::{From, Into};
use lanemask::{Lane, LaneMask};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Margin command categories defined by the PCIe base specification.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MarginType {
    /// Read-only capability report.
    Report = 1,
    /// Margin control: normal settings, error log, error count limit.
    Control = 2,
    /// Step the sampling point in time.
    TimingStep = 3,
    /// Step the sampling point in voltage.
    VoltageStep = 4,
    /// No command; pure handshake echo.
    NoCommand = 7,
}

/// Broadcast receiver number, legal for every margin type.
pub const RECEIVER_BROADCAST: u8 = 0;

/// The receiver number addressing an upstream port's own receiver. We are
/// an endpoint, so margining commands may name this receiver or broadcast;
/// anything else is the partner margining a receiver we don't have.
pub const RECEIVER_UPSTREAM: u8 = 6;

bitfield! {
    /// Image of a lane's margining control register, written by the link
    /// partner.
    #[derive(Copy, Clone, PartialEq, Eq, From, Into)]
    pub struct MarginCtl(u32);
    impl Debug;
    pub u8, receiver_number, set_receiver_number: 2, 0;
    pub u8, raw_margin_type, set_raw_margin_type: 5, 3;
    pub usage_model, set_usage_model: 6;
    pub u8, payload, set_payload: 15, 8;
}

impl MarginCtl {
    pub fn margin_type(&self) -> Option<MarginType> {
        MarginType::from_u8(self.raw_margin_type())
    }
}

bitfield! {
    /// Image of a lane's margining status register, the firmware-owned
    /// shadow the partner polls. Same field layout as [`MarginCtl`].
    #[derive(Copy, Clone, PartialEq, Eq, From, Into)]
    pub struct MarginStatus(u32);
    impl Debug;
    pub u8, receiver_number, set_receiver_number: 2, 0;
    pub u8, margin_type, set_margin_type: 5, 3;
    pub usage_model, set_usage_model: 6;
    pub u8, payload, set_payload: 15, 8;
}

/// Type-2 payload: return the receiver to normal settings.
pub const PAYLOAD_GO_TO_NORMAL: u8 = 0x0f;
/// Type-2 payload: clear the hardware error counter.
pub const PAYLOAD_CLEAR_ERROR_LOG: u8 = 0x55;
/// Type-2 payloads with both top bits set program a new error count limit
/// from the low six bits.
pub const PAYLOAD_SET_LIMIT_MASK: u8 = 0xc0;
/// Type-7 "no command" sentinel; the only legal type-7 payload.
pub const PAYLOAD_NO_COMMAND: u8 = 0x9c;

/// Largest programmable error count limit, and the reset value of the
/// software-tracked limit.
pub const MAX_ERROR_COUNT_LIMIT: u8 = 0x3f;

/// Which axis a step-margining command moves the sampling point on.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepKind {
    Timing,
    Voltage,
}

/// Step limits, from the chip margining documentation. Each axis spans
/// exactly the two's-complement range of its PHY offset field: 6 bits for
/// timing, 7 for voltage.
pub const MAX_TIMING_LEFT_STEPS: u8 = 16;
pub const MAX_TIMING_RIGHT_STEPS: u8 = 15;
pub const MAX_VOLTAGE_DOWN_STEPS: u8 = 64;
pub const MAX_VOLTAGE_UP_STEPS: u8 = 63;

/// A decoded step-margining request: the axis plus a signed offset, in
/// steps, ready for two's-complement truncation into the PHY offset field.
/// Negative is left for timing and down for voltage.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StepMargin {
    pub kind: StepKind,
    pub offset: i8,
}

impl StepMargin {
    /// Decode the payload of a type-3/4 command.
    ///
    /// The wire encoding is sign-magnitude: a direction bit (6 for timing,
    /// 7 for voltage) over a step magnitude. Magnitudes beyond the
    /// documented maxima are an argument error; the caller drops the
    /// iteration without touching the PHY.
    pub fn decode(kind: StepKind, payload: u8) -> Result<Self, MarginError> {
        let (negative, steps, max_neg, max_pos) = match kind {
            StepKind::Timing => (
                payload & 0x40 != 0,
                payload & 0x3f,
                MAX_TIMING_LEFT_STEPS,
                MAX_TIMING_RIGHT_STEPS,
            ),
            StepKind::Voltage => (
                payload & 0x80 != 0,
                payload & 0x7f,
                MAX_VOLTAGE_DOWN_STEPS,
                MAX_VOLTAGE_UP_STEPS,
            ),
        };

        let limit = if negative { max_neg } else { max_pos };
        if steps > limit {
            return Err(MarginError::Argument);
        }

        let offset = if negative {
            -(steps as i8)
        } else {
            steps as i8
        };
        Ok(Self { kind, offset })
    }
}

/// Step execution status, reported in the top two bits of the status
/// payload; the low six bits carry the current error count.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StepStatus {
    TooManyErrors = 0,
    SetUp = 1,
    InProgress = 2,
    Nak = 3,
}

impl StepStatus {
    pub fn payload(self, error_count: u8) -> u8 {
        ((self as u8) << 6) | error_count.min(MAX_ERROR_COUNT_LIMIT)
    }
}

/// Payload selectors for type-1 capability reports.
pub const REPORT_CAPABILITIES: u8 = 0x88;
pub const REPORT_NUM_VOLTAGE_STEPS: u8 = 0x89;
pub const REPORT_NUM_TIMING_STEPS: u8 = 0x8a;
pub const REPORT_MAX_TIMING_OFFSET: u8 = 0x8b;
pub const REPORT_MAX_VOLTAGE_OFFSET: u8 = 0x8c;
pub const REPORT_SAMPLING_RATE_VOLTAGE: u8 = 0x8d;
pub const REPORT_SAMPLING_RATE_TIMING: u8 = 0x8e;
pub const REPORT_SAMPLE_COUNT: u8 = 0x8f;
pub const REPORT_MAX_LANES: u8 = 0x90;

/// Bits of the capability bitmap returned for [`REPORT_CAPABILITIES`].
pub mod caps {
    pub const VOLTAGE_SUPPORTED: u8 = 1 << 0;
    pub const IND_UP_DOWN_VOLTAGE: u8 = 1 << 1;
    pub const IND_LEFT_RIGHT_TIMING: u8 = 1 << 2;
    pub const SAMPLE_REPORTING_METHOD: u8 = 1 << 3;
    pub const IND_ERROR_SAMPLER: u8 = 1 << 4;
}

/// Capability constants a chip family reports through type-1 commands.
#[derive(Copy, Clone, Debug)]
pub struct MarginCaps {
    pub control: u8,
    pub num_voltage_steps: u8,
    pub num_timing_steps: u8,
    pub max_timing_offset: u8,
    pub max_voltage_offset: u8,
    pub sampling_rate_voltage: u8,
    pub sampling_rate_timing: u8,
    pub sample_count: u8,
    pub max_lanes: u8,
}

impl MarginCaps {
    /// The value echoed for a type-1 report, or `None` for a selector we
    /// don't implement.
    pub fn report(&self, selector: u8) -> Option<u8> {
        match selector {
            REPORT_CAPABILITIES => Some(self.control),
            REPORT_NUM_VOLTAGE_STEPS => Some(self.num_voltage_steps),
            REPORT_NUM_TIMING_STEPS => Some(self.num_timing_steps),
            REPORT_MAX_TIMING_OFFSET => Some(self.max_timing_offset),
            REPORT_MAX_VOLTAGE_OFFSET => Some(self.max_voltage_offset),
            REPORT_SAMPLING_RATE_VOLTAGE => Some(self.sampling_rate_voltage),
            REPORT_SAMPLING_RATE_TIMING => Some(self.sampling_rate_timing),
            REPORT_SAMPLE_COUNT => Some(self.sample_count),
            REPORT_MAX_LANES => Some(self.max_lanes),
            _ => None,
        }
    }
}

/// Margining error taxonomy. None of these are fatal; the offending
/// command or iteration is dropped and the event loop keeps going.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum MarginError {
    /// Illegal type, payload, or step offset.
    Argument = 1,
    /// Receiver number illegal for the type, or lane index out of range.
    Range,
    /// A bounded PHY status poll expired.
    Timeout,
    /// The execute queue had no room.
    QueueFull,
    /// The execute queue post did not complete in time.
    QueueTimeout,
}

/// Codes written to the chip diagnostic scratch register when a command
/// is dropped or an internal operation fails. Not part of the margining
/// wire protocol; read by support tooling.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive)]
pub enum DiagCode {
    None = 0,
    BadMarginType,
    BadReceiver,
    BadUsageModel,
    BadPayload,
    OffsetOutOfRange,
    PhyTimeout,
    ExecQueueFull,
    ExecQueueTimeout,
}

/// Whether stopping step margining also clears the lane's hardware error
/// counter. "Go to normal settings" clears; stops caused by an exceeded
/// error limit, an abort, or link-recovery interception preserve the
/// counter so the condition stays observable until explicitly cleared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorCounters {
    Clear,
    Preserve,
}

/// A request for one step-margining executor iteration. Only the lane is
/// carried: the command register is re-read at execution time, since the
/// partner may rewrite it between scheduling and execution.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub lane: Lane,
}

/// Bound, in milliseconds, on how long posting an [`ExecuteRequest`] may
/// take. The lock-free queue implementation never blocks; a transport
/// that can must give up within this bound and report
/// [`MarginError::QueueTimeout`].
pub const EXEC_POST_TIMEOUT_MS: u32 = 10;

/// Producer side of the bounded execute queue. Postable from interrupt
/// context; the cooperative task drains the other end.
pub trait ExecQueue {
    fn post(&self, req: ExecuteRequest) -> Result<(), MarginError>;
}

/// The per-chip-family margining capability interface.
///
/// The dispatcher and step-margining engine are identical across chip
/// families; everything the families encode differently sits behind this
/// trait. One implementation is instantiated at firmware start for the
/// chip being driven; dispatch is static.
///
/// Register-touching methods here are single accesses or short
/// read-modify-write sequences and may be called with interrupts masked.
/// The exceptions are the `Result`-returning PHY operations, which poll
/// an indirect-access handshake under a bounded budget and must only be
/// called with interrupts live.
pub trait MarginHal {
    /// True when the hardware compares error counts against a programmed
    /// limit and raises the error-limit interrupt itself. Families
    /// without this get the comparison done in software by the executor.
    const HAS_HW_ERROR_LIMIT: bool;

    /// True on families whose margining sampler is disturbed by link
    /// recovery, requiring the recovery interceptor.
    const NEEDS_RECOVERY_INTERCEPT: bool;

    /// Capability constants for type-1 reports.
    fn caps(&self) -> &MarginCaps;

    /// The margining-allowed fuse bit.
    fn margining_fused(&self) -> bool;

    /// Set or clear the readiness bits the link partner polls before
    /// issuing margining commands.
    fn set_ready(&self, ready: bool);

    /// Current control register image for a lane.
    fn margin_ctl(&self, lane: Lane) -> MarginCtl;

    /// Read-modify-write the lane's shadow status register. Only the
    /// fields the closure touches change; a blind full-register write is
    /// forbidden because on some families the status word shares a
    /// register with still-pending interrupt state.
    fn update_status(&self, lane: Lane, f: impl FnOnce(&mut MarginStatus));

    /// Lanes with an unacknowledged margining command.
    fn pending_commands(&self) -> LaneMask;

    /// Acknowledge exactly one lane's command interrupt.
    fn ack_command(&self, lane: Lane);

    /// Lanes with an unacknowledged error-limit interrupt. Always empty
    /// on families without hardware limit detection.
    fn pending_error_excess(&self) -> LaneMask;

    /// Acknowledge exactly one lane's error-limit interrupt.
    fn ack_error_excess(&self, lane: Lane);

    /// Program the lane's margin offset and enable step margining.
    fn start_step(&self, lane: Lane, step: StepMargin)
        -> Result<(), MarginError>;

    /// Stop step margining on every lane in `lanes`, clearing or
    /// preserving hardware error counters as directed.
    fn stop_step(
        &self,
        lanes: LaneMask,
        counters: ErrorCounters,
    ) -> Result<(), MarginError>;

    /// Current hardware error count for a lane.
    fn error_count(&self, lane: Lane) -> Result<u8, MarginError>;

    /// Clear the lane's hardware error counter.
    fn clear_error_count(&self, lane: Lane) -> Result<(), MarginError>;

    /// Enable or disable hardware error counting for a lane.
    fn set_error_counting(
        &self,
        lane: Lane,
        enabled: bool,
    ) -> Result<(), MarginError>;

    /// Program the hardware error count limit. No-op on families that
    /// track the limit in software.
    fn set_error_limit(&self, limit: u8) -> Result<(), MarginError>;

    /// Write a code to the diagnostic scratch register.
    fn report_diag(&self, code: DiagCode);
}
