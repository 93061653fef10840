// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Trace ring buffers for firmware that takes interrupts over its task.
//!
//! A ring is declared once per module with [`ringlog!`], naming a
//! `Copy + PartialEq` payload type (typically a little `Trace` enum), a
//! capacity, and an initializer:
//!
//! ```ignore
//! ringlog!(Trace, 32, Trace::None);
//! ```
//!
//! and recorded into with [`ringlog_entry!`]:
//!
//! ```ignore
//! ringlog_entry!(Trace::Armed);
//! ```
//!
//! Entries carry the recording line number and a repeat count; recording
//! the same payload from the same line bumps the count of the most recent
//! entry instead of consuming a slot, so a polling loop doesn't wipe out
//! the history around it.
//!
//! Because an interrupt handler and the cooperative task may both record
//! into one ring, every record runs inside a `critical-section` critical
//! section. The ring is intended to be read post-mortem with a debugger;
//! there is no runtime consumer.

#![cfg_attr(not(test), no_std)]

use core::cell::RefCell;

use critical_section::Mutex;

/// One recorded trace event.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingLogEntry<T> {
    /// Source line that recorded the entry.
    pub line: u16,
    /// Number of times the ring has wrapped when this entry was written.
    pub generation: u16,
    /// Repeat count; 0 marks a never-written slot.
    pub count: u16,
    pub payload: T,
}

/// Fixed-capacity trace ring. Fields are public so that [`ringlog!`] can
/// build one in a `static` initializer; use the macros rather than
/// touching them directly.
pub struct RingLog<T, const N: usize> {
    #[doc(hidden)]
    pub next: usize,
    #[doc(hidden)]
    pub generation: u16,
    #[doc(hidden)]
    pub buffer: [RingLogEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> RingLog<T, N> {
    pub fn record(&mut self, line: u16, payload: T) {
        let prev = self.next.checked_sub(1).unwrap_or(N - 1);
        let last = &mut self.buffer[prev];
        if last.count != 0
            && last.count < u16::MAX
            && last.line == line
            && last.payload == payload
        {
            last.count += 1;
            return;
        }

        if self.next == 0 {
            self.generation = self.generation.wrapping_add(1);
        }
        self.buffer[self.next] = RingLogEntry {
            line,
            generation: self.generation,
            count: 1,
            payload,
        };
        self.next = (self.next + 1) % N;
    }

    /// Entries written so far, oldest slot first in storage order.
    pub fn entries(&self) -> impl Iterator<Item = &RingLogEntry<T>> {
        self.buffer.iter().filter(|e| e.count != 0)
    }
}

/// A `RingLog` shareable between interrupt and task context.
pub struct SharedRingLog<T, const N: usize> {
    inner: Mutex<RefCell<RingLog<T, N>>>,
}

impl<T: Copy + PartialEq, const N: usize> SharedRingLog<T, N> {
    #[doc(hidden)]
    pub const fn new(log: RingLog<T, N>) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(log)),
        }
    }

    pub fn record(&self, line: u16, payload: T) {
        critical_section::with(|cs| {
            self.inner.borrow(cs).borrow_mut().record(line, payload);
        });
    }

    /// Run `f` against the ring contents. Debug/test aid.
    pub fn with<R>(&self, f: impl FnOnce(&RingLog<T, N>) -> R) -> R {
        critical_section::with(|cs| f(&self.inner.borrow(cs).borrow()))
    }
}

/// Declares a shared trace ring in the current module.
///
/// `ringlog!(NAME, Type, N, expr)` declares `static NAME`; with the name
/// omitted it defaults to `__RINGLOG`, supporting the usual one ring per
/// module. The initializer must be a constant expression.
#[macro_export]
macro_rules! ringlog {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::SharedRingLog<$t, { $n }> =
            $crate::SharedRingLog::new($crate::RingLog {
                next: 0,
                generation: 0,
                buffer: [$crate::RingLogEntry {
                    line: 0,
                    generation: 0,
                    count: 0,
                    payload: $init,
                }; $n],
            });
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringlog!(__RINGLOG, $t, $n, $init);
    };
}

/// Records into a ring declared with [`ringlog!`].
#[macro_export]
macro_rules! ringlog_entry {
    ($name:expr, $payload:expr) => {
        $name.record(line!() as u16, $payload);
    };
    ($payload:expr) => {
        $crate::ringlog_entry!(__RINGLOG, $payload);
    };
}

/// Records into a ring declared with [`ringlog!`] at the crate root, for
/// use from submodules of the declaring crate.
#[allow(clippy::crate_in_macro_def)]
#[macro_export]
macro_rules! ringlog_entry_root {
    ($name:ident, $payload:expr) => {
        $crate::ringlog_entry!(crate::$name, $payload);
    };
    ($payload:expr) => {
        $crate::ringlog_entry!(crate::__RINGLOG, $payload);
    };
}
