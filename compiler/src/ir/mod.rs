//! Trace Intermediate Representation
//!
//! This module defines the linear, SSA-like representation that the trace
//! recorder produces and the optimizer consumes. The IR is designed to be:
//! - Linear (a trace is a straight list of operations; guards are the only
//!   side exits)
//! - Strongly kinded (every box is an integer, reference or float)
//! - Cheap to memoize (operations hash on opcode, arguments and descriptor)
//! - Backend neutral (descriptors are opaque tokens interpreted by whoever
//!   created them)

pub mod types;
pub mod opcode;
pub mod descr;
pub mod operation;
pub mod trace;
pub mod eval;
pub mod dump;
pub mod validation;
pub mod lowering;
pub mod builder;

pub use types::*;
pub use opcode::*;
pub use descr::*;
pub use operation::*;
pub use trace::*;
pub use builder::TraceBuilder;

use std::fmt;

/// Unique identifier for boxes within a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrId(u32);

impl IrId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn invalid() -> Self {
        Self(u32::MAX)
    }

    pub fn is_valid(&self) -> bool {
        self.0 != u32::MAX
    }

    pub fn index(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for IrId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// Allocates fresh boxes for one compilation.
///
/// The recorder hands its factory to the trace, and the optimizer keeps
/// allocating from the same counter, so result boxes stay unique across the
/// preamble and the peeled loop.
#[derive(Debug, Clone, Default)]
pub struct BoxFactory {
    next: u32,
}

impl BoxFactory {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Continue numbering after an existing id
    pub fn starting_after(id: IrId) -> Self {
        Self {
            next: id.index().saturating_add(1),
        }
    }

    pub fn fresh(&mut self, kind: IrKind) -> IrBox {
        let id = IrId::new(self.next);
        self.next += 1;
        IrBox::new(id, kind)
    }

    pub fn allocated(&self) -> u32 {
        self.next
    }
}
