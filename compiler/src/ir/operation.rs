//! Trace operations

use super::{BranchId, Descr, IrBox, IrValue, Opcode};
use crate::resume::FailDescr;
use smallvec::SmallVec;
use std::fmt;
use std::sync::Arc;

/// Argument list; most operations take at most three arguments
pub type ArgList = SmallVec<[IrValue; 3]>;

/// One recorded or optimized operation
#[derive(Debug, Clone)]
pub struct Operation {
    pub opcode: Opcode,
    pub args: ArgList,
    pub result: Option<IrBox>,
    pub descr: Option<Descr>,
    /// Off-trace continuation recorded for this guard
    pub branch: Option<BranchId>,
}

impl Operation {
    pub fn new(
        opcode: Opcode,
        args: impl IntoIterator<Item = IrValue>,
        result: Option<IrBox>,
        descr: Option<Descr>,
    ) -> Self {
        Self {
            opcode,
            args: args.into_iter().collect(),
            result,
            descr,
            branch: None,
        }
    }

    pub fn arg(&self, index: usize) -> IrValue {
        self.args[index]
    }

    pub fn num_args(&self) -> usize {
        self.args.len()
    }

    pub fn is_guard(&self) -> bool {
        self.opcode.is_guard()
    }

    pub fn fail_descr(&self) -> Option<&Arc<FailDescr>> {
        self.descr.as_ref().and_then(|d| d.as_fail())
    }

    /// Copy with different arguments, keeping result, descriptor and branch
    pub fn with_args(&self, args: impl IntoIterator<Item = IrValue>) -> Self {
        Self {
            opcode: self.opcode,
            args: args.into_iter().collect(),
            result: self.result,
            descr: self.descr.clone(),
            branch: self.branch,
        }
    }

    pub fn with_opcode(mut self, opcode: Opcode) -> Self {
        self.opcode = opcode;
        self
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = self.result {
            write!(f, "{} = ", result)?;
        }
        write!(f, "{}(", self.opcode)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", arg)?;
        }
        match &self.descr {
            Some(Descr::Fail(descr)) => {
                f.write_str(")")?;
                write!(f, " [")?;
                for (i, arg) in descr.fail_args().iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str("]")
            }
            Some(descr) => {
                if !self.args.is_empty() {
                    f.write_str(", ")?;
                }
                write!(f, "descr={})", descr)
            }
            None => f.write_str(")"),
        }
    }
}
