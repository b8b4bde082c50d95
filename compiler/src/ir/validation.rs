//! Trace Validation
//!
//! Structural checks run on recorded and optimized traces before they are
//! handed to a backend. They catch arity and kind errors, uses of undefined
//! boxes, misplaced terminals and descriptors of the wrong category.

use super::{Arity, BranchId, Descr, IrBox, IrKind, IrValue, Opcode, Operation, TokenId, Trace};
use fxhash::{FxHashMap, FxHashSet};
use std::fmt;

/// Where in a trace an error was found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// `None` for the main operation list
    pub branch: Option<BranchId>,
    pub index: usize,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.branch {
            Some(branch) => write!(f, "branch {} op {}", branch.0, self.index),
            None => write!(f, "op {}", self.index),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationErrorKind {
    WrongArity { expected: Arity, found: usize },
    ArgKind { index: usize, expected: IrKind, found: IrKind },
    MissingDescr { expected: &'static str },
    WrongDescr { expected: &'static str, found: &'static str },
    UnexpectedDescr,
    ResultKind { expected: IrKind, found: Option<IrKind> },
    Redefinition(IrBox),
    Undefined(IrBox),
    /// A terminal operation followed by something other than a label
    MisplacedTerminal,
    MissingTerminal,
    UnknownBranch(BranchId),
    BranchOnNonGuard,
    JumpArity { expected: usize, found: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError {
    /// `None` for errors about a whole operation list
    pub location: Option<Location>,
    pub kind: ValidationErrorKind,
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(location) = self.location {
            write!(f, "{}: ", location)?;
        }
        match &self.kind {
            ValidationErrorKind::WrongArity { expected, found } => {
                write!(f, "expected {:?} arguments, found {}", expected, found)
            }
            ValidationErrorKind::ArgKind {
                index,
                expected,
                found,
            } => write!(
                f,
                "argument {} should be {:?}, found {:?}",
                index, expected, found
            ),
            ValidationErrorKind::MissingDescr { expected } => {
                write!(f, "missing {} descriptor", expected)
            }
            ValidationErrorKind::WrongDescr { expected, found } => {
                write!(f, "expected a {} descriptor, found a {} descriptor", expected, found)
            }
            ValidationErrorKind::UnexpectedDescr => write!(f, "operation takes no descriptor"),
            ValidationErrorKind::ResultKind { expected, found } => {
                write!(f, "result should be {:?}, found {:?}", expected, found)
            }
            ValidationErrorKind::Redefinition(b) => write!(f, "{} is defined twice", b),
            ValidationErrorKind::Undefined(b) => write!(f, "{} is used before definition", b),
            ValidationErrorKind::MisplacedTerminal => {
                write!(f, "terminal operation is not at the end of the trace")
            }
            ValidationErrorKind::MissingTerminal => write!(f, "trace has no terminal operation"),
            ValidationErrorKind::UnknownBranch(id) => write!(f, "unknown branch {}", id.0),
            ValidationErrorKind::BranchOnNonGuard => write!(f, "only guards may own a branch"),
            ValidationErrorKind::JumpArity { expected, found } => write!(
                f,
                "jump passes {} values to a label taking {}",
                found, expected
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

fn descr_category(descr: &Descr) -> &'static str {
    match descr {
        Descr::Size(_) => "size",
        Descr::Field(_) => "field",
        Descr::Array(_) => "array",
        Descr::Call(_) => "call",
        Descr::Fail(_) => "fail",
        Descr::Target(_) => "target",
    }
}

fn expected_descr(opcode: Opcode) -> Option<&'static str> {
    use Opcode::*;
    if opcode.is_guard() {
        return Some("fail");
    }
    if opcode.is_call() {
        return Some("call");
    }
    match opcode {
        Label | Jump => Some("target"),
        New | NewWithVtable => Some("size"),
        NewArray | GetarrayitemGcI | GetarrayitemGcR | GetarrayitemGcF | SetarrayitemGc
        | ArraylenGc => Some("array"),
        GetfieldGcI | GetfieldGcR | GetfieldGcF | SetfieldGc => Some("field"),
        _ => None,
    }
}

struct Validator<'a> {
    trace: &'a Trace,
    label_arity: FxHashMap<TokenId, usize>,
    errors: Vec<ValidationError>,
}

impl<'a> Validator<'a> {
    fn error(&mut self, location: Location, kind: ValidationErrorKind) {
        self.errors.push(ValidationError {
            location: Some(location),
            kind,
        });
    }

    fn check_ops(&mut self, ops: &[Operation], defined: &mut FxHashSet<IrBox>, branch: Option<BranchId>) {
        for (index, op) in ops.iter().enumerate() {
            let location = Location { branch, index };
            self.check_signature(op, location);
            self.check_uses(op, defined, location);

            if let Some(result) = op.result {
                if !defined.insert(result) {
                    self.error(location, ValidationErrorKind::Redefinition(result));
                }
            }

            if op.opcode.is_terminal() {
                let next = ops.get(index + 1).map(|next| next.opcode);
                if !matches!(next, None | Some(Opcode::Label)) {
                    self.error(location, ValidationErrorKind::MisplacedTerminal);
                }
            }

            if let Some(id) = op.branch {
                if !op.is_guard() {
                    self.error(location, ValidationErrorKind::BranchOnNonGuard);
                }
                self.check_branch(id, location);
            }
        }

        if !ops.last().is_some_and(|op| op.opcode.is_terminal()) {
            self.errors.push(ValidationError {
                location: None,
                kind: ValidationErrorKind::MissingTerminal,
            });
        }
    }

    fn check_signature(&mut self, op: &Operation, location: Location) {
        let opcode = op.opcode;
        if !opcode.arity().accepts(op.num_args()) {
            self.error(
                location,
                ValidationErrorKind::WrongArity {
                    expected: opcode.arity(),
                    found: op.num_args(),
                },
            );
        }
        for (index, arg) in op.args.iter().enumerate() {
            if let Some(expected) = opcode.arg_kind(index) {
                if arg.kind() != expected {
                    self.error(
                        location,
                        ValidationErrorKind::ArgKind {
                            index,
                            expected,
                            found: arg.kind(),
                        },
                    );
                }
            }
        }

        match (expected_descr(opcode), &op.descr) {
            (Some(expected), None) => {
                self.error(location, ValidationErrorKind::MissingDescr { expected })
            }
            (Some(expected), Some(descr)) if descr_category(descr) != expected => self.error(
                location,
                ValidationErrorKind::WrongDescr {
                    expected,
                    found: descr_category(descr),
                },
            ),
            (None, Some(_)) => self.error(location, ValidationErrorKind::UnexpectedDescr),
            _ => {}
        }

        let expected = opcode.result_kind();
        let found = op.result.map(|b| b.kind());
        let matches = match found {
            Some(kind) => kind == expected,
            None => expected == IrKind::Void,
        };
        if !matches {
            self.error(location, ValidationErrorKind::ResultKind { expected, found });
        }

        if opcode == Opcode::Jump {
            if let Some(Descr::Target(token)) = &op.descr {
                if let Some(&arity) = self.label_arity.get(&token.id) {
                    if arity != op.num_args() {
                        self.error(
                            location,
                            ValidationErrorKind::JumpArity {
                                expected: arity,
                                found: op.num_args(),
                            },
                        );
                    }
                }
            }
        }
    }

    fn check_uses(&mut self, op: &Operation, defined: &mut FxHashSet<IrBox>, location: Location) {
        for arg in op.args.iter() {
            let IrValue::Box(b) = *arg else { continue };
            if defined.contains(&b) {
                continue;
            }
            // label arguments of a peeled loop are fresh definitions
            if op.opcode == Opcode::Label {
                defined.insert(b);
            } else {
                self.error(location, ValidationErrorKind::Undefined(b));
            }
        }
    }

    fn check_branch(&mut self, id: BranchId, location: Location) {
        let trace = self.trace;
        let Some(branch) = trace.branch(id) else {
            self.error(location, ValidationErrorKind::UnknownBranch(id));
            return;
        };
        let mut defined: FxHashSet<IrBox> = branch.snapshot.boxes().into_iter().collect();
        self.check_ops(&branch.ops, &mut defined, Some(id));
    }
}

/// Check a trace, collecting every error found
pub fn validate_trace(trace: &Trace) -> Result<(), Vec<ValidationError>> {
    let label_arity = trace
        .labels()
        .filter_map(|(_, op)| match &op.descr {
            Some(Descr::Target(token)) => Some((token.id, op.num_args())),
            _ => None,
        })
        .collect();
    let mut validator = Validator {
        trace,
        label_arity,
        errors: Vec::new(),
    };
    let mut defined: FxHashSet<IrBox> = trace.inputargs.iter().copied().collect();
    validator.check_ops(&trace.ops, &mut defined, None);

    if validator.errors.is_empty() {
        Ok(())
    } else {
        Err(validator.errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::lowering::lower_text;
    use crate::ir::{BoxFactory, IdAllocator};
    use std::sync::Arc;

    #[test]
    fn test_valid_loop() {
        let lowered = lower_text(
            "
            [i0]
            label(i0, descr=loop)
            i1 = int_add(i0, 1)
            i2 = int_lt(i1, 10)
            guard_true(i2) [i1] {
                finish(i1)
            }
            jump(i1, descr=loop)
            ",
            Arc::new(IdAllocator::new()),
        )
        .unwrap();
        assert_eq!(validate_trace(&lowered.trace), Ok(()));
    }

    #[test]
    fn test_reports_kind_and_use_errors() {
        let mut boxes = BoxFactory::new();
        let i0 = boxes.fresh(IrKind::Int);
        let f1 = boxes.fresh(IrKind::Float);
        let i2 = boxes.fresh(IrKind::Int);
        let i9 = boxes.fresh(IrKind::Int);
        let ops = vec![
            Operation::new(
                Opcode::IntAdd,
                vec![IrValue::Box(i0), IrValue::Box(f1)],
                Some(i2),
                None,
            ),
            Operation::new(Opcode::Finish, vec![IrValue::Box(i9)], None, None),
        ];
        let trace = Trace::new(vec![i0, f1], ops, boxes);
        let errors = validate_trace(&trace).unwrap_err();
        assert!(errors.iter().any(|e| matches!(
            e.kind,
            ValidationErrorKind::ArgKind {
                index: 1,
                expected: IrKind::Int,
                found: IrKind::Float
            }
        )));
        assert!(errors.iter().any(|e| e.kind == ValidationErrorKind::Undefined(i9)
            && e.location == Some(Location { branch: None, index: 1 })));
    }

    #[test]
    fn test_terminal_must_end_the_trace() {
        let mut boxes = BoxFactory::new();
        let i0 = boxes.fresh(IrKind::Int);
        let i1 = boxes.fresh(IrKind::Int);
        let ops = vec![
            Operation::new(Opcode::Finish, vec![IrValue::Box(i0)], None, None),
            Operation::new(Opcode::IntNeg, vec![IrValue::Box(i0)], Some(i1), None),
        ];
        let trace = Trace::new(vec![i0], ops, boxes);
        let errors = validate_trace(&trace).unwrap_err();
        let kinds: Vec<_> = errors.iter().map(|e| e.kind.clone()).collect();
        assert!(kinds.contains(&ValidationErrorKind::MisplacedTerminal));
        assert!(kinds.contains(&ValidationErrorKind::MissingTerminal));
    }

    #[test]
    fn test_getfield_needs_field_descr() {
        let mut boxes = BoxFactory::new();
        let p0 = boxes.fresh(IrKind::Ref);
        let i1 = boxes.fresh(IrKind::Int);
        let ops = vec![
            Operation::new(Opcode::GetfieldGcI, vec![IrValue::Box(p0)], Some(i1), None),
            Operation::new(Opcode::Finish, vec![IrValue::Box(i1)], None, None),
        ];
        let trace = Trace::new(vec![p0], ops, boxes);
        let errors = validate_trace(&trace).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(
            errors[0].kind,
            ValidationErrorKind::MissingDescr { expected: "field" }
        );
    }
}
