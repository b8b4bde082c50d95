//! Syntax tree of the textual trace format
//!
//! ```text
//! descr Node = struct(size=16, vtable=0x1000)
//! descr value = field(Node, int)
//! [i0, p1]
//! label(i0, p1, descr=loop)
//! i2 = int_add(i0, 1)
//! i3 = int_lt(i2, 100)
//! guard_true(i3) [i2, p1]
//! jump(i2, p1, descr=loop)
//! ```

/// A complete trace file
#[derive(Debug, Clone, PartialEq)]
pub struct TraceFile {
    pub decls: Vec<DescrDecl>,
    pub inputs: Vec<String>,
    pub ops: Vec<OpLine>,
}

/// `descr NAME = ...`
#[derive(Debug, Clone, PartialEq)]
pub struct DescrDecl {
    pub name: String,
    pub kind: DescrKind,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DescrKind {
    Struct {
        size: Option<u64>,
        vtable: Option<u64>,
    },
    Field {
        owner: String,
        kind: ValueKind,
        immutable: bool,
    },
    Array {
        item: ValueKind,
    },
    Call {
        args: Vec<ValueKind>,
        result: ValueKind,
        effect: CallEffect,
        raises: bool,
        address: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Int,
    Ref,
    Float,
    Void,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEffect {
    /// May write anything
    Unknown,
    Elidable,
    /// Writes only the named fields and arrays
    Writes(Vec<String>),
}

/// An operation argument or snapshot value
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    /// `i3`, `p0`, `f1`
    Var(String),
    Int(i64),
    Float(f64),
    /// `NULL`
    Null,
    /// `ConstPtr(0x...)`
    Ptr(u64),
    /// `@name`, the address of a class vtable or a function
    Addr(String),
}

/// One frame of a guard snapshot: `[3:7 i0, i2 | 4:0 p1]`
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub position: Option<(u32, u32)>,
    pub values: Vec<Arg>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpLine {
    pub line: usize,
    pub result: Option<String>,
    pub name: String,
    pub args: Vec<Arg>,
    pub descr: Option<String>,
    /// Snapshot frames, outermost first
    pub snapshot: Option<Vec<Frame>>,
    /// Inline continuation of a guard, `{ ... }`
    pub branch: Option<Vec<OpLine>>,
}

impl OpLine {
    pub fn is_guard(&self) -> bool {
        self.name.starts_with("guard_")
    }
}
