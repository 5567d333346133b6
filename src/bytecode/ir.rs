use crate::bytecode::{CompareOp, Opcode};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// A symbolic jump target inside one [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// An immutable constant value.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Literal {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Tuple(Vec<Literal>),
}

impl Literal {
    /// Identity used when sharing constant table slots: variants never mix
    /// and floats compare by bit pattern.
    pub fn same(&self, other: &Literal) -> bool {
        match (self, other) {
            (Literal::Float(a), Literal::Float(b)) => a.to_bits() == b.to_bits(),
            (Literal::Tuple(a), Literal::Tuple(b)) => a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same(y)),
            (a, b) => a == b,
        }
    }

    pub fn str(value: impl Into<String>) -> Literal {
        Literal::Str(value.into())
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::None => write!(f, "None"),
            Literal::Bool(true) => write!(f, "True"),
            Literal::Bool(false) => write!(f, "False"),
            Literal::Int(n) => write!(f, "{}", n),
            Literal::Float(x) => write!(f, "{:?}", x),
            Literal::Str(s) => write!(f, "{:?}", s),
            Literal::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Literal::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                if items.len() == 1 {
                    write!(f, ",")?;
                }
                write!(f, ")")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Const {
    Value(Literal),
    Code(Box<Stream>),
}

/// Symbolic operand. Table indices are assigned by the encoder.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    None,
    Int(u32),
    Const(Const),
    Name(String),
    Local(String),
    Free(String),
    Jump(Label),
    Compare(CompareOp),
}

impl Arg {
    pub fn describe(&self) -> String {
        match self {
            Arg::None => "nothing".to_string(),
            Arg::Int(n) => format!("integer {}", n),
            Arg::Const(_) => "a constant".to_string(),
            Arg::Name(n) => format!("name '{}'", n),
            Arg::Local(n) => format!("local '{}'", n),
            Arg::Free(n) => format!("free variable '{}'", n),
            Arg::Jump(l) => format!("label {}", l),
            Arg::Compare(op) => format!("comparison '{}'", op.symbol()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Instr {
    pub op: Opcode,
    pub arg: Arg,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Op(Instr),
    Label(Label),
    /// Source line of the instructions that follow.
    Line(u32),
}

/// A symbolic instruction stream for one code unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    pub items: Vec<Item>,
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    /// Positional parameters, in order.
    pub params: Vec<String>,
    pub star_param: Option<String>,
    pub kw_star_param: Option<String>,
    /// Variables captured from an enclosing unit, in closure order.
    pub freevars: Vec<String>,
    /// Locals live in a fresh frame rather than a supplied mapping.
    pub newlocals: bool,
    next_label: u32,
}

impl Stream {
    pub fn new(name: impl Into<String>, filename: impl Into<String>, first_line: u32) -> Self {
        Self {
            items: Vec::new(),
            name: name.into(),
            filename: filename.into(),
            first_line,
            params: Vec::new(),
            star_param: None,
            kw_star_param: None,
            freevars: Vec::new(),
            newlocals: false,
            next_label: 0,
        }
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    pub fn emit(&mut self, op: Opcode, arg: Arg) {
        self.items.push(Item::Op(Instr { op, arg }));
    }

    pub fn op(&mut self, op: Opcode) {
        self.emit(op, Arg::None);
    }

    pub fn mark(&mut self, label: Label) {
        self.items.push(Item::Label(label));
    }

    pub fn line(&mut self, line: u32) {
        self.items.push(Item::Line(line));
    }

    pub fn instructions(&self) -> impl Iterator<Item = &Instr> {
        self.items.iter().filter_map(|item| match item {
            Item::Op(instr) => Some(instr),
            _ => None,
        })
    }

    /// Normal form used to compare streams that differ only in label
    /// identity or redundant markers.
    ///
    /// Unreferenced labels and trailing markers are dropped, labels placed
    /// at the same position are merged, line markers that do not change the
    /// current line are removed, and labels are renumbered in order of first
    /// mention. Nested code constants are normalized as well.
    pub fn canonical(&self) -> Stream {
        let referenced: HashSet<Label> = self
            .instructions()
            .filter_map(|instr| match instr.arg {
                Arg::Jump(label) => Some(label),
                _ => None,
            })
            .collect();

        let mut merged: HashMap<Label, Label> = HashMap::new();
        let mut items = Vec::new();
        let mut pending_labels: Vec<Label> = Vec::new();
        let mut pending_line = None;
        let mut current_line = self.first_line;

        for item in &self.items {
            match item {
                Item::Label(label) => {
                    if referenced.contains(label) {
                        pending_labels.push(*label);
                    }
                }
                Item::Line(line) => pending_line = Some(*line),
                Item::Op(instr) => {
                    flush_labels(&mut pending_labels, &mut merged, &mut items);
                    if let Some(line) = pending_line.take() {
                        if line != current_line {
                            items.push(Item::Line(line));
                            current_line = line;
                        }
                    }
                    let arg = match &instr.arg {
                        Arg::Const(Const::Code(code)) => Arg::Const(Const::Code(Box::new(code.canonical()))),
                        other => other.clone(),
                    };
                    items.push(Item::Op(Instr { op: instr.op, arg }));
                }
            }
        }
        flush_labels(&mut pending_labels, &mut merged, &mut items);

        // renumber in order of first mention
        let mut numbering: HashMap<Label, Label> = HashMap::new();
        let mut renumber = |label: Label| {
            let label = merged.get(&label).copied().unwrap_or(label);
            let next = Label(numbering.len() as u32);
            *numbering.entry(label).or_insert(next)
        };
        for item in &mut items {
            match item {
                Item::Label(label) => *label = renumber(*label),
                Item::Op(Instr {
                    arg: Arg::Jump(label), ..
                }) => *label = renumber(*label),
                _ => {}
            }
        }

        Stream {
            items,
            name: self.name.clone(),
            filename: self.filename.clone(),
            first_line: self.first_line,
            params: self.params.clone(),
            star_param: self.star_param.clone(),
            kw_star_param: self.kw_star_param.clone(),
            freevars: self.freevars.clone(),
            newlocals: self.newlocals,
            next_label: numbering.len() as u32,
        }
    }
}

fn flush_labels(pending: &mut Vec<Label>, merged: &mut HashMap<Label, Label>, items: &mut Vec<Item>) {
    if let Some(first) = pending.first().copied() {
        for label in pending.drain(..) {
            merged.insert(label, first);
        }
        items.push(Item::Label(first));
    }
}
