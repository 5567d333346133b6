use crate::bytecode::Literal;
use serde::{Deserialize, Serialize};

/// Code unit attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CodeFlags(pub u32);

impl CodeFlags {
    pub const OPTIMIZED: u32 = 0x01;
    pub const NEWLOCALS: u32 = 0x02;
    pub const VARARGS: u32 = 0x04;
    pub const VARKEYWORDS: u32 = 0x08;
    pub const NESTED: u32 = 0x10;
    pub const GENERATOR: u32 = 0x20;
    pub const NOFREE: u32 = 0x40;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    pub fn insert(&mut self, bit: u32) {
        self.0 |= bit;
    }

    pub fn names(self) -> Vec<&'static str> {
        [
            (Self::OPTIMIZED, "OPTIMIZED"),
            (Self::NEWLOCALS, "NEWLOCALS"),
            (Self::VARARGS, "VARARGS"),
            (Self::VARKEYWORDS, "VARKEYWORDS"),
            (Self::NESTED, "NESTED"),
            (Self::GENERATOR, "GENERATOR"),
            (Self::NOFREE, "NOFREE"),
        ]
        .into_iter()
        .filter(|(bit, _)| self.contains(*bit))
        .map(|(_, name)| name)
        .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Value(Literal),
    Code(Box<CodeUnit>),
}

/// An encoded, executable code unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeUnit {
    pub name: String,
    pub filename: String,
    pub first_line: u32,
    pub argcount: u32,
    pub flags: CodeFlags,
    pub stacksize: u32,
    pub code: Vec<u8>,
    pub consts: Vec<Constant>,
    pub names: Vec<String>,
    /// Parameters first, then the remaining fast locals.
    pub varnames: Vec<String>,
    /// Locals captured by nested units.
    pub cellvars: Vec<String>,
    pub freevars: Vec<String>,
    /// `(byte offset, line)` pairs, ascending by offset.
    pub lines: Vec<(u32, u32)>,
}

impl CodeUnit {
    pub fn to_bytes(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    /// Source line of the instruction at `offset`.
    pub fn line_for(&self, offset: u32) -> u32 {
        self.lines
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map_or(self.first_line, |(_, line)| *line)
    }

    /// Name of the cell or free variable at a deref operand index.
    pub fn deref_name(&self, index: usize) -> Option<&str> {
        if index < self.cellvars.len() {
            Some(&self.cellvars[index])
        } else {
            self.freevars.get(index - self.cellvars.len()).map(String::as_str)
        }
    }

    pub fn has_varargs(&self) -> bool {
        self.flags.contains(CodeFlags::VARARGS)
    }

    pub fn has_varkeywords(&self) -> bool {
        self.flags.contains(CodeFlags::VARKEYWORDS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit() -> CodeUnit {
        CodeUnit {
            name: "f".into(),
            filename: "<test>".into(),
            first_line: 3,
            argcount: 1,
            flags: CodeFlags(CodeFlags::OPTIMIZED | CodeFlags::NEWLOCALS),
            stacksize: 4,
            code: vec![100, 0, 0, 83],
            consts: vec![Constant::Value(Literal::Float(1.5))],
            names: vec![],
            varnames: vec!["x".into()],
            cellvars: vec!["c".into()],
            freevars: vec!["f".into()],
            lines: vec![(0, 4), (3, 6)],
        }
    }

    #[test]
    fn test_serialized_form_round_trips() {
        let unit = unit();
        let bytes = unit.to_bytes().unwrap();
        assert_eq!(CodeUnit::from_bytes(&bytes).unwrap(), unit);
    }

    #[test]
    fn test_lookups() {
        let unit = unit();
        assert_eq!(unit.line_for(0), 4);
        assert_eq!(unit.line_for(2), 4);
        assert_eq!(unit.line_for(3), 6);
        assert_eq!(unit.deref_name(0), Some("c"));
        assert_eq!(unit.deref_name(1), Some("f"));
        assert_eq!(unit.deref_name(2), None);
        assert_eq!(unit.flags.names(), vec!["OPTIMIZED", "NEWLOCALS"]);
    }
}
