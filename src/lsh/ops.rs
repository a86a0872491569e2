// Operator catalog for the shell language.
//
// Precedence is "smaller binds tighter". Concat-capable operators fold up
// to OPER_ARG_COUNT_MAX operands into one bytecode record instead of
// nesting. Control operators carry a condition cell plus a patched jump
// target instead of a result.

/// Operator opcodes as stored in bytecode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    None = 0,
    Func = 1,
    Block = 2,
    Not = 3,
    Multiply = 4,
    Div = 5,
    Mod = 6,
    Plus = 7,
    Minus = 8,
    BitAnd = 9,
    BitNot = 10,
    BitShr = 11,
    BitShl = 12,
    BitOr = 13,
    BitXor = 14,
    Lt = 15,
    Gt = 16,
    LtEq = 17,
    GtEq = 18,
    Eq = 19,
    NotEq = 20,
    And = 21,
    Or = 22,
    Assign = 23,
    Var = 24,
    GVar = 25,
    If = 26,
    IfRet = 27,
    Foreach = 28,
    Else = 29,
    ArgList = 30,
}

impl Op {
    pub fn from_u8(v: u8) -> Op {
        match v {
            1 => Op::Func,
            2 => Op::Block,
            3 => Op::Not,
            4 => Op::Multiply,
            5 => Op::Div,
            6 => Op::Mod,
            7 => Op::Plus,
            8 => Op::Minus,
            9 => Op::BitAnd,
            10 => Op::BitNot,
            11 => Op::BitShr,
            12 => Op::BitShl,
            13 => Op::BitOr,
            14 => Op::BitXor,
            15 => Op::Lt,
            16 => Op::Gt,
            17 => Op::LtEq,
            18 => Op::GtEq,
            19 => Op::Eq,
            20 => Op::NotEq,
            21 => Op::And,
            22 => Op::Or,
            23 => Op::Assign,
            24 => Op::Var,
            25 => Op::GVar,
            26 => Op::If,
            27 => Op::IfRet,
            28 => Op::Foreach,
            29 => Op::Else,
            30 => Op::ArgList,
            _ => Op::None,
        }
    }
}

/// Operand requirements around an operator token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandPos {
    None,
    Opt,
    Mand,
}

/// Static operator description.
pub struct OpDesc {
    pub precedence: u8,
    pub concat: bool,
    pub control: bool,
    pub result: bool,
    pub opd_left: OperandPos,
    pub opd_right: OperandPos,
    pub token: &'static str,
    pub term: &'static str,
}

use OperandPos::{Mand, None as NoOpd, Opt};

pub const OPER_ARG_COUNT_MAX: u8 = 14;

pub static OP_DESC: [OpDesc; 31] = [
    OpDesc { precedence: 0, concat: false, control: false, result: false, opd_left: NoOpd, opd_right: NoOpd, token: "", term: "" },
    OpDesc { precedence: 1, concat: false, control: false, result: true, opd_left: Opt, opd_right: Opt, token: "(", term: ")" },
    OpDesc { precedence: 2, concat: false, control: true, result: false, opd_left: NoOpd, opd_right: Mand, token: "{", term: "}" },
    OpDesc { precedence: 3, concat: false, control: false, result: true, opd_left: NoOpd, opd_right: Mand, token: "!", term: "" },
    OpDesc { precedence: 4, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "*", term: "" },
    OpDesc { precedence: 4, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "/", term: "" },
    OpDesc { precedence: 4, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "%", term: "" },
    OpDesc { precedence: 5, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "+", term: "" },
    OpDesc { precedence: 5, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "-", term: "" },
    OpDesc { precedence: 6, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "&", term: "" },
    OpDesc { precedence: 6, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "~", term: "" },
    OpDesc { precedence: 6, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: ">>", term: "" },
    OpDesc { precedence: 6, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "<<", term: "" },
    OpDesc { precedence: 7, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "|", term: "" },
    OpDesc { precedence: 7, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "^", term: "" },
    OpDesc { precedence: 8, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "<", term: "" },
    OpDesc { precedence: 8, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: ">", term: "" },
    OpDesc { precedence: 8, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "<=", term: "" },
    OpDesc { precedence: 8, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: ">=", term: "" },
    OpDesc { precedence: 9, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "=", term: "" },
    OpDesc { precedence: 9, concat: false, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "!=", term: "" },
    OpDesc { precedence: 10, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "&&", term: "" },
    OpDesc { precedence: 11, concat: true, control: false, result: true, opd_left: Mand, opd_right: Mand, token: "||", term: "" },
    OpDesc { precedence: 14, concat: false, control: false, result: false, opd_left: Mand, opd_right: Mand, token: ":=", term: "" },
    OpDesc { precedence: 0, concat: false, control: false, result: false, opd_left: NoOpd, opd_right: Mand, token: "#", term: "" },
    OpDesc { precedence: 0, concat: false, control: false, result: false, opd_left: NoOpd, opd_right: Mand, token: "##", term: "" },
    OpDesc { precedence: 12, concat: false, control: true, result: false, opd_left: Mand, opd_right: Mand, token: "?", term: "" },
    OpDesc { precedence: 12, concat: false, control: true, result: false, opd_left: Mand, opd_right: Mand, token: "??", term: "" },
    OpDesc { precedence: 12, concat: false, control: true, result: false, opd_left: Mand, opd_right: Mand, token: "@", term: "" },
    OpDesc { precedence: 13, concat: false, control: true, result: false, opd_left: Mand, opd_right: Mand, token: ":", term: "" },
    OpDesc { precedence: 16, concat: true, control: false, result: false, opd_left: Mand, opd_right: Opt, token: ",", term: "" },
];

pub fn desc(op: Op) -> &'static OpDesc {
    &OP_DESC[op as usize]
}

/// Consume one operator token at `pos`. Multi-character operators take
/// their longest match.
pub fn parse_optype(src: &[u8], pos: &mut usize) -> Op {
    let b = match src.get(*pos) {
        Some(b) => *b,
        None => return Op::None,
    };
    let b2 = src.get(*pos + 1).copied();

    let (op, width) = match b {
        b'=' => (Op::Eq, 1),
        b'+' => (Op::Plus, 1),
        b'-' => (Op::Minus, 1),
        b'*' => (Op::Multiply, 1),
        b'^' => (Op::BitXor, 1),
        b'~' => (Op::BitNot, 1),
        b'/' => (Op::Div, 1),
        b'%' => (Op::Mod, 1),
        b'#' => match b2 {
            Some(b'#') => (Op::GVar, 2),
            _ => (Op::Var, 1),
        },
        b'>' => match b2 {
            Some(b'=') => (Op::GtEq, 2),
            Some(b'>') => (Op::BitShr, 2),
            _ => (Op::Gt, 1),
        },
        b'<' => match b2 {
            Some(b'=') => (Op::LtEq, 2),
            Some(b'<') => (Op::BitShl, 2),
            _ => (Op::Lt, 1),
        },
        b'!' => match b2 {
            Some(b'=') => (Op::NotEq, 2),
            _ => (Op::Not, 1),
        },
        b'|' => match b2 {
            Some(b'|') => (Op::Or, 2),
            _ => (Op::BitOr, 1),
        },
        b'&' => match b2 {
            Some(b'&') => (Op::And, 2),
            _ => (Op::BitAnd, 1),
        },
        b'(' => (Op::Func, 1),
        b'{' => (Op::Block, 1),
        b',' => (Op::ArgList, 1),
        b'?' => match b2 {
            Some(b'?') => (Op::IfRet, 2),
            _ => (Op::If, 1),
        },
        b'@' => (Op::Foreach, 1),
        b':' => match b2 {
            Some(b'=') => (Op::Assign, 2),
            _ => (Op::Else, 1),
        },
        _ => return Op::None,
    };
    *pos += width;
    op
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multichar_tokens() {
        let cases: &[(&str, Op)] = &[
            (":=", Op::Assign),
            (":", Op::Else),
            ("??", Op::IfRet),
            ("?", Op::If),
            ("##", Op::GVar),
            ("#", Op::Var),
            (">=", Op::GtEq),
            (">>", Op::BitShr),
            (">", Op::Gt),
            ("!=", Op::NotEq),
            ("!", Op::Not),
            ("&&", Op::And),
            ("&", Op::BitAnd),
            ("||", Op::Or),
            ("|", Op::BitOr),
        ];
        for (txt, want) in cases {
            let mut pos = 0;
            assert_eq!(parse_optype(txt.as_bytes(), &mut pos), *want, "{txt}");
            assert_eq!(pos, txt.len(), "{txt}");
        }
    }

    #[test]
    fn test_desc_table_alignment() {
        assert_eq!(desc(Op::Assign).token, ":=");
        assert_eq!(desc(Op::Func).term, ")");
        assert_eq!(desc(Op::Block).term, "}");
        assert!(desc(Op::Plus).concat);
        assert!(desc(Op::If).control);
        assert!(!desc(Op::Var).result);
        assert!(desc(Op::Multiply).precedence < desc(Op::Plus).precedence);
    }
}
