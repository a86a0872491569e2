// Global symbol table.
//
// Identifiers shared across statements (## variables and function names)
// intern into one IdxHash arena. Bytecode cells reference a global by
// `GLOBAL_BASE + value offset`; anything at or below the 16-bit bytecode
// offset ceiling is a local pointer instead.
//
// Value cell layout (fixed 8 bytes):
//     [0] kind  [1] pad  [2..4] use_count  [4..8] current value

use crate::error::ShError;
use crate::idxhash;

/// Local/global discriminator base: handles above this are global offsets.
pub const GLOBAL_BASE: u32 = 0x1_0000;

/// Stored kind of a global symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalKind {
    Int = 1,
    Char = 2,
    Func = 3,
}

impl GlobalKind {
    fn from_u8(v: u8) -> GlobalKind {
        match v {
            2 => GlobalKind::Char,
            3 => GlobalKind::Func,
            _ => GlobalKind::Int,
        }
    }
}

const VALUE_BYTES: u8 = 8;
const TOKEN_IDX_BUFFER_SIZE: usize = 512;

pub struct GlobalTable {
    buf: Vec<u8>,
}

impl GlobalTable {
    pub fn new() -> Self {
        let mut buf = vec![0u8; TOKEN_IDX_BUFFER_SIZE];
        idxhash::init(&mut buf, 16, 0, VALUE_BYTES).expect("token index buffer");
        Self { buf }
    }

    /// Intern a symbol, bumping its use count. Returns its value offset.
    pub fn add(&mut self, name: &[u8], kind: GlobalKind) -> Result<u32, ShError> {
        match idxhash::search(&self.buf, name) {
            Ok(off) => {
                let uc = u16::from_le_bytes(self.buf[off as usize + 2..off as usize + 4].try_into().unwrap());
                self.buf[off as usize + 2..off as usize + 4].copy_from_slice(&(uc + 1).to_le_bytes());
                Ok(off)
            }
            Err(_) => {
                let off = idxhash::add(&mut self.buf, name, 0)?;
                self.buf[off as usize] = kind as u8;
                self.buf[off as usize + 2..off as usize + 4].copy_from_slice(&1u16.to_le_bytes());
                self.buf[off as usize + 4..off as usize + 8].fill(0);
                Ok(off)
            }
        }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<u32> {
        idxhash::search(&self.buf, name).ok()
    }

    pub fn kind(&self, off: u32) -> GlobalKind {
        GlobalKind::from_u8(self.buf[off as usize])
    }

    pub fn value(&self, off: u32) -> u32 {
        u32::from_le_bytes(self.buf[off as usize + 4..off as usize + 8].try_into().unwrap())
    }

    pub fn set_value(&mut self, off: u32, v: u32) {
        self.buf[off as usize + 4..off as usize + 8].copy_from_slice(&v.to_le_bytes());
    }

    pub fn use_count(&self, off: u32) -> u16 {
        u16::from_le_bytes(self.buf[off as usize + 2..off as usize + 4].try_into().unwrap())
    }

    /// Recover the interned identifier for a value offset.
    pub fn name_of(&self, off: u32) -> &[u8] {
        idxhash::v2key(&self.buf, off)
    }
}

impl Default for GlobalTable {
    fn default() -> Self {
        Self::new()
    }
}
