//! The x86-64 register set.

use crate::regalloc::RegT;
use strum::{EnumCount, FromRepr};

/// The allocatable general-purpose registers. The stack and frame pointers, and the registers
/// the code generator keeps for itself (scratch and context), are deliberately absent.
#[derive(Clone, Copy, Debug, EnumCount, FromRepr, PartialEq)]
// If the `repr` changes from `u8`, the `as` in `Reg::regidx()` will also need updating.
#[repr(u8)]
pub enum Reg {
    RAX = 0,
    RBX,
    RCX,
    RDX,
    RSI,
    RDI,
    R8,
    R9,
    R11,
    R12,
    R15,
}

index_vec::define_index_type! {
    pub struct RegIdx = u8;
    IMPL_RAW_CONVERSIONS = true;
}

impl RegT for Reg {
    type RegIdx = RegIdx;
    const MAX_REGIDX: RegIdx = RegIdx::from_usize_unchecked(Reg::COUNT);

    fn from_regidx(idx: RegIdx) -> Self {
        Reg::from_repr(idx.raw()).unwrap()
    }

    fn regidx(&self) -> RegIdx {
        RegIdx::from(*self as u8)
    }
}

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Reg::RAX => "rax",
            Reg::RBX => "rbx",
            Reg::RCX => "rcx",
            Reg::RDX => "rdx",
            Reg::RSI => "rsi",
            Reg::RDI => "rdi",
            Reg::R8 => "r8",
            Reg::R9 => "r9",
            Reg::R11 => "r11",
            Reg::R12 => "r12",
            Reg::R15 => "r15",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use index_vec::Idx;

    #[test]
    fn regidx_roundtrips() {
        for w in 0..Reg::COUNT {
            let idx = RegIdx::from_usize(w);
            assert_eq!(Reg::from_regidx(idx).regidx(), idx);
        }
    }

    #[test]
    fn display_names() {
        assert_eq!(Reg::RAX.to_string(), "rax");
        assert_eq!(Reg::R15.to_string(), "r15");
        assert_eq!(Reg::MAX_REGIDX.index(), 11);
    }
}
