//! Lazy-evaluated arithmetic flags (spec §4.2 / C2, design note in §9).
//!
//! The six arithmetic flags (OF, SF, ZF, AF, PF, CF) are not recomputed on
//! every ALU op. Instead the last op's operands/result/kind are recorded
//! and a `status` bitmask marks which flags are still "dirty" (computed
//! lazily on read). The direct EFLAGS control bits (TF, IF, DF, IOPL, NT,
//! RF, VM, AC, VIF, VIP, ID) are stored as plain fields alongside.

/// One bit per lazily-evaluated flag, used both as the "dirty" mask in
/// `LazyFlags::status` and as a bit position when composing masks for
/// `setEFlags` callers.
pub mod bit {
    pub const CF: u8 = 1 << 0;
    pub const PF: u8 = 1 << 1;
    pub const AF: u8 = 1 << 2;
    pub const ZF: u8 = 1 << 3;
    pub const SF: u8 = 1 << 4;
    pub const OF: u8 = 1 << 5;
    pub const ALL: u8 = CF | PF | AF | ZF | SF | OF;
}

/// EFLAGS bit positions for the reserved/control bits this core models.
pub mod eflags {
    pub const CF: u32 = 1 << 0;
    pub const RESERVED1: u32 = 1 << 1;
    pub const PF: u32 = 1 << 2;
    pub const AF: u32 = 1 << 4;
    pub const ZF: u32 = 1 << 6;
    pub const SF: u32 = 1 << 7;
    pub const TF: u32 = 1 << 8;
    pub const IF: u32 = 1 << 9;
    pub const DF: u32 = 1 << 10;
    pub const OF: u32 = 1 << 11;
    pub const IOPL_SHIFT: u32 = 12;
    pub const IOPL_MASK: u32 = 0b11 << IOPL_SHIFT;
    pub const NT: u32 = 1 << 14;
    pub const RF: u32 = 1 << 16;
    pub const VM: u32 = 1 << 17;
    pub const AC: u32 = 1 << 18;
    pub const VIF: u32 = 1 << 19;
    pub const VIP: u32 = 1 << 20;
    pub const ID: u32 = 1 << 21;
}

/// Every arithmetic/logical/shift form that contributes to flag semantics
/// (spec §4.2: "`kind` enumerates every arithmetic/logical/shift form").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    Add8,
    Add16,
    Add32,
    Adc8,
    Adc16,
    Adc32,
    Sub8,
    Sub16,
    Sub32,
    Sbb8,
    Sbb16,
    Sbb32,
    Neg8,
    Neg16,
    Neg32,
    Inc8,
    Inc16,
    Inc32,
    Dec8,
    Dec16,
    Dec32,
    And8,
    And16,
    And32,
    Or8,
    Or16,
    Or32,
    Xor8,
    Xor16,
    Xor32,
    Shl8,
    Shl16,
    Shl32,
    Shr8,
    Shr16,
    Shr32,
    Sar8,
    Sar16,
    Sar32,
    Shld16,
    Shld32,
    Shrd16,
    Shrd32,
    Imul8,
    Imul16,
    Imul32,
}

impl Kind {
    fn width(self) -> u32 {
        use Kind::*;
        match self {
            Add8 | Adc8 | Sub8 | Sbb8 | Neg8 | Inc8 | Dec8 | And8 | Or8 | Xor8 | Shl8 | Shr8
            | Sar8 | Imul8 => 8,
            Add16 | Adc16 | Sub16 | Sbb16 | Neg16 | Inc16 | Dec16 | And16 | Or16 | Xor16
            | Shl16 | Shr16 | Sar16 | Shld16 | Shrd16 | Imul16 => 16,
            _ => 32,
        }
    }

    fn sign_bit(self) -> u32 {
        1 << (self.width() - 1)
    }

    fn mask(self) -> u32 {
        if self.width() == 32 {
            u32::MAX
        } else {
            (1u32 << self.width()) - 1
        }
    }

    fn is_logical(self) -> bool {
        use Kind::*;
        matches!(
            self,
            And8 | And16 | And32 | Or8 | Or16 | Or32 | Xor8 | Xor16 | Xor32
        )
    }

    fn is_shift(self) -> bool {
        use Kind::*;
        matches!(
            self,
            Shl8 | Shl16 | Shl32
                | Shr8
                | Shr16
                | Shr32
                | Sar8
                | Sar16
                | Sar32
                | Shld16
                | Shld32
                | Shrd16
                | Shrd32
        )
    }
}

/// `(op1, op2, result, kind)` plus a dirty-bit mask (spec §4.2/§9).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LazyFlags {
    op1: u32,
    op2: u32,
    result: u32,
    kind: Kind,
    /// Bit set => flag is dirty (compute from op1/op2/result/kind on read).
    /// Bit clear => the corresponding `stored` bit is authoritative.
    status: u8,
    stored: u8,
}

impl Default for LazyFlags {
    fn default() -> Self {
        LazyFlags {
            op1: 0,
            op2: 0,
            result: 0,
            kind: Kind::Add32,
            status: 0,
            stored: 0,
        }
    }
}

impl LazyFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the operands/result/kind of the op just executed and marks
    /// all six arithmetic flags dirty.
    pub fn record(&mut self, op1: u32, op2: u32, result: u32, kind: Kind) {
        self.op1 = op1;
        self.op2 = op2;
        self.result = result;
        self.kind = kind;
        self.status |= bit::ALL;
    }

    /// Directly sets one flag to a concrete value, clearing its dirty bit
    /// (so subsequent reads return the stored value verbatim).
    pub fn set_flag(&mut self, flag_bit: u8, value: bool) {
        self.status &= !flag_bit;
        if value {
            self.stored |= flag_bit;
        } else {
            self.stored &= !flag_bit;
        }
    }

    pub fn get_flag(&self, flag_bit: u8) -> bool {
        if self.status & flag_bit != 0 {
            self.compute(flag_bit)
        } else {
            self.stored & flag_bit != 0
        }
    }

    pub fn cf(&self) -> bool {
        self.get_flag(bit::CF)
    }
    pub fn pf(&self) -> bool {
        self.get_flag(bit::PF)
    }
    pub fn af(&self) -> bool {
        self.get_flag(bit::AF)
    }
    pub fn zf(&self) -> bool {
        self.get_flag(bit::ZF)
    }
    pub fn sf(&self) -> bool {
        self.get_flag(bit::SF)
    }
    pub fn of(&self) -> bool {
        self.get_flag(bit::OF)
    }

    pub fn set_cf(&mut self, v: bool) {
        self.set_flag(bit::CF, v)
    }
    pub fn set_pf(&mut self, v: bool) {
        self.set_flag(bit::PF, v)
    }
    pub fn set_af(&mut self, v: bool) {
        self.set_flag(bit::AF, v)
    }
    pub fn set_zf(&mut self, v: bool) {
        self.set_flag(bit::ZF, v)
    }
    pub fn set_sf(&mut self, v: bool) {
        self.set_flag(bit::SF, v)
    }
    pub fn set_of(&mut self, v: bool) {
        self.set_flag(bit::OF, v)
    }

    fn compute(&self, flag_bit: u8) -> bool {
        let k = self.kind;
        let (op1, op2, result) = (self.op1, self.op2, self.result);
        let mask = k.mask();
        let masked_result = result & mask;
        match flag_bit {
            b if b == bit::ZF => masked_result == 0,
            b if b == bit::SF => masked_result & k.sign_bit() != 0,
            b if b == bit::PF => {
                // Parity is defined over the low byte of the result for
                // every kind, arithmetic or logical.
                (masked_result as u8).count_ones() % 2 == 0
            }
            b if b == bit::CF => Self::compute_cf(k, op1, op2, result, mask),
            b if b == bit::OF => Self::compute_of(k, op1, op2, result, mask),
            b if b == bit::AF => Self::compute_af(k, op1, op2, result),
            _ => false,
        }
    }

    fn compute_cf(k: Kind, op1: u32, op2: u32, result: u32, mask: u32) -> bool {
        use Kind::*;
        if k.is_logical() {
            return false;
        }
        if k.is_shift() {
            // For shifts CF is the last bit shifted out; callers that need
            // shift-CF semantics record it directly via `set_cf` instead of
            // relying on recompute, since the "last bit out" isn't
            // recoverable from (op1, op2, result) alone for SHLD/SHRD.
            // Plain SHL/SHR/SAR *are* recoverable: CF = last bit shifted
            // past the boundary.
            let width = k.width();
            return match k {
                Shl8 | Shl16 | Shl32 => {
                    if op2 == 0 || op2 > width {
                        false
                    } else {
                        (op1 >> (width - op2)) & 1 != 0
                    }
                }
                Shr8 | Shr16 | Shr32 | Sar8 | Sar16 | Sar32 => {
                    if op2 == 0 || op2 > width {
                        false
                    } else {
                        (op1 >> (op2 - 1)) & 1 != 0
                    }
                }
                _ => false,
            };
        }
        match k {
            // IMUL's CF is architecturally identical to its OF (set iff the
            // signed double-width product doesn't fit, sign-extended, into
            // the truncated single-width result); it has no relationship to
            // the unsigned-addition-overflow test below.
            Imul8 | Imul16 | Imul32 => Self::compute_of(k, op1, op2, result, mask),
            Add8 | Add16 | Add32 | Adc8 | Adc16 | Adc32 => {
                (op1 & mask) as u64 + (op2 & mask) as u64 > mask as u64
            }
            Sub8 | Sub16 | Sub32 | Sbb8 | Sbb16 | Sbb32 => (op1 & mask) < (op2 & mask),
            Neg8 | Neg16 | Neg32 => (op1 & mask) != 0,
            Inc8 | Inc16 | Inc32 | Dec8 | Dec16 | Dec32 => false, // INC/DEC never touch CF
            _ => (result & !mask) != 0,
        }
    }

    /// Interprets `masked_value` (already truncated to `width` bits) as a
    /// signed quantity of that width, sign-extended to `i64`.
    fn sign_extend(masked_value: u32, width: u32) -> i64 {
        let sign_bit = 1u32 << (width - 1);
        if masked_value & sign_bit != 0 {
            masked_value as i64 - (1i64 << width)
        } else {
            masked_value as i64
        }
    }

    fn compute_of(k: Kind, op1: u32, op2: u32, result: u32, mask: u32) -> bool {
        use Kind::*;
        if k.is_logical() {
            return false;
        }
        let sign = k.sign_bit();
        let (o1, o2, r) = (op1 & mask, op2 & mask, result & mask);
        match k {
            Add8 | Add16 | Add32 | Adc8 | Adc16 | Adc32 => {
                ((o1 ^ r) & (o2 ^ r) & sign) != 0
            }
            Sub8 | Sub16 | Sub32 | Sbb8 | Sbb16 | Sbb32 => ((o1 ^ o2) & (o1 ^ r) & sign) != 0,
            Inc8 | Inc16 | Inc32 => o1 == sign.wrapping_sub(1),
            Dec8 | Dec16 | Dec32 => o1 == sign,
            Neg8 | Neg16 | Neg32 => o1 == sign,
            Shl8 | Shl16 | Shl32 => {
                if op2 == 1 {
                    ((o1 >> (k.width() - 1)) & 1) != ((r >> (k.width() - 1)) & 1)
                } else {
                    false
                }
            }
            Shr8 | Shr16 | Shr32 => {
                if op2 == 1 {
                    (o1 & sign) != 0
                } else {
                    false
                }
            }
            Sar8 | Sar16 | Sar32 => false,
            Imul8 | Imul16 | Imul32 => {
                let width = k.width();
                let full = Self::sign_extend(o1, width) * Self::sign_extend(o2, width);
                let truncated = Self::sign_extend(r, width);
                full != truncated
            }
            _ => false,
        }
    }

    /// AF is defined only for the 8-bit-nibble-carry arithmetic forms. Per
    /// spec §4.2/§9, AF after a shift is architecturally undefined and this
    /// core follows the source: it returns `false` (open question,
    /// documented in DESIGN.md).
    fn compute_af(k: Kind, op1: u32, op2: u32, _result: u32) -> bool {
        use Kind::*;
        match k {
            Add8 | Add16 | Add32 | Adc8 | Adc16 | Adc32 => (op1 & 0xF) + (op2 & 0xF) > 0xF,
            Sub8 | Sub16 | Sub32 | Sbb8 | Sbb16 | Sbb32 => (op1 & 0xF) < (op2 & 0xF),
            Inc8 | Inc16 | Inc32 => (op1 & 0xF) == 0xF,
            Dec8 | Dec16 | Dec32 => (op1 & 0xF) == 0,
            Neg8 | Neg16 | Neg32 => (op1 & 0xF) != 0,
            _ => false,
        }
    }
}

/// The direct (non-lazy) EFLAGS control bits (spec §3/§4.2): TF, IF, DF,
/// IOPL, NT, RF, VM, AC, VIF, VIP, ID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EflagsControl {
    pub tf: bool,
    pub intf: bool,
    pub df: bool,
    pub iopl: u8,
    pub nt: bool,
    pub rf: bool,
    pub vm: bool,
    pub ac: bool,
    pub vif: bool,
    pub vip: bool,
    pub id: bool,
}

impl Default for EflagsControl {
    fn default() -> Self {
        EflagsControl {
            tf: false,
            intf: false,
            df: false,
            iopl: 0,
            nt: false,
            rf: false,
            vm: false,
            ac: false,
            vif: false,
            vip: false,
            id: false,
        }
    }
}

/// The full EFLAGS register: six lazily-computed arithmetic flags plus the
/// direct control bits, assembled/disassembled as one `u32` on demand
/// (spec §4.2).
#[derive(Clone, Copy, Debug, Default)]
pub struct Flags {
    pub arith: LazyFlags,
    pub control: EflagsControl,
}

impl Flags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reassembles EFLAGS on read: the six computed bits OR'd with reserved
    /// bit 1 (always 1), the direct control bits, IOPL<<12, and VM/VIF/
    /// VIP/ID (spec §4.2). Bits 3, 5, 15 are always 0 (spec §8 invariant 2).
    pub fn get_eflags(&self) -> u32 {
        let mut v = eflags::RESERVED1;
        if self.arith.cf() {
            v |= eflags::CF;
        }
        if self.arith.pf() {
            v |= eflags::PF;
        }
        if self.arith.af() {
            v |= eflags::AF;
        }
        if self.arith.zf() {
            v |= eflags::ZF;
        }
        if self.arith.sf() {
            v |= eflags::SF;
        }
        if self.arith.of() {
            v |= eflags::OF;
        }
        if self.control.tf {
            v |= eflags::TF;
        }
        if self.control.intf {
            v |= eflags::IF;
        }
        if self.control.df {
            v |= eflags::DF;
        }
        if self.control.nt {
            v |= eflags::NT;
        }
        if self.control.rf {
            v |= eflags::RF;
        }
        if self.control.vm {
            v |= eflags::VM;
        }
        if self.control.ac {
            v |= eflags::AC;
        }
        if self.control.vif {
            v |= eflags::VIF;
        }
        if self.control.vip {
            v |= eflags::VIP;
        }
        if self.control.id {
            v |= eflags::ID;
        }
        v |= (self.control.iopl as u32 & 0x3) << eflags::IOPL_SHIFT;
        v
    }

    /// Read-modify-write: only the bits set in `mask` are updated from
    /// `value`; every other bit keeps its current value (spec §4.2). Does
    /// *not* apply the VM/AC side effects (mode switch, segment rebinding)
    /// — those are the caller's (`Processor::set_eflags`) responsibility,
    /// since this type has no notion of segments or mode-switch events.
    pub fn set_eflags(&mut self, value: u32, mask: u32) {
        let current = self.get_eflags();
        let merged = (current & !mask) | (value & mask);
        self.arith.set_cf(merged & eflags::CF != 0);
        self.arith.set_pf(merged & eflags::PF != 0);
        self.arith.set_af(merged & eflags::AF != 0);
        self.arith.set_zf(merged & eflags::ZF != 0);
        self.arith.set_sf(merged & eflags::SF != 0);
        self.arith.set_of(merged & eflags::OF != 0);
        self.control.tf = merged & eflags::TF != 0;
        self.control.intf = merged & eflags::IF != 0;
        self.control.df = merged & eflags::DF != 0;
        self.control.nt = merged & eflags::NT != 0;
        self.control.rf = merged & eflags::RF != 0;
        self.control.vm = merged & eflags::VM != 0;
        self.control.ac = merged & eflags::AC != 0;
        self.control.vif = merged & eflags::VIF != 0;
        self.control.vip = merged & eflags::VIP != 0;
        self.control.id = merged & eflags::ID != 0;
        self.control.iopl = ((merged & eflags::IOPL_MASK) >> eflags::IOPL_SHIFT) as u8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_sets_zf_on_zero_result() {
        let mut f = LazyFlags::new();
        f.record(1, 0xFFFF_FFFF, 0, Kind::Add32);
        assert!(f.zf());
        assert!(f.cf());
    }

    #[test]
    fn imul8_overflow_sets_cf_equal_to_of() {
        // 127 * 2 = 254, which doesn't fit in i8 (truncates to -2): OF=CF=1.
        let mut f = LazyFlags::new();
        f.record(127, 2, 254i32 as u8 as u32, Kind::Imul8);
        assert!(f.of());
        assert!(f.cf());
    }

    #[test]
    fn imul8_in_range_clears_cf_and_of() {
        // 5 * 2 = 10, fits in i8: OF=CF=0.
        let mut f = LazyFlags::new();
        f.record(5, 2, 10, Kind::Imul8);
        assert!(!f.of());
        assert!(!f.cf());
    }

    #[test]
    fn imul8_sign_extends_negative_operand_before_multiplying() {
        // -5 (0xFB as i8) * 2 = -10, fits in i8: OF=CF=0. A buggy unsigned
        // read of 0xFB as 251 would instead see 502, which doesn't fit.
        let mut f = LazyFlags::new();
        f.record(0xFB, 2, (-10i32) as u8 as u32, Kind::Imul8);
        assert!(!f.of());
        assert!(!f.cf());
    }

    #[test]
    fn imul16_overflow_sets_cf_equal_to_of() {
        // 20000 * 2 = 40000, doesn't fit in i16.
        let mut f = LazyFlags::new();
        f.record(20000, 2, 40000u32 & 0xFFFF, Kind::Imul16);
        assert!(f.of());
        assert!(f.cf());
    }

    #[test]
    fn sub_computes_cf_as_borrow() {
        let mut f = LazyFlags::new();
        f.record(5, 10, (5u32.wrapping_sub(10)), Kind::Sub32);
        assert!(f.cf());
        assert!(!f.zf());
    }

    #[test]
    fn direct_setter_clears_dirty_bit_and_sticks() {
        let mut f = LazyFlags::new();
        f.record(1, 1, 2, Kind::Add32);
        f.set_cf(true);
        assert!(f.cf());
        // Recording a new op marks CF dirty again.
        f.record(0, 0, 0, Kind::Add32);
        assert!(!f.cf());
    }

    #[test]
    fn af_after_shift_is_false_per_open_question() {
        let mut f = LazyFlags::new();
        f.record(0b1000_0000, 1, 0b0000_0001, Kind::Shl8);
        assert!(!f.af());
    }

    #[test]
    fn logical_ops_clear_cf_and_of() {
        let mut f = LazyFlags::new();
        f.record(0xFF, 0x0F, 0x0F, Kind::And32);
        assert!(!f.cf());
        assert!(!f.of());
    }

    #[test]
    fn parity_is_over_low_byte_only() {
        let mut f = LazyFlags::new();
        f.record(0, 0, 0x100, Kind::Add32); // low byte 0x00 -> even parity
        assert!(f.pf());
        f.record(0, 0, 0x101, Kind::Add32); // low byte 0x01 -> odd parity
        assert!(!f.pf());
    }

    #[test]
    fn eflags_reserved_bit_always_set_and_reserved_zero_bits_clear() {
        let flags = Flags::new();
        let v = flags.get_eflags();
        assert_eq!(v & eflags::RESERVED1, eflags::RESERVED1);
        assert_eq!(v & ((1 << 3) | (1 << 5) | (1 << 15)), 0);
    }

    #[test]
    fn set_eflags_read_modify_write_only_touches_masked_bits() {
        let mut flags = Flags::new();
        flags.set_eflags(0xFFFF_FFFF, eflags::CF);
        assert_ne!(flags.get_eflags() & eflags::CF, 0);
        assert_eq!(flags.get_eflags() & eflags::TF, 0);
    }

    #[test]
    fn set_eflags_round_trips_iopl() {
        let mut flags = Flags::new();
        flags.set_eflags(0b11 << eflags::IOPL_SHIFT, eflags::IOPL_MASK);
        assert_eq!(flags.control.iopl, 3);
        assert_eq!(flags.get_eflags() & eflags::IOPL_MASK, eflags::IOPL_MASK);
    }
}
