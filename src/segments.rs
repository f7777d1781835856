//! Segment abstraction (spec §3, §4.3, §9 / C3).
//!
//! A segment is a tagged variant rather than a trait-object hierarchy
//! (spec §9's explicit design note): `Real`, `Vm86`, `DescriptorTable`
//! (GDTR/IDTR — base+limit, no selector), and the protected-mode
//! descriptor-backed variants. Common accessors dispatch on the tag; the
//! gate-specific fields live in the variant payload.

use crate::exception::Exception;
use crate::mem::AddressSpace;

/// Raw access-byte bits, matching the hardware layout (type[3:0], S, DPL,
/// P) — grounded in the teacher crate's `access: u8` descriptor-cache
/// field, which this crate reuses as the payload inside each protected-mode
/// variant instead of flattening every segment to one shape.
pub mod access {
    pub const PRESENT: u8 = 1 << 7;
    pub const DPL_SHIFT: u8 = 5;
    pub const DPL_MASK: u8 = 0b11 << DPL_SHIFT;
    pub const S_CODE_DATA: u8 = 1 << 4;
    pub const TYPE_MASK: u8 = 0x0F;
}

/// Descriptor-cache payload shared by every protected-mode data/code
/// segment variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct DescriptorCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// Raw access byte (type/S/DPL/P), spec §4.3.
    pub access: u8,
    /// D/B default-operand-size bit.
    pub default_size: bool,
}

impl DescriptorCache {
    pub fn dpl(&self) -> u8 {
        (self.access & access::DPL_MASK) >> access::DPL_SHIFT
    }

    pub fn present(&self) -> bool {
        self.access & access::PRESENT != 0
    }

    pub fn rpl(&self) -> u8 {
        (self.selector & 0x3) as u8
    }
}

/// Call-gate / task-gate payload (spec §4.5/§4.7).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct GateCache {
    pub selector: u16,
    pub target_selector: u16,
    pub target_offset: u32,
    pub dpl: u8,
    pub present: bool,
    pub parameter_count: u8,
}

/// Whether a code segment is conforming (spec §4.5 privilege rules).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CodeKind {
    NonConforming,
    Conforming,
}

/// Whether a data segment expands up or down (spec §4.3's `checkAddress`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataKind {
    Up,
    ExpandDown,
}

/// The full tagged-variant taxonomy (spec §9's explicit design note).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Segment {
    Null,
    /// Real mode: base = selector << 4, limit = 0xFFFF (spec §3, invariant
    /// in spec §8).
    Real { selector: u16 },
    /// Virtual-8086: same base/limit rule as real mode, but the
    /// Processor routes accesses through linear memory with DPL=3 (spec
    /// §4.3).
    Vm86 { selector: u16 },
    /// GDTR/IDTR: base+limit only, no selector (spec §3).
    DescriptorTable { base: u32, limit: u32 },
    Data {
        desc: DescriptorCache,
        kind: DataKind,
        writable: bool,
    },
    Code {
        desc: DescriptorCache,
        kind: CodeKind,
    },
    Ldt(DescriptorCache),
    Tss16(DescriptorCache),
    Tss32(DescriptorCache),
    InterruptGate16(GateCache),
    InterruptGate32(GateCache),
    TrapGate16(GateCache),
    TrapGate32(GateCache),
    CallGate16(GateCache),
    CallGate32(GateCache),
    TaskGate(GateCache),
}

/// Reason a selector load is happening, used only to decide whether NULL is
/// acceptable (spec §3: CS/SS may never be NULL; DS/ES/FS/GS may).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadReason {
    Cs,
    Ss,
    DataOrIndex,
}

impl Segment {
    pub fn real_mode(selector: u16) -> Segment {
        Segment::Real { selector }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Segment::Null)
    }

    pub fn selector(&self) -> u16 {
        match self {
            Segment::Null => 0,
            Segment::Real { selector } | Segment::Vm86 { selector } => *selector,
            Segment::DescriptorTable { .. } => 0,
            Segment::Data { desc, .. } | Segment::Code { desc, .. } => desc.selector,
            Segment::Ldt(d) | Segment::Tss16(d) | Segment::Tss32(d) => d.selector,
            Segment::InterruptGate16(g)
            | Segment::InterruptGate32(g)
            | Segment::TrapGate16(g)
            | Segment::TrapGate32(g)
            | Segment::CallGate16(g)
            | Segment::CallGate32(g)
            | Segment::TaskGate(g) => g.selector,
        }
    }

    /// Sets the selector's RPL field in place (spec §4.6: "Always sets
    /// target.RPL := CPL after load").
    pub fn set_rpl(&mut self, rpl: u8) {
        let set = |sel: &mut u16| *sel = (*sel & !0x3) | (rpl as u16 & 0x3);
        match self {
            Segment::Real { selector } | Segment::Vm86 { selector } => set(selector),
            Segment::Data { desc, .. } | Segment::Code { desc, .. } => set(&mut desc.selector),
            Segment::Ldt(d) | Segment::Tss16(d) | Segment::Tss32(d) => set(&mut d.selector),
            _ => {}
        }
    }

    pub fn base(&self) -> u32 {
        match self {
            Segment::Null => 0,
            Segment::Real { selector } | Segment::Vm86 { selector } => (*selector as u32) << 4,
            Segment::DescriptorTable { base, .. } => *base,
            Segment::Data { desc, .. } | Segment::Code { desc, .. } => desc.base,
            Segment::Ldt(d) | Segment::Tss16(d) | Segment::Tss32(d) => d.base,
            _ => 0,
        }
    }

    pub fn limit(&self) -> u32 {
        match self {
            Segment::Null => 0,
            Segment::Real { .. } | Segment::Vm86 { .. } => 0xFFFF,
            Segment::DescriptorTable { limit, .. } => *limit,
            Segment::Data { desc, .. } | Segment::Code { desc, .. } => desc.limit,
            Segment::Ldt(d) | Segment::Tss16(d) | Segment::Tss32(d) => d.limit,
            _ => 0,
        }
    }

    pub fn dpl(&self) -> u8 {
        match self {
            Segment::Data { desc, .. } | Segment::Code { desc, .. } => desc.dpl(),
            Segment::Ldt(d) | Segment::Tss16(d) | Segment::Tss32(d) => d.dpl(),
            Segment::InterruptGate16(g)
            | Segment::InterruptGate32(g)
            | Segment::TrapGate16(g)
            | Segment::TrapGate32(g)
            | Segment::CallGate16(g)
            | Segment::CallGate32(g)
            | Segment::TaskGate(g) => g.dpl,
            Segment::Vm86 { .. } => 3,
            _ => 0,
        }
    }

    pub fn is_present(&self) -> bool {
        match self {
            Segment::Null => false,
            Segment::Real { .. } | Segment::Vm86 { .. } | Segment::DescriptorTable { .. } => true,
            Segment::Data { desc, .. } | Segment::Code { desc, .. } => desc.present(),
            Segment::Ldt(d) | Segment::Tss16(d) | Segment::Tss32(d) => d.present(),
            Segment::InterruptGate16(g)
            | Segment::InterruptGate32(g)
            | Segment::TrapGate16(g)
            | Segment::TrapGate32(g)
            | Segment::CallGate16(g)
            | Segment::CallGate32(g)
            | Segment::TaskGate(g) => g.present,
        }
    }

    pub fn is_system(&self) -> bool {
        !matches!(self, Segment::Data { .. } | Segment::Code { .. })
    }

    pub fn is_conforming_code(&self) -> bool {
        matches!(
            self,
            Segment::Code {
                kind: CodeKind::Conforming,
                ..
            }
        )
    }

    pub fn is_writable_data(&self) -> bool {
        matches!(self, Segment::Data { writable: true, .. })
    }

    /// `checkAddress` (spec §4.3): up segments require `offset <= limit`;
    /// expand-down (stack-style) data segments require `offset > limit`.
    pub fn check_address(&self, offset: u32) -> Result<(), Exception> {
        let ok = match self {
            Segment::Data {
                kind: DataKind::ExpandDown,
                desc,
                ..
            } => offset > desc.limit,
            _ => offset <= self.limit(),
        };
        if ok {
            Ok(())
        } else {
            Err(Exception::gp(self.selector()))
        }
    }

    /// Resolves `linear = base + offset` after a bounds check. Paging, if
    /// any, happens in the `AddressSpace` backend this linear address is
    /// then handed to (spec §4.3's `translateRead/WriteAddr`).
    pub fn translate(&self, offset: u32) -> Result<u32, Exception> {
        self.check_address(offset)?;
        Ok(self.base().wrapping_add(offset))
    }

    pub fn get_byte(&self, mem: &mut dyn AddressSpace, offset: u32) -> Result<u8, Exception> {
        mem.get_byte(self.translate(offset)?)
    }
    pub fn get_word(&self, mem: &mut dyn AddressSpace, offset: u32) -> Result<u16, Exception> {
        mem.get_word(self.translate(offset)?)
    }
    pub fn get_dword(&self, mem: &mut dyn AddressSpace, offset: u32) -> Result<u32, Exception> {
        mem.get_dword(self.translate(offset)?)
    }
    pub fn set_byte(
        &self,
        mem: &mut dyn AddressSpace,
        offset: u32,
        value: u8,
    ) -> Result<(), Exception> {
        mem.set_byte(self.translate(offset)?, value)
    }
    pub fn set_word(
        &self,
        mem: &mut dyn AddressSpace,
        offset: u32,
        value: u16,
    ) -> Result<(), Exception> {
        mem.set_word(self.translate(offset)?, value)
    }
    pub fn set_dword(
        &self,
        mem: &mut dyn AddressSpace,
        offset: u32,
        value: u32,
    ) -> Result<(), Exception> {
        mem.set_dword(self.translate(offset)?, value)
    }
}

/// Decodes a raw 8-byte GDT/LDT descriptor into a `Segment` variant.
/// Malformed combinations (reserved type values in a context that requires
/// a specific family) surface as `#GP(selector)` per spec §4.3.
pub fn decode_descriptor(selector: u16, raw: u64) -> Result<Segment, Exception> {
    let limit_raw = (raw & 0xFFFF) | (((raw >> 48) & 0xF) << 16);
    let base = ((raw >> 16) & 0xFFFF) | (((raw >> 32) & 0xFF) << 16) | (((raw >> 56) & 0xFF) << 24);
    let access = ((raw >> 40) & 0xFF) as u8;
    let flags = ((raw >> 52) & 0xF) as u8;
    let granularity = flags & 0x8 != 0;
    let default_size = flags & 0x4 != 0;
    let limit = if granularity {
        (limit_raw << 12) | 0xFFF
    } else {
        limit_raw
    } as u32;
    let base = base as u32;

    let typ = access & access::TYPE_MASK;
    let is_code_data = access & access::S_CODE_DATA != 0;
    let desc = DescriptorCache {
        selector,
        base,
        limit,
        access,
        default_size,
    };

    if is_code_data {
        if typ & 0x8 != 0 {
            let kind = if typ & 0x4 != 0 {
                CodeKind::Conforming
            } else {
                CodeKind::NonConforming
            };
            Ok(Segment::Code { desc, kind })
        } else {
            let kind = if typ & 0x4 != 0 {
                DataKind::ExpandDown
            } else {
                DataKind::Up
            };
            let writable = typ & 0x2 != 0;
            Ok(Segment::Data {
                desc,
                kind,
                writable,
            })
        }
    } else {
        match typ {
            0x1 | 0x3 => Ok(Segment::Tss16(desc)),
            0x2 => Ok(Segment::Ldt(desc)),
            0x5 => Ok(Segment::TaskGate(GateCache {
                selector,
                target_selector: (raw & 0xFFFF) as u16,
                target_offset: 0,
                dpl: desc.dpl(),
                present: desc.present(),
                parameter_count: 0,
            })),
            0x4 => Ok(Segment::CallGate16(decode_gate16(selector, raw, desc))),
            0x6 => Ok(Segment::InterruptGate16(decode_gate16(selector, raw, desc))),
            0x7 => Ok(Segment::TrapGate16(decode_gate16(selector, raw, desc))),
            0x9 | 0xB => Ok(Segment::Tss32(desc)),
            0xC => Ok(Segment::CallGate32(decode_gate32(selector, raw, desc))),
            0xE => Ok(Segment::InterruptGate32(decode_gate32(selector, raw, desc))),
            0xF => Ok(Segment::TrapGate32(decode_gate32(selector, raw, desc))),
            _ => Err(Exception::gp(selector)),
        }
    }
}

fn decode_gate16(selector: u16, raw: u64, desc: DescriptorCache) -> GateCache {
    let target_selector = ((raw >> 16) & 0xFFFF) as u16;
    let offset_lo = (raw & 0xFFFF) as u32;
    GateCache {
        selector,
        target_selector,
        target_offset: offset_lo,
        dpl: desc.dpl(),
        present: desc.present(),
        parameter_count: (raw & 0x1F) as u8,
    }
}

fn decode_gate32(selector: u16, raw: u64, desc: DescriptorCache) -> GateCache {
    let target_selector = ((raw >> 16) & 0xFFFF) as u16;
    let offset_lo = (raw & 0xFFFF) as u32;
    let offset_hi = ((raw >> 48) & 0xFFFF) as u32;
    GateCache {
        selector,
        target_selector,
        target_offset: offset_lo | (offset_hi << 16),
        dpl: desc.dpl(),
        present: desc.present(),
        parameter_count: (raw & 0x1F) as u8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_raw(
        base: u32,
        limit_raw: u32,
        typ: u8,
        s: bool,
        dpl: u8,
        present: bool,
        db: bool,
        g: bool,
    ) -> u64 {
        let mut raw = 0u64;
        raw |= (limit_raw & 0xFFFF) as u64;
        raw |= ((base & 0xFFFF) as u64) << 16;
        raw |= (((base >> 16) & 0xFF) as u64) << 32;
        let access = (typ as u64)
            | ((s as u64) << 4)
            | (((dpl as u64) & 0x3) << 5)
            | ((present as u64) << 7);
        raw |= access << 40;
        raw |= (((limit_raw >> 16) & 0xF) as u64) << 48;
        let flags = ((db as u64) << 2) | ((g as u64) << 3);
        raw |= flags << 52;
        raw |= (((base >> 24) & 0xFF) as u64) << 56;
        raw
    }

    #[test]
    fn real_mode_base_and_limit_invariant() {
        let s = Segment::real_mode(0x1234);
        assert_eq!(s.base(), 0x12340);
        assert_eq!(s.limit(), 0xFFFF);
    }

    #[test]
    fn decode_data_segment_non_conforming_writable() {
        let raw = make_raw(0x1000, 0xFFF, 0b0011, true, 0, true, true, false);
        let seg = decode_descriptor(0x08, raw).unwrap();
        match seg {
            Segment::Data {
                desc,
                writable,
                kind,
            } => {
                assert_eq!(desc.base, 0x1000);
                assert_eq!(desc.limit, 0xFFF);
                assert!(writable);
                assert_eq!(kind, DataKind::Up);
            }
            _ => panic!("expected data segment"),
        }
    }

    #[test]
    fn decode_call_gate32() {
        // type 0xC = 32-bit call gate; selector at bits 16..32, offset split
        // low 16 / high 16 at bits 48..64.
        let mut raw = 0u64;
        raw |= 0x2000u64; // offset low
        raw |= 0x0008u64 << 16; // target selector
        let access = 0xCu64 | (0u64 << 4) | (0u64 << 5) | (1u64 << 7);
        raw |= access << 40;
        raw |= 0x1u64 << 48; // offset high
        let seg = decode_descriptor(0x10, raw).unwrap();
        match seg {
            Segment::CallGate32(g) => {
                assert_eq!(g.target_selector, 0x08);
                assert_eq!(g.target_offset, 0x0001_2000);
                assert!(g.present);
            }
            _ => panic!("expected 32-bit call gate"),
        }
    }

    #[test]
    fn expand_down_check_address_inverts_bound() {
        let desc = DescriptorCache {
            selector: 0x10,
            base: 0,
            limit: 0x2000,
            access: access::PRESENT | access::S_CODE_DATA,
            default_size: true,
        };
        let seg = Segment::Data {
            desc,
            kind: DataKind::ExpandDown,
            writable: true,
        };
        assert!(seg.check_address(0x2001).is_ok());
        assert!(seg.check_address(0x1000).is_err());
    }
}
