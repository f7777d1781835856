//! Control-transfer engine (spec §4.5/§4.6 / C7): far call/jmp/ret, iret,
//! sysenter/sysexit, and the call-gate algorithm.
//!
//! Every far transfer is specialized by operand size (16/32) and address
//! size (16/32) — spec §4.5 describes this as "four variants per
//! operation... differ only in offset widths". Rather than writing four
//! near-identical functions per operation this crate parameterizes a single
//! function by two `bool`s (`op32`, `addr32`); see DESIGN.md.

use crate::control::{MSR_SYSENTER_CS, MSR_SYSENTER_EIP, MSR_SYSENTER_ESP};
use crate::error::InternalError;
use crate::exception::Exception;
use crate::gpr::cell;
use crate::mem::AddressSpace;
use crate::processor::{CpuMode, Processor, SegRole};
use crate::segments::{access, CodeKind, DataKind, DescriptorCache, GateCache, Segment};
use crate::task;

/// EFLAGS mask constants for `iret`'s same-level restore path (spec §4.5).
pub mod masks {
    pub const IRET_O16_SAME_LEVEL: u32 = 0x4DD5;
    pub const IRET_O32_SAME_LEVEL: u32 = 0x254DD5;
    pub const IF: u32 = 0x200;
    pub const IOPL_VM_VIF_VIP_O16: u32 = 0x3000;
    pub const IOPL_VM_VIF_VIP_O32: u32 = 0x1A3000;
}

/// Every control-transfer operation can fault architecturally or hit one of
/// the two documented unimplemented paths (spec §9 open questions); this
/// wraps both so callers can `?` through one type.
#[derive(Debug)]
pub enum TransferFault {
    Exception(Exception),
    Internal(InternalError),
}

impl From<Exception> for TransferFault {
    fn from(e: Exception) -> Self {
        TransferFault::Exception(e)
    }
}

impl From<InternalError> for TransferFault {
    fn from(e: InternalError) -> Self {
        TransferFault::Internal(e)
    }
}

pub type TransferResult<T> = Result<T, TransferFault>;

fn ss_current(cpu: &Processor, addr32: bool) -> u32 {
    if addr32 {
        cpu.gpr.read32(cell::ESP)
    } else {
        cpu.gpr.read16(cell::ESP) as u32
    }
}

fn ss_set(cpu: &mut Processor, addr32: bool, value: u32) {
    if addr32 {
        cpu.gpr.write32(cell::ESP, value);
    } else {
        cpu.gpr.write16(cell::ESP, value as u16);
    }
}

fn ss_check(cpu: &Processor, offset: u32) -> Result<(), Exception> {
    cpu.segments
        .ss
        .check_address(offset)
        .map_err(|_| Exception::ss(0u16))
}

fn push_word(cpu: &mut Processor, mem: &mut dyn AddressSpace, addr32: bool, value: u16) -> Result<(), Exception> {
    let new_sp = ss_current(cpu, addr32).wrapping_sub(2);
    ss_check(cpu, new_sp)?;
    {
        let mut backend = cpu.backend(SegRole::Other, mem);
        cpu.segments.ss.set_word(&mut backend, new_sp, value)?;
    }
    ss_set(cpu, addr32, new_sp);
    Ok(())
}

fn push_dword(cpu: &mut Processor, mem: &mut dyn AddressSpace, addr32: bool, value: u32) -> Result<(), Exception> {
    let new_sp = ss_current(cpu, addr32).wrapping_sub(4);
    ss_check(cpu, new_sp)?;
    {
        let mut backend = cpu.backend(SegRole::Other, mem);
        cpu.segments.ss.set_dword(&mut backend, new_sp, value)?;
    }
    ss_set(cpu, addr32, new_sp);
    Ok(())
}

fn pop_word(cpu: &mut Processor, mem: &mut dyn AddressSpace, addr32: bool) -> Result<u16, Exception> {
    let sp = ss_current(cpu, addr32);
    ss_check(cpu, sp)?;
    let v = {
        let mut backend = cpu.backend(SegRole::Other, mem);
        cpu.segments.ss.get_word(&mut backend, sp)?
    };
    ss_set(cpu, addr32, sp.wrapping_add(2));
    Ok(v)
}

fn pop_dword(cpu: &mut Processor, mem: &mut dyn AddressSpace, addr32: bool) -> Result<u32, Exception> {
    let sp = ss_current(cpu, addr32);
    ss_check(cpu, sp)?;
    let v = {
        let mut backend = cpu.backend(SegRole::Other, mem);
        cpu.segments.ss.get_dword(&mut backend, sp)?
    };
    ss_set(cpu, addr32, sp.wrapping_add(4));
    Ok(v)
}

fn push_operand(cpu: &mut Processor, mem: &mut dyn AddressSpace, op32: bool, addr32: bool, value: u32) -> Result<(), Exception> {
    if op32 {
        push_dword(cpu, mem, addr32, value)
    } else {
        push_word(cpu, mem, addr32, value as u16)
    }
}

fn pop_operand(cpu: &mut Processor, mem: &mut dyn AddressSpace, op32: bool, addr32: bool) -> Result<u32, Exception> {
    if op32 {
        pop_dword(cpu, mem, addr32)
    } else {
        Ok(pop_word(cpu, mem, addr32)? as u32)
    }
}

/// Rejects NULL and out-of-bounds/absent selectors with the exact boundary
/// mapping spec §8 requires: null → `#GP(0)`, bad index → `#GP(sel & ~3)`,
/// not-present → `#NP(sel)` (the latter surfaces from `get_segment` itself).
fn resolve_code_target(cpu: &Processor, selector: u16, mem: &mut dyn AddressSpace) -> Result<Segment, Exception> {
    if selector & !0x3 == 0 {
        return Err(Exception::gp(0u16));
    }
    cpu.get_segment(selector, mem)
}

/// `call far` (spec §4.5). Dispatches on the target descriptor's tag:
/// direct code segment (same-privilege rules), call gate (may change
/// privilege), or task gate/TSS (task switch, delegated to [`task`]).
pub fn call_far(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    op32: bool,
    addr32: bool,
    target_selector: u16,
    target_offset: u32,
    return_offset: u32,
) -> TransferResult<()> {
    if cpu.mode != CpuMode::Protected || cpu.flags.control.vm {
        let old_cs = cpu.segments.cs.selector() as u32;
        push_operand(cpu, mem, op32, addr32, old_cs)?;
        push_operand(cpu, mem, op32, addr32, return_offset)?;
        cpu.segments.cs = Segment::real_mode(target_selector);
        cpu.eip = if op32 { target_offset } else { target_offset & 0xFFFF };
        return Ok(());
    }

    let cpl = cpu.cpl();
    let target = resolve_code_target(cpu, target_selector, mem)?;
    match target {
        Segment::Code { desc, kind } => {
            let rpl = (target_selector & 0x3) as u8;
            let ok = match kind {
                CodeKind::NonConforming => desc.dpl() == cpl,
                CodeKind::Conforming => desc.dpl() <= cpl,
            };
            if !ok || rpl > cpl {
                return Err(Exception::gp(target_selector).into());
            }
            let old_cs = cpu.segments.cs.selector() as u32;
            push_operand(cpu, mem, op32, addr32, old_cs)?;
            push_operand(cpu, mem, op32, addr32, return_offset)?;
            cpu.set_cs(Segment::Code { desc, kind }, cpl);
            cpu.eip = if op32 { target_offset } else { target_offset & 0xFFFF };
            Ok(())
        }
        Segment::CallGate16(g) => call_through_gate(cpu, mem, false, addr32, g, return_offset),
        Segment::CallGate32(g) => call_through_gate(cpu, mem, true, addr32, g, return_offset),
        Segment::TaskGate(g) => task::switch_via_task_gate(cpu, mem, g, true).map_err(Into::into),
        Segment::Tss16(_) | Segment::Tss32(_) => {
            task::switch_via_tss_selector(cpu, mem, target_selector, true).map_err(Into::into)
        }
        _ => Err(Exception::gp(target_selector).into()),
    }
}

/// `jmp far` in protected mode (spec §4.6): like `call far` but pushes no
/// return frame. Non-conforming targets require `RPL==CPL && DPL==CPL`.
pub fn jmp_far(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    op32: bool,
    target_selector: u16,
    target_offset: u32,
) -> TransferResult<()> {
    if cpu.mode != CpuMode::Protected || cpu.flags.control.vm {
        cpu.segments.cs = Segment::real_mode(target_selector);
        cpu.eip = if op32 { target_offset } else { target_offset & 0xFFFF };
        return Ok(());
    }
    let cpl = cpu.cpl();
    let target = resolve_code_target(cpu, target_selector, mem)?;
    match target {
        Segment::Code { desc, kind } => {
            let rpl = (target_selector & 0x3) as u8;
            let ok = match kind {
                CodeKind::NonConforming => rpl == cpl && desc.dpl() == cpl,
                CodeKind::Conforming => desc.dpl() <= cpl,
            };
            if !ok {
                return Err(Exception::gp(target_selector).into());
            }
            cpu.set_cs(Segment::Code { desc, kind }, cpl);
            cpu.eip = if op32 { target_offset } else { target_offset & 0xFFFF };
            Ok(())
        }
        Segment::CallGate16(g) | Segment::CallGate32(g) => {
            // jmp through a call gate never changes privilege or pushes a
            // return frame; reuse the gate's resolved target directly.
            let target_cs = resolve_code_target(cpu, g.target_selector, mem)?;
            match target_cs {
                Segment::Code { desc, kind } => {
                    cpu.set_cs(Segment::Code { desc, kind }, cpl);
                    cpu.eip = g.target_offset;
                    Ok(())
                }
                _ => Err(Exception::gp(g.target_selector).into()),
            }
        }
        Segment::TaskGate(g) => task::switch_via_task_gate(cpu, mem, g, false).map_err(Into::into),
        Segment::Tss16(_) | Segment::Tss32(_) => {
            task::switch_via_tss_selector(cpu, mem, target_selector, false).map_err(Into::into)
        }
        _ => Err(Exception::gp(target_selector).into()),
    }
}

/// The call-gate algorithm (spec §4.5, written for O16_A16; generalized
/// here over operand width via `gate32`). The 16-bit-gate, same-privilege
/// ("outer-to-same") path is the one documented unimplemented case (spec
/// §9 open questions) — it returns `TransferFault::Internal`.
fn call_through_gate(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    gate32: bool,
    addr32: bool,
    gate: GateCache,
    return_offset: u32,
) -> TransferResult<()> {
    let cpl = cpu.cpl();
    let rpl = (gate.selector & 0x3) as u8;
    if gate.dpl < cpl.max(rpl) || !gate.present {
        return Err(if gate.present {
            Exception::gp(gate.selector).into()
        } else {
            Exception::np(gate.selector).into()
        });
    }
    let target = resolve_code_target(cpu, gate.target_selector, mem)?;
    let (desc, kind) = match target {
        Segment::Code { desc, kind } => (desc, kind),
        _ => return Err(Exception::gp(gate.target_selector).into()),
    };
    if desc.dpl() > cpl {
        return Err(Exception::gp(gate.target_selector).into());
    }

    if desc.dpl() < cpl {
        // Inner-privilege call: new stack from the current TSS.
        if !gate32 {
            return Err(InternalError::Unimplemented(
                "16-bit call-gate outer-to-same / inner-privilege path",
            )
            .into());
        }
        let (new_ss_sel, new_esp) = task::tss_stack_for_level(cpu, mem, desc.dpl())?;
        let new_ss = resolve_code_target(cpu, new_ss_sel, mem)?;
        let new_ss = match new_ss {
            Segment::Data { desc: ssd, writable: true, .. } if (new_ss_sel & 0x3) == desc.dpl() && ssd.dpl() == desc.dpl() && ssd.present() => {
                Segment::Data { desc: ssd, writable: true, kind: DataKind::Up }
            }
            _ => return Err(Exception::ss(new_ss_sel).into()),
        };

        let old_ss = cpu.segments.ss;
        let old_esp = cpu.gpr.read32(cell::ESP);
        let old_cs = cpu.segments.cs.selector() as u32;

        // Gather the caller's parameters before switching stacks.
        let mut params = Vec::with_capacity(gate.parameter_count as usize);
        for i in 0..gate.parameter_count as u32 {
            let off = old_esp.wrapping_add(i * 4);
            old_ss.check_address(off).map_err(|_| Exception::ss(0u16))?;
            let mut backend = cpu.backend(SegRole::Other, mem);
            params.push(old_ss.get_dword(&mut backend, off)?);
        }

        cpu.segments.ss = new_ss;
        cpu.gpr.write32(cell::ESP, new_esp);

        for &p in params.iter().rev() {
            push_dword(cpu, mem, true, p)?;
        }
        push_dword(cpu, mem, true, old_ss.selector() as u32)?;
        push_dword(cpu, mem, true, old_esp)?;
        push_dword(cpu, mem, true, old_cs)?;
        push_dword(cpu, mem, true, return_offset)?;

        cpu.set_cs(Segment::Code { desc, kind }, desc.dpl());
        cpu.eip = gate.target_offset;
        Ok(())
    } else {
        // Same-privilege / conforming-same-level: ordinary stack-frame push.
        let old_cs = cpu.segments.cs.selector() as u32;
        push_operand(cpu, mem, gate32, addr32, old_cs)?;
        push_operand(cpu, mem, gate32, addr32, return_offset)?;
        cpu.set_cs(Segment::Code { desc, kind }, cpl);
        cpu.eip = gate.target_offset;
        Ok(())
    }
}

/// `ret far` (spec §4.5/§8). Outer-level returns to a *conforming* code
/// segment are the documented unimplemented path (spec §9).
pub fn ret_far(cpu: &mut Processor, mem: &mut dyn AddressSpace, op32: bool, addr32: bool) -> TransferResult<()> {
    if cpu.mode != CpuMode::Protected || cpu.flags.control.vm {
        let offset = pop_operand(cpu, mem, op32, addr32)?;
        let selector = pop_operand(cpu, mem, op32, addr32)? as u16;
        cpu.segments.cs = Segment::real_mode(selector);
        cpu.eip = offset;
        return Ok(());
    }

    let cpl = cpu.cpl();
    let offset = pop_operand(cpu, mem, op32, addr32)?;
    let selector = pop_operand(cpu, mem, op32, addr32)? as u16;
    let target = resolve_code_target(cpu, selector, mem)?;
    let (desc, kind) = match target {
        Segment::Code { desc, kind } => (desc, kind),
        _ => return Err(Exception::gp(selector).into()),
    };
    let target_rpl = (selector & 0x3) as u8;
    if target_rpl < cpl {
        return Err(Exception::gp(selector).into());
    }

    if target_rpl == cpl {
        cpu.set_cs(Segment::Code { desc, kind }, cpl);
        cpu.eip = offset;
        return Ok(());
    }

    if matches!(kind, CodeKind::Conforming) {
        return Err(InternalError::Unimplemented("conforming-code outer-privilege ret far").into());
    }

    let new_esp = pop_operand(cpu, mem, op32, addr32)?;
    let new_ss_sel = pop_operand(cpu, mem, op32, addr32)? as u16;
    let new_ss = validate_outer_ss(cpu, mem, new_ss_sel, target_rpl)?;

    cpu.segments.ss = new_ss;
    ss_set(cpu, true, new_esp);
    cpu.set_cs(Segment::Code { desc, kind }, target_rpl);
    cpu.eip = offset;
    invalidate_stale_data_segments(cpu, target_rpl);
    Ok(())
}

/// Validates a popped outer-level stack selector (spec §4.5: "RPL==target.
/// RPL, writable data, DPL==target.RPL, present").
fn validate_outer_ss(
    cpu: &Processor,
    mem: &mut dyn AddressSpace,
    selector: u16,
    target_rpl: u8,
) -> Result<Segment, Exception> {
    if selector & !0x3 == 0 {
        return Err(Exception::ss(0u16));
    }
    let seg = cpu.get_segment(selector, mem)?;
    match seg {
        Segment::Data { desc, writable: true, kind } if (selector & 0x3) as u8 == target_rpl && desc.dpl() == target_rpl => {
            Ok(Segment::Data { desc, writable: true, kind })
        }
        _ => Err(Exception::ss(selector)),
    }
}

/// Spec §4.5: after an outer-level return, DS/ES/FS/GS that reference data
/// or non-conforming code with `DPL < new CPL` are set to NULL to prevent
/// privilege escalation through a stale selector.
fn invalidate_stale_data_segments(cpu: &mut Processor, new_cpl: u8) {
    for seg in [
        &mut cpu.segments.ds,
        &mut cpu.segments.es,
        &mut cpu.segments.fs,
        &mut cpu.segments.gs,
    ] {
        let stale = match *seg {
            Segment::Data { desc, .. } => desc.dpl() < new_cpl,
            Segment::Code { desc, kind: CodeKind::NonConforming } => desc.dpl() < new_cpl,
            _ => false,
        };
        if stale {
            *seg = Segment::Null;
        }
    }
}

/// `iret` (spec §4.5/§8): same-privilege restore, outer-privilege return,
/// or (if `CPL==0` and the popped `EFLAGS.VM=1`) entry into virtual-8086
/// mode.
/// IRET with EFLAGS.NT=1 switches back to the task named by the current
/// TSS's back-link, instead of popping a return frame off the stack (spec
/// §9 open question: "iretFromTask is stubbed"). This crate follows the
/// source in leaving the task-return path unimplemented rather than
/// guessing at its interaction with the busy-bit/back-link bookkeeping in
/// `task::do_task_switch`; callers get a loud, typed error instead of a
/// silently wrong register/segment state.
fn iret_from_task(_cpu: &mut Processor, _mem: &mut dyn AddressSpace) -> TransferResult<()> {
    Err(InternalError::Unimplemented("iret with NT=1 (task return)").into())
}

pub fn iret(cpu: &mut Processor, mem: &mut dyn AddressSpace, op32: bool, addr32: bool) -> TransferResult<()> {
    if cpu.flags.control.nt {
        return iret_from_task(cpu, mem);
    }
    if cpu.mode != CpuMode::Protected || cpu.flags.control.vm {
        let offset = pop_operand(cpu, mem, op32, addr32)?;
        let selector = pop_operand(cpu, mem, op32, addr32)? as u16;
        let eflags = pop_operand(cpu, mem, op32, addr32)?;
        cpu.segments.cs = Segment::real_mode(selector);
        cpu.eip = offset;
        let mask = if op32 { 0xFFFF_FFFF } else { 0xFFFF };
        cpu.set_eflags(eflags, mask);
        return Ok(());
    }

    let cpl = cpu.cpl();
    let offset = pop_operand(cpu, mem, op32, addr32)?;
    let selector = pop_operand(cpu, mem, op32, addr32)? as u16;
    let eflags_raw = pop_operand(cpu, mem, op32, addr32)?;

    let target = resolve_code_target(cpu, selector, mem)?;
    let (desc, kind) = match target {
        Segment::Code { desc, kind } => (desc, kind),
        _ => return Err(Exception::gp(selector).into()),
    };
    let new_cpl = (selector & 0x3) as u8;
    if new_cpl < cpl {
        return Err(Exception::gp(selector).into());
    }

    let base_mask = if op32 { masks::IRET_O32_SAME_LEVEL } else { masks::IRET_O16_SAME_LEVEL };
    let iopl = cpu.flags.control.iopl;

    if new_cpl == cpl {
        let mut mask = base_mask;
        if cpl <= iopl {
            mask |= masks::IF;
        }
        if cpl == 0 {
            mask |= if op32 { masks::IOPL_VM_VIF_VIP_O32 } else { masks::IOPL_VM_VIF_VIP_O16 };
        }
        cpu.set_eflags(eflags_raw, mask);
        cpu.set_cs(Segment::Code { desc, kind }, cpl);
        cpu.eip = offset;
        return Ok(());
    }

    // Outer-level return. VM86 entry is only reachable from CPL 0 with the
    // popped EFLAGS.VM bit set (spec §8 boundary behavior).
    if cpl == 0 && eflags_raw & crate::flags::eflags::VM != 0 {
        let new_esp = pop_operand(cpu, mem, op32, addr32)?;
        let new_ss_sel = pop_operand(cpu, mem, op32, addr32)? as u16;
        let es = pop_operand(cpu, mem, op32, addr32)? as u16;
        let ds = pop_operand(cpu, mem, op32, addr32)? as u16;
        let fs = pop_operand(cpu, mem, op32, addr32)? as u16;
        let gs = pop_operand(cpu, mem, op32, addr32)? as u16;

        cpu.set_eflags(eflags_raw, 0xFFFF_FFFF);
        cpu.segments.cs = Segment::Vm86 { selector };
        cpu.control.cpl = 3;
        cpu.eip = offset;
        cpu.segments.ss = Segment::Vm86 { selector: new_ss_sel };
        cpu.gpr.write32(cell::ESP, new_esp);
        cpu.segments.es = Segment::Vm86 { selector: es };
        cpu.segments.ds = Segment::Vm86 { selector: ds };
        cpu.segments.fs = Segment::Vm86 { selector: fs };
        cpu.segments.gs = Segment::Vm86 { selector: gs };
        cpu.mode = CpuMode::Vm86;
        return Ok(());
    }

    if matches!(kind, CodeKind::Conforming) {
        return Err(InternalError::Unimplemented("conforming-code outer-privilege iret").into());
    }

    let new_esp = pop_operand(cpu, mem, op32, addr32)?;
    let new_ss_sel = pop_operand(cpu, mem, op32, addr32)? as u16;
    let new_ss = validate_outer_ss(cpu, mem, new_ss_sel, new_cpl)?;

    let mut mask = base_mask;
    if new_cpl <= iopl {
        mask |= masks::IF;
    }
    if new_cpl == 0 {
        mask |= if op32 { masks::IOPL_VM_VIF_VIP_O32 } else { masks::IOPL_VM_VIF_VIP_O16 };
    }
    cpu.set_eflags(eflags_raw, mask);
    cpu.segments.ss = new_ss;
    ss_set(cpu, true, new_esp);
    cpu.set_cs(Segment::Code { desc, kind }, new_cpl);
    cpu.eip = offset;
    invalidate_stale_data_segments(cpu, new_cpl);
    Ok(())
}

fn flat_code_descriptor(selector: u16, dpl: u8) -> DescriptorCache {
    DescriptorCache {
        selector,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: access::PRESENT | access::S_CODE_DATA | ((dpl & 0x3) << access::DPL_SHIFT) | 0b1010,
        default_size: true,
    }
}

fn flat_data_descriptor(selector: u16, dpl: u8) -> DescriptorCache {
    DescriptorCache {
        selector,
        base: 0,
        limit: 0xFFFF_FFFF,
        access: access::PRESENT | access::S_CODE_DATA | ((dpl & 0x3) << access::DPL_SHIFT) | 0b0010,
        default_size: true,
    }
}

/// `sysenter`: fast ring-3-to-ring-0 transition consulting
/// `IA32_SYSENTER_CS/ESP/EIP` (spec §4.10's MSR surface). Synthesizes flat
/// CS/SS descriptors procedurally, matching the real instruction's
/// behavior of not walking the GDT at all.
pub fn sysenter(cpu: &mut Processor) -> Result<(), Exception> {
    if !cpu.control.protected_mode() {
        return Err(Exception::gp(0u16));
    }
    let cs_msr = cpu.control.rdmsr(MSR_SYSENTER_CS) as u16;
    if cs_msr & !0x3 == 0 {
        return Err(Exception::gp(0u16));
    }
    let cs_sel = cs_msr & 0xFFFC;
    let ss_sel = cs_sel.wrapping_add(8);
    cpu.set_cs(
        Segment::Code {
            desc: flat_code_descriptor(cs_sel, 0),
            kind: CodeKind::NonConforming,
        },
        0,
    );
    cpu.segments.ss = Segment::Data {
        desc: flat_data_descriptor(ss_sel, 0),
        kind: DataKind::Up,
        writable: true,
    };
    cpu.gpr.write32(cell::ESP, cpu.control.rdmsr(MSR_SYSENTER_ESP) as u32);
    cpu.eip = cpu.control.rdmsr(MSR_SYSENTER_EIP) as u32;
    cpu.flags.control.vm = false;
    cpu.flags.control.rf = false;
    Ok(())
}

/// `sysexit`: the ring-0-to-ring-3 counterpart. Loads EIP/ESP from EDX/ECX
/// per the architectural convention, and only runs at CPL 0.
pub fn sysexit(cpu: &mut Processor) -> Result<(), Exception> {
    if cpu.cpl() != 0 {
        return Err(Exception::gp(0u16));
    }
    let cs_msr = cpu.control.rdmsr(MSR_SYSENTER_CS) as u16;
    if cs_msr & !0x3 == 0 {
        return Err(Exception::gp(0u16));
    }
    let cs_sel = (cs_msr.wrapping_add(16)) | 3;
    let ss_sel = (cs_msr.wrapping_add(24)) | 3;
    cpu.set_cs(
        Segment::Code {
            desc: flat_code_descriptor(cs_sel, 3),
            kind: CodeKind::NonConforming,
        },
        3,
    );
    cpu.segments.ss = Segment::Data {
        desc: flat_data_descriptor(ss_sel, 3),
        kind: DataKind::Up,
        writable: true,
    };
    cpu.eip = cpu.gpr.read32(cell::EDX);
    cpu.gpr.write32(cell::ESP, cpu.gpr.read32(cell::ECX));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestMemory;
    use crate::processor::Processor;

    fn code_desc(selector: u16, dpl: u8) -> DescriptorCache {
        flat_code_descriptor(selector, dpl)
    }

    fn write_descriptor(mem: &mut FlatTestMemory, gdt_base: u32, index: u16, raw: u64) {
        let addr = gdt_base + (index as u32) * 8;
        mem.load(addr, &raw.to_le_bytes());
    }

    fn encode_code_descriptor(dpl: u8, conforming: bool) -> u64 {
        let typ: u64 = if conforming { 0x1C } else { 0x18 };
        let access = typ | (1 << 4) | ((dpl as u64 & 0x3) << 5) | (1 << 7);
        let flags = 1u64 << 2; // D=1
        (0xFFFFu64) | (access << 40) | (0xFu64 << 48) | (flags << 52)
    }

    fn setup(gdt_entries: &[(u16, u64)]) -> (Processor, FlatTestMemory) {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= crate::control::CR0_PE;
        let mut mem = FlatTestMemory::new(0x10000);
        cpu.tables.gdtr = Segment::DescriptorTable { base: 0x1000, limit: 0xFFFF };
        for &(sel, raw) in gdt_entries {
            write_descriptor(&mut mem, 0x1000, sel >> 3, raw);
        }
        cpu.segments.ss = Segment::Data {
            desc: flat_data_descriptor(0x20, 0),
            kind: DataKind::Up,
            writable: true,
        };
        cpu.gpr.write32(cell::ESP, 0x2000);
        (cpu, mem)
    }

    #[test]
    fn ret_far_same_privilege_restores_cs_eip() {
        let (mut cpu, mut mem) = setup(&[(0x08, encode_code_descriptor(0, false))]);
        cpu.set_cs(Segment::Code { desc: code_desc(0x08, 0), kind: CodeKind::NonConforming }, 0);
        push_dword(&mut cpu, &mut mem, true, 0x08).unwrap();
        push_dword(&mut cpu, &mut mem, true, 0x1234).unwrap();
        ret_far(&mut cpu, &mut mem, true, true).unwrap();
        assert_eq!(cpu.eip, 0x1234);
        assert_eq!(cpu.segments.cs.selector() & 0xFFF8, 0x08);
    }

    #[test]
    fn ret_far_through_null_selector_raises_gp0() {
        let (mut cpu, mut mem) = setup(&[]);
        push_dword(&mut cpu, &mut mem, true, 0).unwrap();
        push_dword(&mut cpu, &mut mem, true, 0x1234).unwrap();
        let err = ret_far(&mut cpu, &mut mem, true, true).unwrap_err();
        assert!(matches!(err, TransferFault::Exception(Exception::GeneralProtection { selector: Some(0) })));
    }

    #[test]
    fn iret_same_privilege_masks_eflags_and_restores_cs_eip() {
        let (mut cpu, mut mem) = setup(&[(0x08, encode_code_descriptor(0, false))]);
        cpu.set_cs(Segment::Code { desc: code_desc(0x08, 0), kind: CodeKind::NonConforming }, 0);
        push_dword(&mut cpu, &mut mem, true, 0x0000_0246).unwrap();
        push_dword(&mut cpu, &mut mem, true, 0x08).unwrap();
        push_dword(&mut cpu, &mut mem, true, 0x0040_1000).unwrap();
        iret(&mut cpu, &mut mem, true, true).unwrap();
        assert_eq!(cpu.eip, 0x0040_1000);
        assert_eq!(cpu.segments.cs.selector() & 0xFFF8, 0x08);
        assert_eq!(cpu.rflags() & 0x246, 0x246);
    }

    #[test]
    fn call_far_direct_non_conforming_requires_dpl_equals_cpl() {
        let (mut cpu, mut mem) = setup(&[(0x18, encode_code_descriptor(2, false))]);
        cpu.control.cpl = 0;
        cpu.segments.cs.set_rpl(0);
        let err = call_far(&mut cpu, &mut mem, true, true, 0x18, 0x100, 0x10).unwrap_err();
        assert!(matches!(err, TransferFault::Exception(Exception::GeneralProtection { .. })));
    }

    #[test]
    fn iret_with_nt_set_takes_task_return_path_not_stack_pop() {
        let (mut cpu, mut mem) = setup(&[(0x08, encode_code_descriptor(0, false))]);
        cpu.flags.control.nt = true;
        let esp_before = cpu.gpr.read32(cell::ESP);
        let err = iret(&mut cpu, &mut mem, true, true).unwrap_err();
        assert!(matches!(err, TransferFault::Internal(InternalError::Unimplemented(_))));
        // Confirms the NT check happens before any stack pop.
        assert_eq!(cpu.gpr.read32(cell::ESP), esp_before);
    }
}
