//! Task switch (spec §4.7 / C9): the 11-step algorithm triggered by a
//! branch through a TSS descriptor or task gate.
//!
//! Only the 32-bit TSS shape is a valid task-switch target (spec §4.5's
//! descriptor taxonomy: "0x01/0x03: 16-bit TSS — not implemented, raise
//! #GP"); this module raises `#GP` itself if ever handed a 16-bit TSS
//! selector, rather than attempting a narrower layout.

use crate::control::CR0_TS;
use crate::exception::Exception;
use crate::gpr::cell;
use crate::mem::{AddressSpace, SupervisorGuard};
use crate::segments::{self, DescriptorCache, GateCache, LoadReason, Segment};
use crate::processor::Processor;

/// Byte offsets into a 32-bit TSS (spec §4.7 step 6/8's "fixed TSS
/// offsets"), per the architectural layout.
mod offset {
    pub const LINK: u32 = 0x00;
    pub const ESP0: u32 = 0x04;
    pub const SS0: u32 = 0x08;
    pub const ESP1: u32 = 0x0C;
    pub const SS1: u32 = 0x10;
    pub const ESP2: u32 = 0x14;
    pub const SS2: u32 = 0x18;
    pub const CR3: u32 = 0x1C;
    pub const EIP: u32 = 0x20;
    pub const EFLAGS: u32 = 0x24;
    pub const EAX: u32 = 0x28;
    pub const ECX: u32 = 0x2C;
    pub const EDX: u32 = 0x30;
    pub const EBX: u32 = 0x34;
    pub const ESP: u32 = 0x38;
    pub const EBP: u32 = 0x3C;
    pub const ESI: u32 = 0x40;
    pub const EDI: u32 = 0x44;
    pub const ES: u32 = 0x48;
    pub const CS: u32 = 0x4C;
    pub const SS: u32 = 0x50;
    pub const DS: u32 = 0x54;
    pub const FS: u32 = 0x58;
    pub const GS: u32 = 0x5C;
    pub const LDT: u32 = 0x60;
    /// Word at 0x64: bit 0 is the T (debug trap) flag; the rest is reserved.
    pub const TRAP: u32 = 0x64;
    /// Minimum valid limit for a 32-bit TSS (spec §4.7 step 1): the IO-map
    /// base word at 0x66 must be addressable, so the last required byte is
    /// 0x67.
    pub const MIN_LIMIT: u32 = 0x67;
}

fn read_esp_ss_pair(cpu: &Processor, mem: &mut dyn AddressSpace, dpl: u8) -> Result<(u16, u32), Exception> {
    let tss = match cpu.tables.tr {
        Segment::Tss32(d) => d,
        _ => return Err(Exception::ts(0)),
    };
    let _guard = SupervisorGuard::enter(mem);
    let esp_off = tss.base.wrapping_add(4 + 8 * dpl as u32);
    let ss_off = tss.base.wrapping_add(8 + 8 * dpl as u32);
    let esp = mem.get_dword(esp_off)?;
    let ss = mem.get_word(ss_off)?;
    Ok((ss, esp))
}

/// Reads the stack pointer/segment for an inner-privilege call gate or
/// interrupt-gate transfer (spec §4.5 step 3a), from the **current** TSS.
pub fn tss_stack_for_level(cpu: &Processor, mem: &mut dyn AddressSpace, dpl: u8) -> Result<(u16, u32), Exception> {
    read_esp_ss_pair(cpu, mem, dpl)
}

fn tss_descriptor(seg: Segment, selector: u16) -> Result<DescriptorCache, Exception> {
    match seg {
        Segment::Tss32(d) => {
            if d.limit < offset::MIN_LIMIT {
                Err(Exception::ts(d.selector))
            } else {
                Ok(d)
            }
        }
        Segment::Tss16(d) => Err(Exception::gp(d.selector)),
        _ => Err(Exception::gp(selector)),
    }
}

fn is_busy(desc: &DescriptorCache) -> bool {
    desc.access & 0x2 != 0
}

/// Flips the busy bit (type bit 1) of a TSS descriptor sitting in the GDT,
/// under supervisor mode (spec §4.7 step 5, spec §5's scoped-supervisor
/// requirement).
fn set_busy_bit(cpu: &Processor, mem: &mut dyn AddressSpace, selector: u16, busy: bool) -> Result<(), Exception> {
    if selector & 0x4 != 0 {
        // LDT-resident TSS descriptors aren't addressable this way; real
        // hardware requires TSS descriptors to live in the GDT.
        return Err(Exception::gp(selector));
    }
    let index = (selector & 0xFFF8) as u32;
    let addr = cpu.tables.gdtr.base().wrapping_add(index);
    let _guard = SupervisorGuard::enter(mem);
    let access_addr = addr + 5;
    let mut access = mem.get_byte(access_addr)?;
    if busy {
        access |= 0x2;
    } else {
        access &= !0x2;
    }
    mem.set_byte(access_addr, access)
}

struct SavedContext {
    eax: u32,
    ecx: u32,
    edx: u32,
    ebx: u32,
    esp: u32,
    ebp: u32,
    esi: u32,
    edi: u32,
    eip: u32,
    eflags: u32,
    es: u16,
    cs: u16,
    ss: u16,
    ds: u16,
    fs: u16,
    gs: u16,
    ldt: u16,
    trap: bool,
}

fn save_current_context(cpu: &Processor, mem: &mut dyn AddressSpace, base: u32) -> Result<(), Exception> {
    let _guard = SupervisorGuard::enter(mem);
    mem.set_dword(base + offset::EAX, cpu.gpr.read32(cell::EAX))?;
    mem.set_dword(base + offset::ECX, cpu.gpr.read32(cell::ECX))?;
    mem.set_dword(base + offset::EDX, cpu.gpr.read32(cell::EDX))?;
    mem.set_dword(base + offset::EBX, cpu.gpr.read32(cell::EBX))?;
    mem.set_dword(base + offset::ESP, cpu.gpr.read32(cell::ESP))?;
    mem.set_dword(base + offset::EBP, cpu.gpr.read32(cell::EBP))?;
    mem.set_dword(base + offset::ESI, cpu.gpr.read32(cell::ESI))?;
    mem.set_dword(base + offset::EDI, cpu.gpr.read32(cell::EDI))?;
    mem.set_dword(base + offset::EIP, cpu.eip)?;
    mem.set_dword(base + offset::EFLAGS, cpu.rflags())?;
    mem.set_word(base + offset::ES, cpu.segments.es.selector())?;
    mem.set_word(base + offset::CS, cpu.segments.cs.selector())?;
    mem.set_word(base + offset::SS, cpu.segments.ss.selector())?;
    mem.set_word(base + offset::DS, cpu.segments.ds.selector())?;
    mem.set_word(base + offset::FS, cpu.segments.fs.selector())?;
    mem.set_word(base + offset::GS, cpu.segments.gs.selector())?;
    Ok(())
}

fn load_new_context(mem: &mut dyn AddressSpace, base: u32) -> Result<SavedContext, Exception> {
    let _guard = SupervisorGuard::enter(mem);
    Ok(SavedContext {
        eax: mem.get_dword(base + offset::EAX)?,
        ecx: mem.get_dword(base + offset::ECX)?,
        edx: mem.get_dword(base + offset::EDX)?,
        ebx: mem.get_dword(base + offset::EBX)?,
        esp: mem.get_dword(base + offset::ESP)?,
        ebp: mem.get_dword(base + offset::EBP)?,
        esi: mem.get_dword(base + offset::ESI)?,
        edi: mem.get_dword(base + offset::EDI)?,
        eip: mem.get_dword(base + offset::EIP)?,
        eflags: mem.get_dword(base + offset::EFLAGS)?,
        es: mem.get_word(base + offset::ES)?,
        cs: mem.get_word(base + offset::CS)?,
        ss: mem.get_word(base + offset::SS)?,
        ds: mem.get_word(base + offset::DS)?,
        fs: mem.get_word(base + offset::FS)?,
        gs: mem.get_word(base + offset::GS)?,
        ldt: mem.get_word(base + offset::LDT)?,
        trap: mem.get_word(base + offset::TRAP)? & 0x1 != 0,
    })
}

/// Validates a loaded data/code segment against the rules spec §4.7 step
/// 10 requires, raising `#TS(sel)` on any violation.
fn validate_loaded_segment(
    seg: &Segment,
    selector: u16,
    cpl: u8,
    is_cs: bool,
    is_ss: bool,
) -> Result<(), Exception> {
    if selector & !0x3 == 0 {
        return if is_cs || is_ss {
            Err(Exception::ts(selector))
        } else {
            Ok(())
        };
    }
    let rpl = (selector & 0x3) as u8;
    match seg {
        Segment::Code { desc, kind } => {
            if is_ss {
                return Err(Exception::ts(selector));
            }
            if is_cs {
                let ok = match kind {
                    segments::CodeKind::NonConforming => desc.dpl() == cpl && rpl == cpl,
                    segments::CodeKind::Conforming => desc.dpl() <= cpl,
                };
                if !ok || !desc.present() {
                    return Err(Exception::ts(selector));
                }
                return Ok(());
            }
            // A readable code segment may be loaded into DS/ES/FS/GS: a
            // non-conforming one needs DPL >= max(CPL, RPL); a conforming
            // one is always accessible regardless of DPL.
            let readable = desc.access & 0x2 != 0;
            let ok = readable
                && match kind {
                    segments::CodeKind::Conforming => true,
                    segments::CodeKind::NonConforming => desc.dpl() >= cpl && desc.dpl() >= rpl,
                };
            if !ok || !desc.present() {
                return Err(Exception::ts(selector));
            }
            Ok(())
        }
        Segment::Data { desc, writable, .. } => {
            if is_cs {
                return Err(Exception::ts(selector));
            }
            if is_ss {
                if !*writable || rpl != cpl || desc.dpl() != cpl || !desc.present() {
                    return Err(Exception::ts(selector));
                }
            } else if desc.dpl() < cpl.max(rpl) || !desc.present() {
                return Err(Exception::ts(selector));
            }
            Ok(())
        }
        _ => Err(Exception::ts(selector)),
    }
}

/// Resolves and validates the new task's LDT selector (spec.md step 6/10):
/// NULL means "no LDT", a TI=1 selector is nonsensical (LDT selectors
/// always index the GDT) and a non-`Ldt` descriptor both raise `#TS`.
fn resolve_new_ldt(cpu: &Processor, mem: &mut dyn AddressSpace, selector: u16) -> Result<Segment, Exception> {
    if selector & !0x3 == 0 {
        return Ok(Segment::Null);
    }
    if selector & 0x4 != 0 {
        return Err(Exception::ts(selector));
    }
    match cpu.get_segment(selector, mem)? {
        seg @ Segment::Ldt(_) => Ok(seg),
        _ => Err(Exception::ts(selector)),
    }
}

fn do_task_switch(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    new_selector: u16,
    new_tss: DescriptorCache,
    nested: bool,
) -> Result<(), Exception> {
    let old_selector = cpu.tables.tr.selector();
    let old_base = cpu.tables.tr.base();
    let new_base = new_tss.base;

    // Step 3: force any page-in fault now, before any state mutates.
    {
        let _guard = SupervisorGuard::enter(mem);
        mem.get_byte(old_base)?;
        mem.get_byte(new_base)?;
    }

    // Step 4: save current context into the old TSS.
    save_current_context(cpu, mem, old_base)?;

    // Step 5: busy-bit bookkeeping.
    set_busy_bit(cpu, mem, old_selector, false)?;
    set_busy_bit(cpu, mem, new_selector, true)?;
    if nested {
        let _guard = SupervisorGuard::enter(mem);
        mem.set_word(new_base + offset::LINK, old_selector)?;
    }

    // Steps 6/8: load the new context.
    let ctx = load_new_context(mem, new_base)?;

    let new_cpl = (ctx.cs & 0x3) as u8;
    let cs_seg = cpu.load_seg(LoadReason::Cs, ctx.cs, mem)?;
    let ss_seg = cpu.load_seg(LoadReason::Ss, ctx.ss, mem)?;
    let ds_seg = cpu.load_seg(LoadReason::DataOrIndex, ctx.ds, mem)?;
    let es_seg = cpu.load_seg(LoadReason::DataOrIndex, ctx.es, mem)?;
    let fs_seg = cpu.load_seg(LoadReason::DataOrIndex, ctx.fs, mem)?;
    let gs_seg = cpu.load_seg(LoadReason::DataOrIndex, ctx.gs, mem)?;
    let ldt_seg = resolve_new_ldt(cpu, mem, ctx.ldt)?;

    // Step 10: validate every loaded segment.
    validate_loaded_segment(&cs_seg, ctx.cs, new_cpl, true, false)?;
    validate_loaded_segment(&ss_seg, ctx.ss, new_cpl, false, true)?;
    validate_loaded_segment(&ds_seg, ctx.ds, new_cpl, false, false)?;
    validate_loaded_segment(&es_seg, ctx.es, new_cpl, false, false)?;
    validate_loaded_segment(&fs_seg, ctx.fs, new_cpl, false, false)?;
    validate_loaded_segment(&gs_seg, ctx.gs, new_cpl, false, false)?;

    // Step 11.
    cs_seg.check_address(ctx.eip)?;

    cpu.gpr.write32(cell::EAX, ctx.eax);
    cpu.gpr.write32(cell::ECX, ctx.ecx);
    cpu.gpr.write32(cell::EDX, ctx.edx);
    cpu.gpr.write32(cell::EBX, ctx.ebx);
    cpu.gpr.write32(cell::ESP, ctx.esp);
    cpu.gpr.write32(cell::EBP, ctx.ebp);
    cpu.gpr.write32(cell::ESI, ctx.esi);
    cpu.gpr.write32(cell::EDI, ctx.edi);
    cpu.eip = ctx.eip;
    cpu.set_eflags(ctx.eflags, 0xFFFF_FFFF);
    if nested {
        cpu.flags.control.nt = true;
    }
    cpu.set_cs(cs_seg, new_cpl);
    cpu.segments.ss = ss_seg;
    cpu.segments.ds = ds_seg;
    cpu.segments.es = es_seg;
    cpu.segments.fs = fs_seg;
    cpu.segments.gs = gs_seg;
    cpu.tables.ldtr = ldt_seg;

    // Step 7.
    cpu.control.cr0 |= CR0_TS;
    // Step 9.
    cpu.control.clear_debug_breakpoint_enables();

    cpu.tables.tr = Segment::Tss32(new_tss);

    // The T (debug trap) bit in the new TSS raises #DB once the switch has
    // fully committed, with CS:EIP already pointing at the new task's first
    // instruction (the trap fires *after* the switch, not instead of it).
    if ctx.trap {
        return Err(Exception::Debug);
    }
    Ok(())
}

/// Entry point when a branch hits a task gate (spec §4.5's descriptor
/// taxonomy, type 0x05). `nested` is true for CALL/interrupt-driven
/// switches, false for JMP.
pub fn switch_via_task_gate(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    gate: GateCache,
    nested: bool,
) -> Result<(), Exception> {
    if !gate.present {
        return Err(Exception::np(gate.selector));
    }
    let target = cpu.get_segment(gate.target_selector, mem)?;
    let desc = tss_descriptor(target, gate.target_selector)?;
    if is_busy(&desc) {
        return Err(Exception::ts(gate.target_selector));
    }
    do_task_switch(cpu, mem, gate.target_selector, desc, nested)
}

/// Entry point when a branch targets a TSS descriptor directly (spec
/// §4.5's taxonomy, type 0x9/0xB).
pub fn switch_via_tss_selector(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    selector: u16,
    nested: bool,
) -> Result<(), Exception> {
    let target = cpu.get_segment(selector, mem)?;
    let desc = tss_descriptor(target, selector)?;
    if is_busy(&desc) {
        return Err(Exception::ts(selector));
    }
    do_task_switch(cpu, mem, selector, desc, nested)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::CR0_PE;
    use crate::mem::FlatTestMemory;
    use crate::processor::{CpuMode, Processor};
    use crate::segments::access;

    fn tss_desc(selector: u16, base: u32) -> DescriptorCache {
        DescriptorCache {
            selector,
            base,
            limit: 0x67,
            access: access::PRESENT | 0x9,
            default_size: false,
        }
    }

    fn code_desc(selector: u16) -> DescriptorCache {
        DescriptorCache {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: access::PRESENT | access::S_CODE_DATA | 0b1010,
            default_size: true,
        }
    }

    fn data_desc(selector: u16) -> DescriptorCache {
        DescriptorCache {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: access::PRESENT | access::S_CODE_DATA | 0b0010,
            default_size: true,
        }
    }

    fn data_desc_dpl(selector: u16, dpl: u8) -> DescriptorCache {
        DescriptorCache {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: access::PRESENT | access::S_CODE_DATA | ((dpl << access::DPL_SHIFT) & access::DPL_MASK) | 0b0010,
            default_size: true,
        }
    }

    fn code_desc_dpl(selector: u16, dpl: u8) -> DescriptorCache {
        DescriptorCache {
            selector,
            base: 0,
            limit: 0xFFFF_FFFF,
            access: access::PRESENT | access::S_CODE_DATA | ((dpl << access::DPL_SHIFT) & access::DPL_MASK) | 0b1010,
            default_size: true,
        }
    }

    fn ldt_desc(selector: u16, base: u32) -> DescriptorCache {
        DescriptorCache {
            selector,
            base,
            limit: 0xFFFF,
            access: access::PRESENT | 0x2,
            default_size: false,
        }
    }

    fn raw_descriptor(desc: &DescriptorCache, typ: u8, s: bool, db: bool) -> u64 {
        let access = (typ as u64) | ((s as u64) << 4) | ((desc.dpl() as u64) << 5) | ((desc.present() as u64) << 7);
        let flags = (db as u64) << 2;
        (desc.limit as u64 & 0xFFFF)
            | ((desc.base as u64 & 0xFFFF) << 16)
            | (((desc.base as u64 >> 16) & 0xFF) << 32)
            | (access << 40)
            | ((((desc.limit as u64) >> 16) & 0xF) << 48)
            | (flags << 52)
            | ((((desc.base as u64) >> 24) & 0xFF) << 56)
    }

    fn write_gdt_entry(mem: &mut FlatTestMemory, gdt_base: u32, selector: u16, raw: u64) {
        let addr = gdt_base + (selector & 0xFFF8) as u32;
        mem.load(addr, &raw.to_le_bytes());
    }

    #[test]
    fn task_switch_via_selector_loads_new_context_and_sets_ts() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= CR0_PE;
        cpu.tables.gdtr = Segment::DescriptorTable { base: 0x1000, limit: 0xFFFF };

        let mut mem = FlatTestMemory::new(0x20000);

        let old_tss_base = 0x5000;
        let new_tss_base = 0x6000;
        write_gdt_entry(&mut mem, 0x1000, 0x40, raw_descriptor(&tss_desc(0x40, old_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x48, raw_descriptor(&tss_desc(0x48, new_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x08, raw_descriptor(&code_desc(0x08), 0xA, true, true));
        write_gdt_entry(&mut mem, 0x1000, 0x10, raw_descriptor(&data_desc(0x10), 0x2, true, true));

        cpu.tables.tr = Segment::Tss32(tss_desc(0x40, old_tss_base));

        // New TSS context: CS=0x08, SS=0x10, EIP=0x2000, rest zeroed.
        mem.set_word(new_tss_base + offset::CS, 0x08).unwrap();
        mem.set_word(new_tss_base + offset::SS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::DS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::ES, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::FS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::GS, 0x10).unwrap();
        mem.set_dword(new_tss_base + offset::EIP, 0x2000).unwrap();
        mem.set_dword(new_tss_base + offset::ESP, 0x8000).unwrap();

        switch_via_tss_selector(&mut cpu, &mut mem, 0x48, false).unwrap();

        assert_eq!(cpu.eip, 0x2000);
        assert_eq!(cpu.segments.cs.selector() & 0xFFF8, 0x08);
        assert_eq!(cpu.gpr.read32(cell::ESP), 0x8000);
        assert!(cpu.control.cr0 & CR0_TS != 0);
        assert_eq!(cpu.tables.tr.base(), new_tss_base);
    }

    #[test]
    fn busy_task_target_raises_ts() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.tables.gdtr = Segment::DescriptorTable { base: 0x1000, limit: 0xFFFF };
        let mut mem = FlatTestMemory::new(0x10000);
        let mut busy = tss_desc(0x48, 0x6000);
        busy.access |= 0x2; // busy bit
        write_gdt_entry(&mut mem, 0x1000, 0x48, raw_descriptor(&busy, 0xB, false, false));
        cpu.tables.tr = Segment::Tss32(tss_desc(0x40, 0x5000));
        let err = switch_via_tss_selector(&mut cpu, &mut mem, 0x48, false).unwrap_err();
        assert_eq!(err, Exception::ts(0x48));
    }

    #[test]
    fn task_switch_loads_new_tasks_ldt_selector() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= CR0_PE;
        cpu.tables.gdtr = Segment::DescriptorTable { base: 0x1000, limit: 0xFFFF };

        let mut mem = FlatTestMemory::new(0x20000);
        let old_tss_base = 0x5000;
        let new_tss_base = 0x6000;
        let ldt_base = 0x7000;
        write_gdt_entry(&mut mem, 0x1000, 0x40, raw_descriptor(&tss_desc(0x40, old_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x48, raw_descriptor(&tss_desc(0x48, new_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x08, raw_descriptor(&code_desc(0x08), 0xA, true, true));
        write_gdt_entry(&mut mem, 0x1000, 0x10, raw_descriptor(&data_desc(0x10), 0x2, true, true));
        write_gdt_entry(&mut mem, 0x1000, 0x58, raw_descriptor(&ldt_desc(0x58, ldt_base), 0x2, false, false));

        cpu.tables.tr = Segment::Tss32(tss_desc(0x40, old_tss_base));
        mem.set_word(new_tss_base + offset::CS, 0x08).unwrap();
        mem.set_word(new_tss_base + offset::SS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::DS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::ES, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::FS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::GS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::LDT, 0x58).unwrap();
        mem.set_dword(new_tss_base + offset::EIP, 0x2000).unwrap();
        mem.set_dword(new_tss_base + offset::ESP, 0x8000).unwrap();

        switch_via_tss_selector(&mut cpu, &mut mem, 0x48, false).unwrap();

        assert_eq!(cpu.tables.ldtr.base(), ldt_base);
        assert!(matches!(cpu.tables.ldtr, Segment::Ldt(_)));
    }

    #[test]
    fn task_switch_with_trap_bit_set_raises_debug_after_committing_state() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= CR0_PE;
        cpu.tables.gdtr = Segment::DescriptorTable { base: 0x1000, limit: 0xFFFF };

        let mut mem = FlatTestMemory::new(0x20000);
        let old_tss_base = 0x5000;
        let new_tss_base = 0x6000;
        write_gdt_entry(&mut mem, 0x1000, 0x40, raw_descriptor(&tss_desc(0x40, old_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x48, raw_descriptor(&tss_desc(0x48, new_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x08, raw_descriptor(&code_desc(0x08), 0xA, true, true));
        write_gdt_entry(&mut mem, 0x1000, 0x10, raw_descriptor(&data_desc(0x10), 0x2, true, true));

        cpu.tables.tr = Segment::Tss32(tss_desc(0x40, old_tss_base));
        mem.set_word(new_tss_base + offset::CS, 0x08).unwrap();
        mem.set_word(new_tss_base + offset::SS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::DS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::ES, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::FS, 0x10).unwrap();
        mem.set_word(new_tss_base + offset::GS, 0x10).unwrap();
        mem.set_dword(new_tss_base + offset::EIP, 0x2000).unwrap();
        mem.set_dword(new_tss_base + offset::ESP, 0x8000).unwrap();
        mem.set_word(new_tss_base + offset::TRAP, 0x1).unwrap();

        let err = switch_via_tss_selector(&mut cpu, &mut mem, 0x48, false).unwrap_err();
        assert_eq!(err, Exception::Debug);
        assert_eq!(cpu.eip, 0x2000);
        assert_eq!(cpu.tables.tr.base(), new_tss_base);
    }

    #[test]
    fn task_switch_rejects_data_segment_whose_dpl_is_below_new_cpl() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= CR0_PE;
        cpu.tables.gdtr = Segment::DescriptorTable { base: 0x1000, limit: 0xFFFF };

        let mut mem = FlatTestMemory::new(0x20000);
        let old_tss_base = 0x5000;
        let new_tss_base = 0x6000;
        write_gdt_entry(&mut mem, 0x1000, 0x40, raw_descriptor(&tss_desc(0x40, old_tss_base), 0x9, false, false));
        write_gdt_entry(&mut mem, 0x1000, 0x48, raw_descriptor(&tss_desc(0x48, new_tss_base), 0x9, false, false));
        // CS: ring-3 non-conforming code, selector RPL=3.
        write_gdt_entry(&mut mem, 0x1000, 0x08, raw_descriptor(&code_desc_dpl(0x0B, 3), 0xA, true, true));
        // SS: ring-3 writable data so the SS-specific check passes.
        write_gdt_entry(&mut mem, 0x1000, 0x10, raw_descriptor(&data_desc_dpl(0x13, 3), 0x2, true, true));
        // DS: ring-0-only data segment — must not be loadable by a ring-3 task.
        write_gdt_entry(&mut mem, 0x1000, 0x18, raw_descriptor(&data_desc_dpl(0x18, 0), 0x2, true, true));

        cpu.tables.tr = Segment::Tss32(tss_desc(0x40, old_tss_base));
        mem.set_word(new_tss_base + offset::CS, 0x0B).unwrap();
        mem.set_word(new_tss_base + offset::SS, 0x13).unwrap();
        mem.set_word(new_tss_base + offset::DS, 0x18).unwrap();
        mem.set_word(new_tss_base + offset::ES, 0x13).unwrap();
        mem.set_word(new_tss_base + offset::FS, 0x13).unwrap();
        mem.set_word(new_tss_base + offset::GS, 0x13).unwrap();
        mem.set_dword(new_tss_base + offset::EIP, 0x2000).unwrap();
        mem.set_dword(new_tss_base + offset::ESP, 0x8000).unwrap();

        let err = switch_via_tss_selector(&mut cpu, &mut mem, 0x48, false).unwrap_err();
        assert_eq!(err, Exception::ts(0x18));
    }
}
