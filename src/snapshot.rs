//! Versioned save-state wire format (spec §6) and a debug textual dump.
//!
//! `save_state`/`load_state` serialize architectural state in the fixed
//! order the wire contract demands: GPRs, EIP, debug/control registers,
//! flags, FPU marker/blob, interrupt flags, alignment-checking, reset time,
//! CPL, MSRs, then the ten segment/system-table slots. Everything here is
//! plain `std::io`; no serialization crate is pulled in since the format is
//! a flat, self-describing byte stream rather than a general Rust value.

use crate::error::InternalError;
use crate::flags::Flags;
use crate::gpr::RegisterFile;
use crate::processor::{CpuMode, Processor, SegmentFile, SystemTables};
use crate::segments::{CodeKind, DataKind, DescriptorCache, GateCache, Segment};
use std::collections::BTreeMap;
use std::io::{Read, Write};

/// Bumped whenever the field order or shape below changes (spec §6
/// "[ADDED] Versioning"). `load_state` rejects any other value rather than
/// guessing at a layout migration.
pub const FORMAT_VERSION: u32 = 1;

fn write_u8(out: &mut dyn Write, v: u8) -> Result<(), InternalError> {
    out.write_all(&[v])?;
    Ok(())
}

fn write_bool(out: &mut dyn Write, v: bool) -> Result<(), InternalError> {
    write_u8(out, v as u8)
}

fn write_u16(out: &mut dyn Write, v: u16) -> Result<(), InternalError> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u32(out: &mut dyn Write, v: u32) -> Result<(), InternalError> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn write_u64(out: &mut dyn Write, v: u64) -> Result<(), InternalError> {
    out.write_all(&v.to_le_bytes())?;
    Ok(())
}

fn read_u8(inp: &mut dyn Read) -> Result<u8, InternalError> {
    let mut b = [0u8; 1];
    inp.read_exact(&mut b)?;
    Ok(b[0])
}

fn read_bool(inp: &mut dyn Read) -> Result<bool, InternalError> {
    Ok(read_u8(inp)? != 0)
}

fn read_u16(inp: &mut dyn Read) -> Result<u16, InternalError> {
    let mut b = [0u8; 2];
    inp.read_exact(&mut b)?;
    Ok(u16::from_le_bytes(b))
}

fn read_u32(inp: &mut dyn Read) -> Result<u32, InternalError> {
    let mut b = [0u8; 4];
    inp.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn read_u64(inp: &mut dyn Read) -> Result<u64, InternalError> {
    let mut b = [0u8; 8];
    inp.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn write_descriptor_cache(out: &mut dyn Write, desc: &DescriptorCache) -> Result<(), InternalError> {
    write_u16(out, desc.selector)?;
    write_u32(out, desc.base)?;
    write_u32(out, desc.limit)?;
    write_u8(out, desc.access)?;
    write_bool(out, desc.default_size)
}

fn read_descriptor_cache(inp: &mut dyn Read) -> Result<DescriptorCache, InternalError> {
    Ok(DescriptorCache {
        selector: read_u16(inp)?,
        base: read_u32(inp)?,
        limit: read_u32(inp)?,
        access: read_u8(inp)?,
        default_size: read_bool(inp)?,
    })
}

fn write_gate_cache(out: &mut dyn Write, gate: &GateCache) -> Result<(), InternalError> {
    write_u16(out, gate.selector)?;
    write_u16(out, gate.target_selector)?;
    write_u32(out, gate.target_offset)?;
    write_u8(out, gate.dpl)?;
    write_bool(out, gate.present)?;
    write_u8(out, gate.parameter_count)
}

fn read_gate_cache(inp: &mut dyn Read) -> Result<GateCache, InternalError> {
    Ok(GateCache {
        selector: read_u16(inp)?,
        target_selector: read_u16(inp)?,
        target_offset: read_u32(inp)?,
        dpl: read_u8(inp)?,
        present: read_bool(inp)?,
        parameter_count: read_u8(inp)?,
    })
}

/// Segment variant tags (spec §6): `0`=real, `1`=vm86, `2`=descriptor-table,
/// `3`=protected-mode, `4`=null. Tag `3` carries a second, crate-private
/// sub-tag distinguishing the eleven protected-mode payload shapes — the
/// spec names one "protected-mode" tag, not eleven, so the sub-tag lives
/// entirely inside that variant's "variant-specific fields".
mod tag {
    pub const REAL: u8 = 0;
    pub const VM86: u8 = 1;
    pub const DESCRIPTOR_TABLE: u8 = 2;
    pub const PROTECTED: u8 = 3;
    pub const NULL: u8 = 4;
}

mod protected_kind {
    pub const DATA: u8 = 0;
    pub const CODE: u8 = 1;
    pub const LDT: u8 = 2;
    pub const TSS16: u8 = 3;
    pub const TSS32: u8 = 4;
    pub const INTERRUPT_GATE16: u8 = 5;
    pub const INTERRUPT_GATE32: u8 = 6;
    pub const TRAP_GATE16: u8 = 7;
    pub const TRAP_GATE32: u8 = 8;
    pub const CALL_GATE16: u8 = 9;
    pub const CALL_GATE32: u8 = 10;
    pub const TASK_GATE: u8 = 11;
}

fn write_segment(out: &mut dyn Write, seg: &Segment) -> Result<(), InternalError> {
    match seg {
        Segment::Real { selector } => {
            write_u8(out, tag::REAL)?;
            write_u16(out, *selector)
        }
        Segment::Vm86 { selector } => {
            write_u8(out, tag::VM86)?;
            write_u16(out, *selector)
        }
        Segment::DescriptorTable { base, limit } => {
            write_u8(out, tag::DESCRIPTOR_TABLE)?;
            write_u32(out, *base)?;
            write_u32(out, *limit)
        }
        Segment::Null => write_u8(out, tag::NULL),
        Segment::Data { desc, kind, writable } => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::DATA)?;
            write_descriptor_cache(out, desc)?;
            write_u8(out, if *kind == DataKind::ExpandDown { 1 } else { 0 })?;
            write_bool(out, *writable)
        }
        Segment::Code { desc, kind } => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::CODE)?;
            write_descriptor_cache(out, desc)?;
            write_u8(out, if *kind == CodeKind::Conforming { 1 } else { 0 })
        }
        Segment::Ldt(desc) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::LDT)?;
            write_descriptor_cache(out, desc)
        }
        Segment::Tss16(desc) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::TSS16)?;
            write_descriptor_cache(out, desc)
        }
        Segment::Tss32(desc) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::TSS32)?;
            write_descriptor_cache(out, desc)
        }
        Segment::InterruptGate16(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::INTERRUPT_GATE16)?;
            write_gate_cache(out, g)
        }
        Segment::InterruptGate32(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::INTERRUPT_GATE32)?;
            write_gate_cache(out, g)
        }
        Segment::TrapGate16(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::TRAP_GATE16)?;
            write_gate_cache(out, g)
        }
        Segment::TrapGate32(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::TRAP_GATE32)?;
            write_gate_cache(out, g)
        }
        Segment::CallGate16(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::CALL_GATE16)?;
            write_gate_cache(out, g)
        }
        Segment::CallGate32(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::CALL_GATE32)?;
            write_gate_cache(out, g)
        }
        Segment::TaskGate(g) => {
            write_u8(out, tag::PROTECTED)?;
            write_u8(out, protected_kind::TASK_GATE)?;
            write_gate_cache(out, g)
        }
    }
}

fn read_segment(inp: &mut dyn Read) -> Result<Segment, InternalError> {
    let t = read_u8(inp)?;
    match t {
        tag::REAL => Ok(Segment::Real { selector: read_u16(inp)? }),
        tag::VM86 => Ok(Segment::Vm86 { selector: read_u16(inp)? }),
        tag::DESCRIPTOR_TABLE => Ok(Segment::DescriptorTable {
            base: read_u32(inp)?,
            limit: read_u32(inp)?,
        }),
        tag::NULL => Ok(Segment::Null),
        tag::PROTECTED => {
            let sub = read_u8(inp)?;
            match sub {
                protected_kind::DATA => {
                    let desc = read_descriptor_cache(inp)?;
                    let kind = if read_u8(inp)? == 1 { DataKind::ExpandDown } else { DataKind::Up };
                    let writable = read_bool(inp)?;
                    Ok(Segment::Data { desc, kind, writable })
                }
                protected_kind::CODE => {
                    let desc = read_descriptor_cache(inp)?;
                    let kind = if read_u8(inp)? == 1 { CodeKind::Conforming } else { CodeKind::NonConforming };
                    Ok(Segment::Code { desc, kind })
                }
                protected_kind::LDT => Ok(Segment::Ldt(read_descriptor_cache(inp)?)),
                protected_kind::TSS16 => Ok(Segment::Tss16(read_descriptor_cache(inp)?)),
                protected_kind::TSS32 => Ok(Segment::Tss32(read_descriptor_cache(inp)?)),
                protected_kind::INTERRUPT_GATE16 => Ok(Segment::InterruptGate16(read_gate_cache(inp)?)),
                protected_kind::INTERRUPT_GATE32 => Ok(Segment::InterruptGate32(read_gate_cache(inp)?)),
                protected_kind::TRAP_GATE16 => Ok(Segment::TrapGate16(read_gate_cache(inp)?)),
                protected_kind::TRAP_GATE32 => Ok(Segment::TrapGate32(read_gate_cache(inp)?)),
                protected_kind::CALL_GATE16 => Ok(Segment::CallGate16(read_gate_cache(inp)?)),
                protected_kind::CALL_GATE32 => Ok(Segment::CallGate32(read_gate_cache(inp)?)),
                protected_kind::TASK_GATE => Ok(Segment::TaskGate(read_gate_cache(inp)?)),
                other => Err(InternalError::SnapshotTypeTagOutOfRange { tag: other }),
            }
        }
        other => Err(InternalError::SnapshotTypeTagOutOfRange { tag: other }),
    }
}

/// Writes the full architectural state as a versioned binary stream (spec
/// §6), in the exact field order the wire contract fixes.
pub fn save_state(cpu: &Processor, out: &mut dyn Write) -> Result<(), InternalError> {
    write_u32(out, FORMAT_VERSION)?;

    for cell in cpu.gpr.cells() {
        write_u32(out, cell)?;
    }
    write_u32(out, cpu.eip)?;

    for dr in cpu.control.dr {
        write_u32(out, dr)?;
    }

    write_u32(out, cpu.control.cr0)?;
    write_u32(out, 0)?; // CR1 is architecturally reserved.
    write_u32(out, cpu.control.cr2)?;
    write_u32(out, cpu.control.cr3)?;
    write_u32(out, cpu.control.cr4)?;

    let arith = &cpu.flags.arith;
    write_bool(out, arith.cf())?;
    write_bool(out, arith.pf())?;
    write_bool(out, arith.af())?;
    write_bool(out, arith.zf())?;
    write_bool(out, arith.sf())?;
    write_bool(out, arith.of())?;

    let ctl = &cpu.flags.control;
    write_bool(out, ctl.tf)?;
    write_bool(out, ctl.intf)?;
    write_bool(out, ctl.df)?;
    write_u32(out, ctl.iopl as u32)?;
    write_bool(out, ctl.nt)?;
    write_bool(out, ctl.rf)?;
    write_bool(out, ctl.vm)?;
    write_bool(out, ctl.ac)?;
    write_bool(out, ctl.vif)?;
    write_bool(out, ctl.vip)?;
    write_bool(out, ctl.id)?;

    write_bool(out, cpu.fpu_present)?;
    if cpu.fpu_present {
        write_u32(out, cpu.fpu_blob.len() as u32)?;
        out.write_all(&cpu.fpu_blob)?;
    }

    write_u32(out, cpu.interrupt_flags.snapshot())?;
    write_bool(out, cpu.alignment_checking_live(crate::processor::SegRole::Other))?;
    write_u64(out, cpu.reset_time)?;
    write_u8(out, cpu.control.cpl)?;

    write_u32(out, cpu.control.msr_count() as u32)?;
    for (key, value) in cpu.control.msr_iter() {
        write_u32(out, key)?;
        write_u64(out, value)?;
    }

    write_segment(out, &cpu.segments.cs)?;
    write_segment(out, &cpu.segments.ds)?;
    write_segment(out, &cpu.segments.ss)?;
    write_segment(out, &cpu.segments.es)?;
    write_segment(out, &cpu.segments.fs)?;
    write_segment(out, &cpu.segments.gs)?;
    write_segment(out, &cpu.tables.idtr)?;
    write_segment(out, &cpu.tables.gdtr)?;
    write_segment(out, &cpu.tables.ldtr)?;
    write_segment(out, &cpu.tables.tr)?;

    Ok(())
}

/// Reads a stream written by `save_state` back into `cpu`, overwriting
/// every field the format names (spec §6, §8's round-trip law). Rejects an
/// unrecognized format version rather than guessing at a migration.
pub fn load_state(cpu: &mut Processor, inp: &mut dyn Read) -> Result<(), InternalError> {
    let version = read_u32(inp)?;
    if version != FORMAT_VERSION {
        return Err(InternalError::UnsupportedSnapshotVersion {
            found: version,
            expected: FORMAT_VERSION,
        });
    }

    let mut cells = [0u32; 8];
    for cell in cells.iter_mut() {
        *cell = read_u32(inp)?;
    }
    let mut gpr = RegisterFile::new();
    gpr.set_cells(cells);
    cpu.gpr = gpr;
    cpu.eip = read_u32(inp)?;

    let mut dr = [0u32; 8];
    for d in dr.iter_mut() {
        *d = read_u32(inp)?;
    }

    let cr0 = read_u32(inp)?;
    let _cr1_reserved = read_u32(inp)?;
    let cr2 = read_u32(inp)?;
    let cr3 = read_u32(inp)?;
    let cr4 = read_u32(inp)?;

    let cf = read_bool(inp)?;
    let pf = read_bool(inp)?;
    let af = read_bool(inp)?;
    let zf = read_bool(inp)?;
    let sf = read_bool(inp)?;
    let of = read_bool(inp)?;

    let tf = read_bool(inp)?;
    let intf = read_bool(inp)?;
    let df = read_bool(inp)?;
    let iopl = read_u32(inp)? as u8;
    let nt = read_bool(inp)?;
    let rf = read_bool(inp)?;
    let vm = read_bool(inp)?;
    let ac = read_bool(inp)?;
    let vif = read_bool(inp)?;
    let vip = read_bool(inp)?;
    let id = read_bool(inp)?;

    let fpu_present = read_bool(inp)?;
    let fpu_blob = if fpu_present {
        let len = read_u32(inp)? as usize;
        let mut blob = vec![0u8; len];
        inp.read_exact(&mut blob)?;
        blob
    } else {
        Vec::new()
    };

    let interrupt_word = read_u32(inp)?;
    // Not separate authoritative state (spec §9 decision, see DESIGN.md):
    // alignment-check live-ness is recomputed from CR0/EFLAGS/CPL on every
    // access, so the stored byte is round-tripped for wire compatibility
    // and otherwise discarded.
    let _alignment_checking = read_bool(inp)?;
    let reset_time = read_u64(inp)?;
    let cpl = read_u8(inp)?;

    let msr_count = read_u32(inp)?;
    let mut msrs = BTreeMap::new();
    for _ in 0..msr_count {
        let key = read_u32(inp)?;
        let value = read_u64(inp)?;
        msrs.insert(key, value);
    }

    let cs = read_segment(inp)?;
    let ds = read_segment(inp)?;
    let ss = read_segment(inp)?;
    let es = read_segment(inp)?;
    let fs = read_segment(inp)?;
    let gs = read_segment(inp)?;
    let idtr = read_segment(inp)?;
    let gdtr = read_segment(inp)?;
    let ldtr = read_segment(inp)?;
    let tr = read_segment(inp)?;

    cpu.control.cr0 = cr0;
    cpu.control.cr2 = cr2;
    cpu.control.cr3 = cr3;
    cpu.control.cr4 = cr4;
    cpu.control.dr = dr;
    cpu.control.cpl = cpl;
    cpu.control.set_msrs(msrs);

    let mut flags = Flags::new();
    flags.arith.set_cf(cf);
    flags.arith.set_pf(pf);
    flags.arith.set_af(af);
    flags.arith.set_zf(zf);
    flags.arith.set_sf(sf);
    flags.arith.set_of(of);
    flags.control.tf = tf;
    flags.control.intf = intf;
    flags.control.df = df;
    flags.control.iopl = iopl;
    flags.control.nt = nt;
    flags.control.rf = rf;
    flags.control.vm = vm;
    flags.control.ac = ac;
    flags.control.vif = vif;
    flags.control.vip = vip;
    flags.control.id = id;
    cpu.flags = flags;

    cpu.fpu_present = fpu_present;
    cpu.fpu_blob = fpu_blob;
    cpu.interrupt_flags.restore(interrupt_word);
    cpu.reset_time = reset_time;

    cpu.mode = if vm {
        CpuMode::Vm86
    } else if cr0 & crate::control::CR0_PE != 0 {
        CpuMode::Protected
    } else {
        CpuMode::Real
    };

    cpu.segments = SegmentFile { cs, ds, es, fs, gs, ss };
    cpu.tables = SystemTables { gdtr, idtr, ldtr, tr };

    Ok(())
}

/// Debug-only textual dump of architectural state (spec §6's
/// `printState()`). Never parsed back in; purely for human inspection, so
/// its shape isn't part of any wire contract.
pub fn print_state(cpu: &Processor) -> String {
    format!(
        "eip={:#010x} eflags={:#010x} cr0={:#010x} cr2={:#010x} cr3={:#010x} cr4={:#010x} \
         cpl={} mode={:?} halted={} gprs={:?} cs={:#06x} ds={:#06x} ss={:#06x}",
        cpu.eip,
        cpu.rflags(),
        cpu.control.cr0,
        cpu.control.cr2,
        cpu.control.cr3,
        cpu.control.cr4,
        cpu.cpl(),
        cpu.mode,
        cpu.control.halted,
        cpu.gpr.cells(),
        cpu.segments.cs.selector(),
        cpu.segments.ds.selector(),
        cpu.segments.ss.selector(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segments::access;

    fn sample_processor() -> Processor {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= crate::control::CR0_PE | crate::control::CR0_AM;
        cpu.control.cr3 = 0x4000_1000;
        cpu.control.cpl = 3;
        cpu.control.dr[0] = 0xDEAD_BEEF;
        cpu.gpr.write32(crate::gpr::cell::EAX, 0x1122_3344);
        cpu.flags.control.ac = true;
        cpu.flags.control.iopl = 2;
        cpu.flags.arith.set_cf(true);
        cpu.control.wrmsr(0x1234, 0xCAFEBABEu64);
        cpu.segments.cs = Segment::Code {
            desc: DescriptorCache {
                selector: 0x08,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: access::PRESENT | access::S_CODE_DATA | 0b1010,
                default_size: true,
            },
            kind: CodeKind::NonConforming,
        };
        cpu.fpu_present = true;
        cpu.fpu_blob = vec![1, 2, 3, 4, 5];
        cpu.reset_time = 0x9999_AAAA_BBBB_CCCC;
        cpu
    }

    #[test]
    fn round_trip_preserves_eflags_crs_drs_msrs_and_segments() {
        let original = sample_processor();
        let mut buf = Vec::new();
        save_state(&original, &mut buf).unwrap();

        let mut restored = Processor::new();
        restored.init();
        load_state(&mut restored, &mut &buf[..]).unwrap();

        assert_eq!(restored.rflags(), original.rflags());
        assert_eq!(restored.control.cr0, original.control.cr0);
        assert_eq!(restored.control.cr2, original.control.cr2);
        assert_eq!(restored.control.cr3, original.control.cr3);
        assert_eq!(restored.control.cr4, original.control.cr4);
        assert_eq!(restored.control.dr, original.control.dr);
        assert_eq!(restored.control.rdmsr(0x1234), original.control.rdmsr(0x1234));
        assert_eq!(restored.cpl(), original.cpl());
        assert_eq!(restored.gpr.cells(), original.gpr.cells());
        assert_eq!(restored.segments.cs.selector(), original.segments.cs.selector());
        assert_eq!(restored.segments.cs.base(), original.segments.cs.base());
        assert_eq!(restored.segments.cs.limit(), original.segments.cs.limit());
        assert_eq!(restored.fpu_present, original.fpu_present);
        assert_eq!(restored.fpu_blob, original.fpu_blob);
        assert_eq!(restored.reset_time, original.reset_time);
        assert_eq!(restored.mode, original.mode);
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let mut buf = Vec::new();
        write_u32(&mut buf, FORMAT_VERSION + 1).unwrap();
        let mut cpu = Processor::new();
        let err = load_state(&mut cpu, &mut &buf[..]).unwrap_err();
        assert!(matches!(
            err,
            InternalError::UnsupportedSnapshotVersion { found, expected }
                if found == FORMAT_VERSION + 1 && expected == FORMAT_VERSION
        ));
    }

    #[test]
    fn out_of_range_segment_tag_is_rejected() {
        let mut buf = Vec::new();
        write_u8(&mut buf, tag::PROTECTED).unwrap();
        write_u8(&mut buf, 200).unwrap();
        let err = read_segment(&mut &buf[..]).unwrap_err();
        assert!(matches!(err, InternalError::SnapshotTypeTagOutOfRange { tag: 200 }));
    }

    #[test]
    fn print_state_includes_eip_and_selector() {
        let cpu = sample_processor();
        let s = print_state(&cpu);
        assert!(s.contains("eip=0x00000000"));
        assert!(s.contains("cs=0x0008"));
    }
}
