//! Stack operations (spec §4.4 / C6): push/pop in 16/32-bit operand size
//! crossed with 16/32-bit stack address size, pusha/popa(d), enter.

use crate::exception::Exception;
use crate::gpr::cell;
use crate::mem::AddressSpace;
use crate::processor::{Processor, SegRole};
use crate::segments::Segment;

/// SS.B — the default-operand-size bit of the current stack segment (spec
/// §4.4). Real-mode/VM86 stacks have no descriptor D/B bit of their own;
/// this core treats them as 16-bit stacks, matching the BIOS/real-mode
/// convention the rest of the core assumes for ESP wraparound.
fn stack_is_32bit(cpu: &Processor) -> bool {
    matches!(cpu.segments.ss, Segment::Data { desc, .. } if desc.default_size)
}

fn sp32(cpu: &Processor) -> u32 {
    cpu.gpr.read32(cell::ESP)
}

fn set_sp(cpu: &mut Processor, value: u32) {
    if stack_is_32bit(cpu) {
        cpu.gpr.write32(cell::ESP, value);
    } else {
        cpu.gpr.write16(cell::ESP, value as u16);
    }
}

/// Stack overflow/underflow into an address the current SS segment
/// rejects raises `#SS(0)` rather than the generic `#GP` a plain segment
/// access would produce (spec §4.4: "Stack overflow into invalid linear
/// addresses raises #SS(0)").
fn ss_check(cpu: &Processor, offset: u32) -> Result<(), Exception> {
    cpu.segments
        .ss
        .check_address(offset)
        .map_err(|_| Exception::ss(0u16))
}

fn write_word(cpu: &mut Processor, mem: &mut dyn AddressSpace, offset: u32, v: u16) -> Result<(), Exception> {
    ss_check(cpu, offset)?;
    let mut backend = cpu.backend(SegRole::Other, mem);
    cpu.segments.ss.set_word(&mut backend, offset, v)
}

fn write_dword(cpu: &mut Processor, mem: &mut dyn AddressSpace, offset: u32, v: u32) -> Result<(), Exception> {
    ss_check(cpu, offset)?;
    let mut backend = cpu.backend(SegRole::Other, mem);
    cpu.segments.ss.set_dword(&mut backend, offset, v)
}

fn read_word(cpu: &Processor, mem: &mut dyn AddressSpace, offset: u32) -> Result<u16, Exception> {
    ss_check(cpu, offset)?;
    let mut backend = cpu.backend(SegRole::Other, mem);
    cpu.segments.ss.get_word(&mut backend, offset)
}

fn read_dword(cpu: &Processor, mem: &mut dyn AddressSpace, offset: u32) -> Result<u32, Exception> {
    ss_check(cpu, offset)?;
    let mut backend = cpu.backend(SegRole::Other, mem);
    cpu.segments.ss.get_dword(&mut backend, offset)
}

/// push16 (spec §4.4): decrements the appropriate half of ESP by 2, writes
/// to SS:ESP. If SS.B=0 the write offset wraps to 16 bits and only SP is
/// updated.
pub fn push16(cpu: &mut Processor, mem: &mut dyn AddressSpace, value: u16) -> Result<(), Exception> {
    let new_sp = sp32(cpu).wrapping_sub(2);
    let offset = if stack_is_32bit(cpu) {
        new_sp
    } else {
        new_sp as u16 as u32
    };
    write_word(cpu, mem, offset, value)?;
    set_sp(cpu, new_sp);
    Ok(())
}

pub fn push32(cpu: &mut Processor, mem: &mut dyn AddressSpace, value: u32) -> Result<(), Exception> {
    let new_sp = sp32(cpu).wrapping_sub(4);
    let offset = if stack_is_32bit(cpu) {
        new_sp
    } else {
        new_sp as u16 as u32
    };
    write_dword(cpu, mem, offset, value)?;
    set_sp(cpu, new_sp);
    Ok(())
}

/// pop16/pop32 (spec §4.4): read first, then increment SP/ESP.
pub fn pop16(cpu: &mut Processor, mem: &mut dyn AddressSpace) -> Result<u16, Exception> {
    let sp = sp32(cpu);
    let offset = if stack_is_32bit(cpu) { sp } else { sp as u16 as u32 };
    let v = read_word(cpu, mem, offset)?;
    set_sp(cpu, sp.wrapping_add(2));
    Ok(v)
}

pub fn pop32(cpu: &mut Processor, mem: &mut dyn AddressSpace) -> Result<u32, Exception> {
    let sp = sp32(cpu);
    let offset = if stack_is_32bit(cpu) { sp } else { sp as u16 as u32 };
    let v = read_dword(cpu, mem, offset)?;
    set_sp(cpu, sp.wrapping_add(4));
    Ok(v)
}

/// Peeks without mutating ESP — used by the control-transfer engine to
/// read the return frame before deciding how many bytes to consume.
pub fn peek16(cpu: &Processor, mem: &mut dyn AddressSpace, extra_offset: u32) -> Result<u16, Exception> {
    let sp = sp32(cpu).wrapping_add(extra_offset);
    let offset = if stack_is_32bit(cpu) { sp } else { sp as u16 as u32 };
    read_word(cpu, mem, offset)
}

pub fn peek32(cpu: &Processor, mem: &mut dyn AddressSpace, extra_offset: u32) -> Result<u32, Exception> {
    let sp = sp32(cpu).wrapping_add(extra_offset);
    let offset = if stack_is_32bit(cpu) { sp } else { sp as u16 as u32 };
    read_dword(cpu, mem, offset)
}

/// pusha/pushad (spec §4.4): saves `temp = ESP` first, then pushes AX/CX/
/// DX/BX/temp/BP/SI/DI in that order (word form) or the 32-bit registers
/// (dword form). A stack-wraparound check (`offset < 16 && odd`) raises
/// `#GP(0)` — the one case in this function family that is `#GP`, not
/// `#SS`, per spec §8's boundary behavior.
pub fn pusha(cpu: &mut Processor, mem: &mut dyn AddressSpace) -> Result<(), Exception> {
    let sp = cpu.gpr.read16(cell::ESP);
    if sp < 16 && sp % 2 != 0 {
        return Err(Exception::gp(0u16));
    }
    let temp = sp;
    push16(cpu, mem, cpu.gpr.read16(cell::EAX))?;
    push16(cpu, mem, cpu.gpr.read16(cell::ECX))?;
    push16(cpu, mem, cpu.gpr.read16(cell::EDX))?;
    push16(cpu, mem, cpu.gpr.read16(cell::EBX))?;
    push16(cpu, mem, temp)?;
    push16(cpu, mem, cpu.gpr.read16(cell::EBP))?;
    push16(cpu, mem, cpu.gpr.read16(cell::ESI))?;
    push16(cpu, mem, cpu.gpr.read16(cell::EDI))?;
    Ok(())
}

pub fn pushad(cpu: &mut Processor, mem: &mut dyn AddressSpace) -> Result<(), Exception> {
    let sp = cpu.gpr.read32(cell::ESP) as u16;
    if sp < 16 && sp % 2 != 0 {
        return Err(Exception::gp(0u16));
    }
    let temp = cpu.gpr.read32(cell::ESP);
    push32(cpu, mem, cpu.gpr.read32(cell::EAX))?;
    push32(cpu, mem, cpu.gpr.read32(cell::ECX))?;
    push32(cpu, mem, cpu.gpr.read32(cell::EDX))?;
    push32(cpu, mem, cpu.gpr.read32(cell::EBX))?;
    push32(cpu, mem, temp)?;
    push32(cpu, mem, cpu.gpr.read32(cell::EBP))?;
    push32(cpu, mem, cpu.gpr.read32(cell::ESI))?;
    push32(cpu, mem, cpu.gpr.read32(cell::EDI))?;
    Ok(())
}

/// popa/popad (spec §4.4): pops DI, SI, BP, **skips** the saved SP slot,
/// then pops BX, DX, CX, AX.
pub fn popa(cpu: &mut Processor, mem: &mut dyn AddressSpace) -> Result<(), Exception> {
    let di = pop16(cpu, mem)?;
    let si = pop16(cpu, mem)?;
    let bp = pop16(cpu, mem)?;
    let _skip_sp = pop16(cpu, mem)?;
    let bx = pop16(cpu, mem)?;
    let dx = pop16(cpu, mem)?;
    let cx = pop16(cpu, mem)?;
    let ax = pop16(cpu, mem)?;
    cpu.gpr.write16(cell::EDI, di);
    cpu.gpr.write16(cell::ESI, si);
    cpu.gpr.write16(cell::EBP, bp);
    cpu.gpr.write16(cell::EBX, bx);
    cpu.gpr.write16(cell::EDX, dx);
    cpu.gpr.write16(cell::ECX, cx);
    cpu.gpr.write16(cell::EAX, ax);
    Ok(())
}

pub fn popad(cpu: &mut Processor, mem: &mut dyn AddressSpace) -> Result<(), Exception> {
    let edi = pop32(cpu, mem)?;
    let esi = pop32(cpu, mem)?;
    let ebp = pop32(cpu, mem)?;
    let _skip_esp = pop32(cpu, mem)?;
    let ebx = pop32(cpu, mem)?;
    let edx = pop32(cpu, mem)?;
    let ecx = pop32(cpu, mem)?;
    let eax = pop32(cpu, mem)?;
    cpu.gpr.write32(cell::EDI, edi);
    cpu.gpr.write32(cell::ESI, esi);
    cpu.gpr.write32(cell::EBP, ebp);
    cpu.gpr.write32(cell::EBX, ebx);
    cpu.gpr.write32(cell::EDX, edx);
    cpu.gpr.write32(cell::ECX, ecx);
    cpu.gpr.write32(cell::EAX, eax);
    Ok(())
}

/// enter (spec §4.4): `nestingLevel` is taken mod 32; pushes old BP; if
/// `nestingLevel > 0`, walks `nestingLevel - 1` saved frames (each read
/// through the current EBP minus 4, re-pushed), then pushes the new frame
/// pointer; sets `EBP = new frame base`, `ESP = EBP - frameSize -
/// 4*nestingLevel`.
pub fn enter(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    frame_size: u16,
    nesting_level: u8,
    operand_size_32: bool,
) -> Result<(), Exception> {
    let nesting_level = (nesting_level % 32) as u32;
    let is32 = stack_is_32bit(cpu) || operand_size_32;
    if is32 {
        push32(cpu, mem, cpu.gpr.read32(cell::EBP))?;
    } else {
        push16(cpu, mem, cpu.gpr.read16(cell::EBP))?;
    }
    let frame_temp = sp32(cpu);
    if nesting_level > 0 {
        let mut ebp = cpu.gpr.read32(cell::EBP);
        for _ in 1..nesting_level {
            ebp = ebp.wrapping_sub(4);
            if operand_size_32 {
                let v = {
                    let mut backend = cpu.backend(SegRole::Other, mem);
                    cpu.segments.ss.get_dword(&mut backend, ebp)?
                };
                push32(cpu, mem, v)?;
            } else {
                let v = {
                    let mut backend = cpu.backend(SegRole::Other, mem);
                    cpu.segments.ss.get_word(&mut backend, ebp)?
                };
                push16(cpu, mem, v)?;
            }
        }
        if operand_size_32 {
            push32(cpu, mem, frame_temp)?;
        } else {
            push16(cpu, mem, frame_temp as u16)?;
        }
    }
    cpu.gpr.write32(cell::EBP, frame_temp);
    let new_sp = frame_temp
        .wrapping_sub(frame_size as u32)
        .wrapping_sub(4 * nesting_level);
    set_sp(cpu, new_sp);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestMemory;
    use crate::processor::Processor;
    use crate::segments::{access, DataKind, DescriptorCache};

    fn cpu32() -> Processor {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.segments.ss = Segment::Data {
            desc: DescriptorCache {
                selector: 0x10,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: access::PRESENT | access::S_CODE_DATA | 0b0010,
                default_size: true,
            },
            kind: DataKind::Up,
            writable: true,
        };
        cpu
    }

    #[test]
    fn push32_then_pop32_round_trips() {
        let mut cpu = cpu32();
        cpu.gpr.write32(cell::ESP, 0x1000);
        let mut mem = FlatTestMemory::new(0x2000);
        push32(&mut cpu, &mut mem, 0xCAFEBABE).unwrap();
        assert_eq!(cpu.gpr.read32(cell::ESP), 0x0FFC);
        let v = pop32(&mut cpu, &mut mem).unwrap();
        assert_eq!(v, 0xCAFEBABE);
        assert_eq!(cpu.gpr.read32(cell::ESP), 0x1000);
    }

    #[test]
    fn push32_esp_in_1_2_3_raises_ss0() {
        for esp in [1u32, 2, 3] {
            let mut cpu = cpu32();
            cpu.gpr.write32(cell::ESP, esp);
            cpu.segments.ss = Segment::Data {
                desc: DescriptorCache {
                    selector: 0x10,
                    base: 0,
                    limit: 0xFFFF, // tiny limit so esp-4 underflows below 0 and fails check_address
                    access: access::PRESENT | access::S_CODE_DATA | 0b0010,
                    default_size: true,
                },
                kind: DataKind::Up,
                writable: true,
            };
            let mut mem = FlatTestMemory::new(0x2000);
            let err = push32(&mut cpu, &mut mem, 0).unwrap_err();
            assert_eq!(err, Exception::ss(0u16));
        }
    }

    #[test]
    fn push32_esp_zero_wraps_and_is_permitted() {
        let mut cpu = cpu32();
        cpu.gpr.write32(cell::ESP, 0);
        let mut mem = FlatTestMemory::new(0x2000);
        assert!(push32(&mut cpu, &mut mem, 0x1234).is_ok());
        assert_eq!(cpu.gpr.read32(cell::ESP), 0xFFFF_FFFC);
    }

    #[test]
    fn pusha_odd_sp_below_16_raises_gp0() {
        let mut cpu = cpu32();
        cpu.gpr.write32(cell::ESP, 5);
        let mut mem = FlatTestMemory::new(0x2000);
        let err = pusha(&mut cpu, &mut mem).unwrap_err();
        assert_eq!(err, Exception::gp(0u16));
    }

    #[test]
    fn pusha_popa_round_trips_all_registers_except_sp() {
        let mut cpu = cpu32();
        cpu.gpr.write32(cell::ESP, 0x1000);
        cpu.gpr.write16(cell::EAX, 0x1111);
        cpu.gpr.write16(cell::ECX, 0x2222);
        cpu.gpr.write16(cell::EDX, 0x3333);
        cpu.gpr.write16(cell::EBX, 0x4444);
        cpu.gpr.write16(cell::EBP, 0x5555);
        cpu.gpr.write16(cell::ESI, 0x6666);
        cpu.gpr.write16(cell::EDI, 0x7777);
        let mut mem = FlatTestMemory::new(0x2000);
        pusha(&mut cpu, &mut mem).unwrap();
        cpu.gpr.write16(cell::EAX, 0);
        popa(&mut cpu, &mut mem).unwrap();
        assert_eq!(cpu.gpr.read16(cell::EAX), 0x1111);
        assert_eq!(cpu.gpr.read16(cell::EDI), 0x7777);
        assert_eq!(cpu.gpr.read32(cell::ESP), 0x1000);
    }

    #[test]
    fn enter_zero_nesting_just_pushes_bp_and_sets_frame() {
        let mut cpu = cpu32();
        cpu.gpr.write32(cell::ESP, 0x1000);
        cpu.gpr.write32(cell::EBP, 0x2000);
        let mut mem = FlatTestMemory::new(0x3000);
        enter(&mut cpu, &mut mem, 0x10, 0, true).unwrap();
        assert_eq!(cpu.gpr.read32(cell::EBP), 0x0FFC);
        assert_eq!(cpu.gpr.read32(cell::ESP), 0x0FFC - 0x10);
    }
}
