//! Interrupt and exception delivery (spec §4.8 / C8), plus the
//! `waitForInterrupt`/post-block polling surface that crosses the atomic
//! `interruptFlags` word (spec §5).
//!
//! Three public entry points: [`deliver`] for a raw vector (software `INT
//! n`, hardware IRQ), [`deliver_exception`] for an architectural
//! [`Exception`] raised internally, and [`wait_for_interrupt`] for HLT.
//! Everything else here is the recursive double/triple-fault escalation
//! machinery and the real/protected/VM86 dispatch it escalates between.

use crate::control::{self, flag};
use crate::exception::{CombineClass, Exception, ModeSwitchKind};
use crate::gpr::cell;
use crate::mem::{AddressSpace, SupervisorGuard};
use crate::processor::{CpuMode, Processor};
use crate::segments::{self, CodeKind, DataKind, DescriptorCache, Segment};
use crate::stack;
use crate::task;

/// Vector a nested fault during `#DF` delivery escalates to (spec §4.8:
/// "double fault nested under double fault is a triple fault", modeled here
/// as the Processor halting rather than this crate owning CPU reset/restart,
/// which is a host concern per spec §1).
const DOUBLE_FAULT_VECTOR: u8 = 8;

/// What came of asking the Processor to deliver a vector.
#[derive(Debug)]
pub enum DeliveryOutcome {
    /// The frame was pushed and CS:EIP now points at the handler.
    Delivered,
    /// Delivery completed, but also crossed a mode boundary the caller
    /// (the block interpreter, ultimately a host) should react to. The
    /// mode mutation has already happened; this is purely informational,
    /// matching every other control transfer in this crate (state changes
    /// eagerly, nothing is deferred to the event).
    ModeSwitch(ModeSwitchKind),
    /// A `#DF` delivery itself faulted. The Processor is halted; only a
    /// host-level reset can bring it back (spec §4.8, §8 scenario 5).
    TripleFault,
}

/// Collaborator a host wires in to supply the actual interrupt vector once
/// the hardware-interrupt bit is observed (spec §5/§6): the Processor
/// itself has no interrupt controller, just the atomic request bit.
pub trait InterruptController {
    fn cpu_get_interrupt(&mut self) -> u8;
}

/// The virtual-clock collaborator `waitForInterrupt` drives while halted
/// (spec §5/§6).
pub trait Clock {
    /// Advances the clock and processes whatever became due, optionally
    /// sleeping the host thread for real time first. `should_sleep` is
    /// `false` when `Config::skip_sleeps` is set (single-stepping).
    fn update_now_and_process(&mut self, should_sleep: bool);
}

/// Outcome of a HLT wait.
#[derive(Debug)]
pub enum WaitOutcome {
    /// A hardware interrupt woke the core; the vector has already been
    /// fetched from the controller but not yet delivered — the caller
    /// still has to call [`deliver`].
    Interrupt(u8),
    /// A reset was requested while halted (spec §5's `RESET_REQUESTED`
    /// bit); the Processor has already been reset.
    Reset,
}

/// The (ESP, EIP, CS, SS) snapshot taken before attempting delivery (spec
/// §4.8: "a rollback snapshot of ESP, EIP, CS, SS is captured before each
/// delivery attempt and restored if that attempt itself faults"). CPL and
/// mode are restored alongside CS since this crate's invariant is that CS
/// and CPL never drift apart (spec §8 invariant 3) — restoring one without
/// the other would violate it.
struct Rollback {
    esp: u32,
    eip: u32,
    cs: Segment,
    ss: Segment,
    cpl: u8,
    mode: CpuMode,
}

impl Rollback {
    fn capture(cpu: &Processor) -> Self {
        Rollback {
            esp: cpu.gpr.read32(cell::ESP),
            eip: cpu.eip,
            cs: cpu.segments.cs,
            ss: cpu.segments.ss,
            cpl: cpu.control.cpl,
            mode: cpu.mode,
        }
    }

    fn restore(&self, cpu: &mut Processor) {
        cpu.gpr.write32(cell::ESP, self.esp);
        cpu.eip = self.eip;
        cpu.segments.cs = self.cs;
        cpu.segments.ss = self.ss;
        cpu.control.cpl = self.cpl;
        cpu.mode = self.mode;
    }
}

/// Delivers an architectural exception (spec §4.8). Writes the faulting
/// linear address into CR2 first if this is a page fault, per the
/// documented ordering ("before resolving the gate").
pub fn deliver_exception(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    exc: Exception,
) -> DeliveryOutcome {
    if let Exception::PageFault { addr, .. } = exc {
        cpu.control.cr2 = addr;
    }
    deliver_with_class(
        cpu,
        mem,
        exc.vector(),
        exc.error_code(),
        false,
        false,
        Some(exc.combine_class()),
    )
}

/// Delivers a raw vector: a software `INT n` (`software = true`) or a
/// hardware IRQ (`hardware = true`) the host already fetched from its
/// interrupt controller. Neither classifies into the double-fault
/// combination table on its own — only CPU-detected faults routed through
/// [`deliver_exception`] do (spec §4.8) — so a fault raised while
/// delivering a plain vector is simply delivered as its own interrupt,
/// never escalated to `#DF`.
pub fn deliver(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    vector: u8,
    error_code: Option<u32>,
    hardware: bool,
    software: bool,
) -> DeliveryOutcome {
    deliver_with_class(cpu, mem, vector, error_code, hardware, software, None)
}

fn deliver_with_class(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    vector: u8,
    error_code: Option<u32>,
    hardware: bool,
    software: bool,
    combine_class: Option<CombineClass>,
) -> DeliveryOutcome {
    let rollback = Rollback::capture(cpu);
    match dispatch(cpu, mem, vector, error_code, hardware, software) {
        Ok(None) => DeliveryOutcome::Delivered,
        Ok(Some(kind)) => DeliveryOutcome::ModeSwitch(kind),
        Err(nested) => {
            rollback.restore(cpu);
            if vector == DOUBLE_FAULT_VECTOR {
                cpu.control.halted = true;
                return DeliveryOutcome::TripleFault;
            }
            let escalate = combine_class.map_or(false, |c| c.combines_with(nested.combine_class()));
            if escalate {
                deliver_with_class(
                    cpu,
                    mem,
                    Exception::DoubleFault.vector(),
                    None,
                    false,
                    false,
                    Some(CombineClass::Contributory),
                )
            } else {
                deliver_with_class(
                    cpu,
                    mem,
                    nested.vector(),
                    nested.error_code(),
                    false,
                    false,
                    Some(nested.combine_class()),
                )
            }
        }
    }
}

fn dispatch(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    vector: u8,
    error_code: Option<u32>,
    hardware: bool,
    software: bool,
) -> Result<Option<ModeSwitchKind>, Exception> {
    match cpu.mode {
        CpuMode::Real => deliver_real(cpu, mem, vector).map(|_| None),
        CpuMode::Protected => {
            deliver_protected(cpu, mem, vector, error_code, hardware, software, false)
        }
        CpuMode::Vm86 => deliver_protected(cpu, mem, vector, error_code, hardware, software, true),
    }
}

/// Real-mode delivery (spec §4.8): a flat 4-byte-per-vector IVT, no error
/// code ever pushed, EFLAGS/CS/EIP pushed 16-bit each.
fn deliver_real(cpu: &mut Processor, mem: &mut dyn AddressSpace, vector: u8) -> Result<(), Exception> {
    let entry = (vector as u32) * 4;
    if entry + 3 > cpu.tables.idtr.limit() {
        return Err(Exception::gp(0u16));
    }
    let addr = cpu.tables.idtr.base().wrapping_add(entry);
    let raw = {
        let _guard = SupervisorGuard::enter(mem);
        mem.get_dword(addr)?
    };
    let target_ip = (raw & 0xFFFF) as u16;
    let target_cs = (raw >> 16) as u16;

    stack::push16(cpu, mem, cpu.rflags() as u16)?;
    stack::push16(cpu, mem, cpu.segments.cs.selector())?;
    stack::push16(cpu, mem, cpu.eip as u16)?;

    cpu.flags.control.intf = false;
    cpu.flags.control.tf = false;
    cpu.flags.control.ac = false;
    cpu.flags.control.rf = false;

    cpu.segments.cs = Segment::real_mode(target_cs);
    cpu.eip = target_ip as u32;
    Ok(())
}

/// Protected-mode delivery, with the VM86 extension folded in via `vm86`
/// (spec §4.8): IDT gate lookup, privilege checks, same- or inter-privilege
/// stack switch, and (when `vm86`) the extra GS/FS/DS/ES save and the exit
/// back to protected-mode execution.
fn deliver_protected(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    vector: u8,
    error_code: Option<u32>,
    hardware: bool,
    software: bool,
    vm86: bool,
) -> Result<Option<ModeSwitchKind>, Exception> {
    let idt_off = (vector as u32) * 8;
    let idt_sel = idt_off as u16;
    if idt_off + 7 > cpu.tables.idtr.limit() {
        return Err(Exception::gp(idt_sel));
    }
    let addr = cpu.tables.idtr.base().wrapping_add(idt_off);
    let raw = {
        let _guard = SupervisorGuard::enter(mem);
        let lo = mem.get_dword(addr)? as u64;
        let hi = mem.get_dword(addr + 4)? as u64;
        lo | (hi << 32)
    };
    let gate = segments::decode_descriptor(idt_sel, raw)?;

    if let Segment::TaskGate(g) = gate {
        if !g.present {
            return Err(Exception::np(idt_sel));
        }
        task::switch_via_task_gate(cpu, mem, g, true)?;
        return Ok(None);
    }

    let (gate_cache, gate32, is_interrupt_gate) = match gate {
        Segment::InterruptGate16(g) => (g, false, true),
        Segment::InterruptGate32(g) => (g, true, true),
        Segment::TrapGate16(g) => (g, false, false),
        Segment::TrapGate32(g) => (g, true, false),
        _ => return Err(Exception::gp(idt_sel)),
    };

    if !gate_cache.present {
        return Err(Exception::np(idt_sel));
    }
    let cpl = cpu.cpl();
    if software && gate_cache.dpl < cpl {
        return Err(Exception::gp(idt_sel));
    }
    if vm86 && software && cpu.flags.control.iopl != 3 {
        return Err(Exception::gp(0u16));
    }

    let target = resolve_gate_target(cpu, mem, gate_cache.target_selector)?;
    let (desc, kind) = match target {
        Segment::Code { desc, kind } => (desc, kind),
        _ => return Err(Exception::gp(gate_cache.target_selector)),
    };
    if vm86 {
        if desc.dpl() != 0 {
            return Err(Exception::gp(gate_cache.target_selector));
        }
    } else if desc.dpl() > cpl {
        return Err(Exception::gp(gate_cache.target_selector));
    }

    let target_cpl = desc.dpl();
    let inter_privilege = vm86 || target_cpl < cpl;
    let err_value = error_code.map(|c| if hardware { c | 1 } else { c });

    if inter_privilege {
        deliver_inter_privilege(
            cpu, mem, desc, kind, target_cpl, gate32, err_value, vm86,
        )?;
    } else {
        push_field(cpu, mem, gate32, cpu.rflags())?;
        push_field(cpu, mem, gate32, cpu.segments.cs.selector() as u32)?;
        push_field(cpu, mem, gate32, cpu.eip)?;
        if let Some(code) = err_value {
            push_field(cpu, mem, gate32, code)?;
        }
        cpu.set_cs(Segment::Code { desc, kind }, cpl);
    }

    cpu.eip = gate_cache.target_offset;
    if is_interrupt_gate {
        cpu.flags.control.intf = false;
    }
    cpu.flags.control.tf = false;
    cpu.flags.control.nt = false;
    cpu.flags.control.vm = false;
    cpu.flags.control.rf = false;

    if vm86 {
        cpu.mode = CpuMode::Protected;
        return Ok(Some(ModeSwitchKind::ExitVm86ToProtected));
    }
    Ok(None)
}

/// The inter-privilege push sequence (spec §4.8: "push SS, ESP, EFLAGS, CS,
/// EIP, error (if any)"), with the VM86 extension's GS/FS/DS/ES save
/// spliced in right after the new stack is loaded, matching real hardware's
/// frame layout for a VM86-to-ring-0 interrupt (GS highest, error lowest).
fn deliver_inter_privilege(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    target_desc: DescriptorCache,
    target_kind: CodeKind,
    target_cpl: u8,
    gate32: bool,
    err_value: Option<u32>,
    vm86: bool,
) -> Result<(), Exception> {
    let (_, new_esp, new_ss) = load_gate_stack(cpu, mem, target_cpl)?;

    let old_ss = cpu.segments.ss;
    let old_esp = cpu.gpr.read32(cell::ESP);
    let old_cs = cpu.segments.cs.selector() as u32;
    let old_eflags = cpu.rflags();
    let old_eip = cpu.eip;
    let old_data_segs = if vm86 {
        Some((
            cpu.segments.gs.selector() as u32,
            cpu.segments.fs.selector() as u32,
            cpu.segments.ds.selector() as u32,
            cpu.segments.es.selector() as u32,
        ))
    } else {
        None
    };

    cpu.segments.ss = new_ss;
    cpu.gpr.write32(cell::ESP, new_esp);

    if let Some((gs, fs, ds, es)) = old_data_segs {
        push_field(cpu, mem, gate32, gs)?;
        push_field(cpu, mem, gate32, fs)?;
        push_field(cpu, mem, gate32, ds)?;
        push_field(cpu, mem, gate32, es)?;
        cpu.segments.gs = Segment::Null;
        cpu.segments.fs = Segment::Null;
        cpu.segments.ds = Segment::Null;
        cpu.segments.es = Segment::Null;
    }

    push_field(cpu, mem, gate32, old_ss.selector() as u32)?;
    push_field(cpu, mem, gate32, old_esp)?;
    push_field(cpu, mem, gate32, old_eflags)?;
    push_field(cpu, mem, gate32, old_cs)?;
    push_field(cpu, mem, gate32, old_eip)?;
    if let Some(code) = err_value {
        push_field(cpu, mem, gate32, code)?;
    }

    cpu.set_cs(Segment::Code { desc: target_desc, kind: target_kind }, target_cpl);
    Ok(())
}

fn push_field(
    cpu: &mut Processor,
    mem: &mut dyn AddressSpace,
    gate32: bool,
    value: u32,
) -> Result<(), Exception> {
    if gate32 {
        stack::push32(cpu, mem, value)
    } else {
        stack::push16(cpu, mem, value as u16)
    }
}

fn resolve_gate_target(
    cpu: &Processor,
    mem: &mut dyn AddressSpace,
    selector: u16,
) -> Result<Segment, Exception> {
    if selector & !0x3 == 0 {
        return Err(Exception::gp(0u16));
    }
    cpu.get_segment(selector, mem)
}

/// Loads and validates the target privilege level's stack from the current
/// TSS (spec §4.6's inner-privilege call-gate rule, reused verbatim for
/// interrupt/trap gates): non-NULL, RPL and DPL both equal to `dpl`,
/// writable data, present.
fn load_gate_stack(
    cpu: &Processor,
    mem: &mut dyn AddressSpace,
    dpl: u8,
) -> Result<(u16, u32, Segment), Exception> {
    let (ss_sel, esp) = task::tss_stack_for_level(cpu, mem, dpl)?;
    if ss_sel & !0x3 == 0 {
        return Err(Exception::ss(0u16));
    }
    let seg = cpu.get_segment(ss_sel, mem)?;
    match seg {
        Segment::Data { desc, writable: true, kind }
            if (ss_sel & 0x3) as u8 == dpl && desc.dpl() == dpl =>
        {
            Ok((ss_sel, esp, Segment::Data { desc, writable: true, kind }))
        }
        _ => Err(Exception::ss(ss_sel)),
    }
}

/// HLT (spec §5/§8 scenario 6): parks the core until either the
/// `RESET_REQUESTED` bit or (with `EFLAGS.IF` set) the `HARDWARE_INTERRUPT`
/// bit is observed, each consumed with a single atomic test-and-clear so a
/// racing `raise` from another thread is neither lost nor double-consumed.
pub fn wait_for_interrupt(
    cpu: &mut Processor,
    interrupts: &mut dyn InterruptController,
    clock: &mut dyn Clock,
) -> WaitOutcome {
    cpu.control.halted = true;
    let sleep = !cpu.config.skip_sleeps();
    loop {
        if cpu.interrupt_flags.take(flag::RESET_REQUESTED) {
            cpu.reset();
            return WaitOutcome::Reset;
        }
        if cpu.flags.control.intf && cpu.interrupt_flags.take(flag::HARDWARE_INTERRUPT) {
            cpu.control.halted = false;
            return WaitOutcome::Interrupt(interrupts.cpu_get_interrupt());
        }
        clock.update_now_and_process(sleep);
    }
}

/// The interrupt-check point reached once per basic block (spec §5: "the
/// Processor reads [interruptFlags] at each interrupt-check point, which
/// this core defines as after block execution"). Returns the vector to
/// deliver, if any.
pub fn poll_pending(cpu: &mut Processor, interrupts: &mut dyn InterruptController) -> Option<u8> {
    if cpu.interrupt_flags.take(flag::RESET_REQUESTED) {
        cpu.reset();
        return None;
    }
    if cpu.flags.control.intf && cpu.interrupt_flags.take(flag::HARDWARE_INTERRUPT) {
        return Some(interrupts.cpu_get_interrupt());
    }
    None
}
