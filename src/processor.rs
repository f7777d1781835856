//! The `Processor`: architectural state container plus the glue between the
//! register file, flags, segments, and control-state components (spec §3,
//! §4, §5 / the "core" of C1–C5 and the lifecycle in spec §3).

use crate::control::{self, ControlState};
use crate::exception::Exception;
use crate::flags::Flags;
use crate::gpr::RegisterFile;
use crate::mem::{AddressSpace, SupervisorGuard};
use crate::segments::{self, LoadReason, Segment};
use std::sync::Arc;

/// Real / protected / virtual-8086 (spec §3: "EFLAGS.VM=1 while CR0.PE=1").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Vm86,
}

/// Lifecycle phases (spec §3: "uninitialised → initialised (collaborators
/// wired) → started (reset applied) → running/halted").
///
/// "running" vs "halted" is not a separate lifecycle variant here: it is
/// `ControlState::halted`, which can flip back and forth many times within
/// a single `Started` session (HLT, then a waking interrupt) without the
/// Processor ever leaving the started phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialised,
    Initialised,
    Started,
}

/// Which of the six data/stack segments or CS is being accessed, for the
/// purpose of the alignment-checking binding rule (spec §4.3: "CS always
/// → linear").
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegRole {
    Cs,
    Other,
}

/// The six general segment registers (spec §3).
#[derive(Clone, Debug)]
pub struct SegmentFile {
    pub cs: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ss: Segment,
}

impl SegmentFile {
    fn real_mode_reset() -> Self {
        SegmentFile {
            cs: Segment::real_mode(0xF000),
            ds: Segment::real_mode(0),
            es: Segment::real_mode(0),
            fs: Segment::real_mode(0),
            gs: Segment::real_mode(0),
            ss: Segment::real_mode(0),
        }
    }
}

/// GDTR/IDTR/LDTR/TR (spec §3).
#[derive(Clone, Debug)]
pub struct SystemTables {
    pub gdtr: Segment,
    pub idtr: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
}

impl Default for SystemTables {
    fn default() -> Self {
        SystemTables {
            gdtr: Segment::DescriptorTable { base: 0, limit: 0xFFFF },
            idtr: Segment::DescriptorTable { base: 0, limit: 0xFFFF },
            ldtr: Segment::Null,
            tr: Segment::Null,
        }
    }
}

/// The architectural state container (spec §3's "Processor" + C1–C5, C6's
/// stack-size bit, and the lifecycle).
pub struct Processor {
    pub gpr: RegisterFile,
    pub eip: u32,
    pub flags: Flags,
    pub segments: SegmentFile,
    pub tables: SystemTables,
    pub control: ControlState,
    pub mode: CpuMode,
    pub lifecycle: Lifecycle,
    /// Shared with any external thread that injects hardware interrupts
    /// or requests a reset (spec §5). `Arc` so a host can clone a handle
    /// out to another thread independent of the Processor's own
    /// single-owner mutable borrow.
    pub interrupt_flags: Arc<control::InterruptFlags>,
    pub config: crate::config::Config,
    /// Whether an FPU collaborator is attached (spec §6's "FPU-present
    /// marker"). The FPU's own state lives entirely in `fpu_blob`, an
    /// opaque buffer this crate never interprets — FPU semantics are an
    /// external collaborator (spec §1) — it only carries the bytes through
    /// `saveState`/`loadState` on the FPU's behalf.
    pub fpu_present: bool,
    pub fpu_blob: Vec<u8>,
    /// Opaque host/clock-assigned timestamp of the last reset (spec §6's
    /// "resetTime"); this crate never reads or compares it, only carries it
    /// through a save/load round trip, since the clock collaborator that
    /// would give it meaning is out of scope (spec §1).
    pub reset_time: u64,
}

impl Processor {
    /// Constructs a Processor in the `Uninitialised` lifecycle phase. No
    /// collaborators are wired and no reset has run; most operations other
    /// than `init`/`reset` are a programmer error at this point (spec §3).
    pub fn new() -> Self {
        Processor {
            gpr: RegisterFile::new(),
            eip: 0,
            flags: Flags::new(),
            segments: SegmentFile::real_mode_reset(),
            tables: SystemTables::default(),
            control: ControlState::new(),
            mode: CpuMode::Real,
            lifecycle: Lifecycle::Uninitialised,
            interrupt_flags: Arc::new(control::InterruptFlags::new()),
            config: crate::config::Config::default(),
            fpu_present: false,
            fpu_blob: Vec::new(),
            reset_time: 0,
        }
    }

    /// Marks collaborators as wired (spec §3: "initialised"). This crate
    /// has no collaborators of its own to validate beyond the lifecycle
    /// transition itself; a host embedding this core calls `init` once it
    /// has attached memory/interrupt-controller/clock/FPU handles to its
    /// own wrapper around the Processor.
    pub fn init(&mut self) {
        self.lifecycle = Lifecycle::Initialised;
    }

    /// Power-on / triple-fault reset (spec §3). CS=F000:FFF0 reset vector
    /// is a host/firmware convention, not architectural; this core resets
    /// CS:EIP to the real-mode default of 0xF000:0x0000 and leaves the
    /// exact boot vector to the host, matching the minimal-interface-
    /// contract stance of spec §1.
    pub fn reset(&mut self) {
        self.gpr = RegisterFile::new();
        self.eip = 0;
        self.flags = Flags::new();
        self.segments = SegmentFile::real_mode_reset();
        self.tables = SystemTables::default();
        self.control.reset();
        self.mode = CpuMode::Real;
        self.lifecycle = Lifecycle::Started;
    }

    pub fn cpl(&self) -> u8 {
        self.control.cpl
    }

    /// Enforces the CPL==CS.RPL pairing (spec §3 invariant, §8 invariant
    /// 3): every write to CS must go through here so the two never drift
    /// apart.
    pub fn set_cs(&mut self, seg: Segment, cpl: u8) {
        self.segments.cs = seg;
        self.segments.cs.set_rpl(cpl);
        self.control.cpl = cpl;
    }

    /// Whether alignment checking is "live" for a given segment role right
    /// now (spec §4.3's binding rule): protected mode, not VM86, CR0.AM=1,
    /// EFLAGS.AC=1, CPL==3, and the segment isn't CS (CS always binds to
    /// the plain linear backend).
    pub fn alignment_checking_live(&self, role: SegRole) -> bool {
        role != SegRole::Cs
            && self.mode == CpuMode::Protected
            && self.control.alignment_checking_enabled_for_am()
            && self.flags.control.ac
            && self.control.cpl == 3
    }

    /// Wraps `mem` in the alignment-checked overlay with `live` computed
    /// for `role` under the current mode/CR0/EFLAGS/CPL (spec §4.3's
    /// `updateAlignmentCheckingInDataSegments`, applied lazily per access
    /// rather than by physically rebinding a stored backend handle, since
    /// this crate doesn't own the backend).
    pub fn backend<'a>(
        &self,
        role: SegRole,
        mem: &'a mut dyn AddressSpace,
    ) -> crate::mem::AlignmentChecked<'a> {
        crate::mem::AlignmentChecked::new(mem, self.alignment_checking_live(role))
    }

    /// Resolves a selector to a `Segment` (spec §4.3's `getSegment`): NULL
    /// below index 4, TI bit picks LDT vs GDT, the descriptor is read from
    /// the indexed table **in supervisor mode** regardless of current CPL.
    pub fn get_segment(
        &self,
        selector: u16,
        mem: &mut dyn AddressSpace,
    ) -> Result<Segment, Exception> {
        if selector & !0x3 == 0 {
            return Ok(Segment::Null);
        }
        let table = if selector & 0x4 != 0 {
            &self.tables.ldtr
        } else {
            &self.tables.gdtr
        };
        let index = (selector & 0xFFF8) as u32;
        if index + 7 > table.limit() {
            return Err(Exception::gp(selector));
        }
        let addr = table.base().wrapping_add(index);
        let raw = {
            let _guard = SupervisorGuard::enter(mem);
            let lo = mem.get_dword(addr)? as u64;
            let hi = mem.get_dword(addr + 4)? as u64;
            lo | (hi << 32)
        };
        let seg = segments::decode_descriptor(selector, raw)?;
        if !seg.is_present() {
            return Err(Exception::np(selector));
        }
        Ok(seg)
    }

    /// Loads a non-system, non-gate selector into one of DS/ES/FS/GS/SS
    /// (spec §4.3/§3 invariants): NULL is rejected for SS, accepted for
    /// the others; a non-NULL selector triggers a descriptor fetch and
    /// present-bit check.
    pub fn load_seg(
        &mut self,
        reason: LoadReason,
        selector: u16,
        mem: &mut dyn AddressSpace,
    ) -> Result<Segment, Exception> {
        if selector & !0x3 == 0 {
            if matches!(reason, LoadReason::Ss) {
                return Err(Exception::gp(0u16));
            }
            return Ok(Segment::Null);
        }
        if self.mode != CpuMode::Protected || self.flags.control.vm {
            return Ok(Segment::real_mode(selector));
        }
        self.get_segment(selector, mem)
    }

    /// Switches the segment registers to the real-mode representation
    /// (spec §4.3: `convertSegmentsToRealMode`).
    pub fn convert_segments_to_real_mode(&mut self) {
        let sel = |s: &Segment| s.selector();
        self.segments = SegmentFile {
            cs: Segment::real_mode(sel(&self.segments.cs)),
            ds: Segment::real_mode(sel(&self.segments.ds)),
            es: Segment::real_mode(sel(&self.segments.es)),
            fs: Segment::real_mode(sel(&self.segments.fs)),
            gs: Segment::real_mode(sel(&self.segments.gs)),
            ss: Segment::real_mode(sel(&self.segments.ss)),
        };
        self.mode = CpuMode::Real;
    }

    /// Re-resolves every segment register's descriptor after a transition
    /// into protected mode (spec §4.3: `convertSegmentsToProtectedMode`).
    pub fn convert_segments_to_protected_mode(
        &mut self,
        mem: &mut dyn AddressSpace,
    ) -> Result<(), Exception> {
        self.mode = CpuMode::Protected;
        self.segments.cs = self.get_segment(self.segments.cs.selector(), mem)?;
        self.segments.ds = self.load_seg(LoadReason::DataOrIndex, self.segments.ds.selector(), mem)?;
        self.segments.es = self.load_seg(LoadReason::DataOrIndex, self.segments.es.selector(), mem)?;
        self.segments.fs = self.load_seg(LoadReason::DataOrIndex, self.segments.fs.selector(), mem)?;
        self.segments.gs = self.load_seg(LoadReason::DataOrIndex, self.segments.gs.selector(), mem)?;
        self.segments.ss = self.load_seg(LoadReason::Ss, self.segments.ss.selector(), mem)?;
        Ok(())
    }

    /// `setEFlags` with the VM/AC side effects (spec §4.2): toggling AC
    /// doesn't change mode (alignment-checking live-ness is computed
    /// lazily, so there's nothing to "rebind" here beyond the flag write
    /// itself); toggling VM raises a `ModeSwitch` event the caller
    /// (`interp::exec_block`) propagates, rather than applying it inline,
    /// since entering/leaving VM86 also needs the segment reload that only
    /// `iret`/task-switch perform correctly (spec §4.5).
    pub fn set_eflags(&mut self, value: u32, mask: u32) {
        self.flags.set_eflags(value, mask);
    }

    pub fn rflags(&self) -> u32 {
        self.flags.get_eflags()
    }
}

impl Default for Processor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::FlatTestMemory;

    #[test]
    fn reset_establishes_real_mode_segment_invariant() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        for seg in [
            &cpu.segments.cs,
            &cpu.segments.ds,
            &cpu.segments.es,
            &cpu.segments.fs,
            &cpu.segments.gs,
            &cpu.segments.ss,
        ] {
            assert_eq!(seg.base(), (seg.selector() as u32) << 4);
            assert_eq!(seg.limit(), 0xFFFF);
        }
    }

    #[test]
    fn set_cs_keeps_cpl_paired_with_rpl() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        let seg = Segment::Code {
            desc: segments::DescriptorCache {
                selector: 0x08,
                base: 0,
                limit: 0xFFFF_FFFF,
                access: segments::access::PRESENT | segments::access::S_CODE_DATA | 0b1000,
                default_size: true,
            },
            kind: segments::CodeKind::NonConforming,
        };
        cpu.set_cs(seg, 2);
        assert_eq!(cpu.cpl(), 2);
        assert_eq!(cpu.segments.cs.selector() & 0x3, 2);
    }

    #[test]
    fn null_selector_rejected_for_ss_accepted_for_ds() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        let mut mem = FlatTestMemory::new(0x1000);
        assert!(cpu
            .load_seg(LoadReason::Ss, 0, &mut mem)
            .unwrap_err()
            == Exception::gp(0u16));
        assert_eq!(
            cpu.load_seg(LoadReason::DataOrIndex, 0, &mut mem).unwrap(),
            Segment::Null
        );
    }

    #[test]
    fn alignment_checking_live_requires_cpl3_am_ac_and_protected_mode() {
        let mut cpu = Processor::new();
        cpu.init();
        cpu.reset();
        cpu.mode = CpuMode::Protected;
        cpu.control.cr0 |= control::CR0_AM;
        cpu.flags.control.ac = true;
        cpu.control.cpl = 3;
        assert!(cpu.alignment_checking_live(SegRole::Other));
        assert!(!cpu.alignment_checking_live(SegRole::Cs));
        cpu.control.cpl = 0;
        assert!(!cpu.alignment_checking_live(SegRole::Other));
    }
}
