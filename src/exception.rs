//! Architectural fault/trap taxonomy (spec §7) and the delivery-time wrapper
//! around it.

/// An architectural exception, as raised by any layer of the core or by an
/// external instruction handler.
///
/// Each variant carries exactly the fields needed to compute its error code
/// (some exceptions always push one, some never do, some carry the faulting
/// selector). `PageFault` additionally carries the faulting linear address,
/// which the interrupt-delivery path (`interrupts::deliver`) writes into
/// CR2 before resolving the gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DivideError,
    Debug,
    Nmi,
    Breakpoint,
    Overflow,
    BoundRange,
    InvalidOpcode,
    DeviceNotAvailable,
    DoubleFault,
    CoprocessorSegmentOverrun,
    InvalidTss { selector: u16 },
    SegmentNotPresent { selector: u16 },
    StackFault { selector: Option<u16> },
    GeneralProtection { selector: Option<u16> },
    PageFault { addr: u32, error_code: u32 },
    FloatingPoint,
    AlignmentCheck,
}

impl Exception {
    /// Vector number (spec §7's numbering).
    pub fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Nmi => 2,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::BoundRange => 5,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::DoubleFault => 8,
            Exception::CoprocessorSegmentOverrun => 9,
            Exception::InvalidTss { .. } => 10,
            Exception::SegmentNotPresent { .. } => 11,
            Exception::StackFault { .. } => 12,
            Exception::GeneralProtection { .. } => 13,
            Exception::PageFault { .. } => 14,
            Exception::FloatingPoint => 16,
            Exception::AlignmentCheck => 17,
        }
    }

    /// The error code pushed on delivery, if this vector pushes one at all.
    /// `EXT` (bit 0, "this fault was provoked by an event external to the
    /// program, e.g. a hardware interrupt that faulted") is ORed in by the
    /// caller of `deliver`, not here, since this type doesn't know whether
    /// delivery is for a hardware or software event.
    pub fn error_code(&self) -> Option<u32> {
        match *self {
            Exception::InvalidTss { selector } => Some(selector as u32),
            Exception::SegmentNotPresent { selector } => Some(selector as u32),
            Exception::StackFault { selector } => Some(selector.unwrap_or(0) as u32),
            Exception::GeneralProtection { selector } => Some(selector.unwrap_or(0) as u32),
            Exception::PageFault { error_code, .. } => Some(error_code),
            _ => None,
        }
    }

    /// Whether EIP should name the faulting instruction (`true`) or the
    /// instruction after it (`false` — traps). Per spec §4.9/§7.
    pub fn points_to_self(&self) -> bool {
        !matches!(self, Exception::Breakpoint | Exception::Overflow)
    }

    /// Convenience constructors matching the fault shapes most often raised
    /// by the control-transfer/segment-load paths in this crate.
    pub fn gp(selector: impl Into<Option<u16>>) -> Exception {
        Exception::GeneralProtection {
            selector: selector.into(),
        }
    }

    pub fn np(selector: u16) -> Exception {
        Exception::SegmentNotPresent { selector }
    }

    pub fn ss(selector: impl Into<Option<u16>>) -> Exception {
        Exception::StackFault {
            selector: selector.into(),
        }
    }

    pub fn ts(selector: u16) -> Exception {
        Exception::InvalidTss { selector }
    }

    /// The classic x86 "contributory vs. page-fault" classification used by
    /// the double-fault combination table (spec §4.8).
    pub fn combine_class(&self) -> CombineClass {
        match self {
            Exception::PageFault { .. } => CombineClass::PageFault,
            Exception::DivideError
            | Exception::InvalidTss { .. }
            | Exception::SegmentNotPresent { .. }
            | Exception::StackFault { .. }
            | Exception::GeneralProtection { .. } => CombineClass::Contributory,
            _ => CombineClass::Benign,
        }
    }
}

/// A mode transition signaled as control flow rather than as a fault (spec
/// §9's "mode switches as control flow" design note): not an architectural
/// exception, never delivered through the interrupt machinery, just a typed
/// event the block interpreter passes up to its caller.
///
/// `EnterVm86` is defined for symmetry with the delivery-side
/// `ExitVm86ToProtected` event but isn't currently raised: `iret`'s VM86-
/// entry path (`transfer::iret`) already applies every segment/mode mutation
/// inline before returning, matching how every other control transfer in
/// this crate mutates state eagerly rather than deferring to an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeSwitchKind {
    EnterVm86,
    ExitVm86ToProtected,
}

/// Classification used to decide whether two back-to-back faults combine
/// into a double fault, per the classic x86 table:
/// contributory+contributory, contributory+page-fault, and page-fault+
/// page-fault all combine; anything paired with a benign fault does not.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CombineClass {
    Benign,
    Contributory,
    PageFault,
}

impl CombineClass {
    pub fn combines_with(self, other: CombineClass) -> bool {
        use CombineClass::*;
        !matches!((self, other), (Benign, _) | (_, Benign))
    }
}
