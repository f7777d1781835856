//! Control state (spec §3, §4 / C5): CR0..CR4, DR0..DR7, the MSR map, CPL,
//! and the atomically-shared `interruptFlags` word (spec §5).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_MP: u32 = 1 << 1;
pub const CR0_EM: u32 = 1 << 2;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_ET: u32 = 1 << 4;
pub const CR0_NE: u32 = 1 << 5;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_AM: u32 = 1 << 18;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_VME: u32 = 1 << 0;
pub const CR4_PVI: u32 = 1 << 1;
pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_DE: u32 = 1 << 3;
pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;
pub const CR4_MCE: u32 = 1 << 6;
pub const CR4_PGE: u32 = 1 << 7;

pub const MSR_SYSENTER_CS: u32 = 0x174;
pub const MSR_SYSENTER_ESP: u32 = 0x175;
pub const MSR_SYSENTER_EIP: u32 = 0x176;
pub const MSR_APIC_BASE: u32 = 0x1B;

/// DR7 breakpoint-enable bits cleared on task switch (spec §4.7 step 9):
/// L0..L3 (local-enable) and LE (bit 8, global local-exact).
pub const DR7_LOCAL_ENABLE_MASK: u32 = 0b0101_0101 | (1 << 8);

#[derive(Clone, Debug, Default)]
pub struct ControlState {
    pub cr0: u32,
    pub cr2: u32,
    pub cr3: u32,
    pub cr4: u32,
    pub dr: [u32; 8],
    msrs: BTreeMap<u32, u64>,
    pub cpl: u8,
    pub halted: bool,
}

impl ControlState {
    pub fn new() -> Self {
        let mut msrs = BTreeMap::new();
        msrs.insert(MSR_SYSENTER_CS, 0);
        msrs.insert(MSR_SYSENTER_ESP, 0);
        msrs.insert(MSR_SYSENTER_EIP, 0);
        msrs.insert(MSR_APIC_BASE, 0xFEE0_0900);
        ControlState {
            cr0: CR0_ET,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr: [0; 8],
            msrs,
            cpl: 0,
            halted: false,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }

    /// Unknown MSR reads return 0 (spec §3); writes always succeed and are
    /// accepted even for MSRs this core has no special meaning for (spec
    /// §7: "unknown MSR *write* — there are none currently defined").
    pub fn rdmsr(&self, index: u32) -> u64 {
        self.msrs.get(&index).copied().unwrap_or(0)
    }

    pub fn wrmsr(&mut self, index: u32, value: u64) {
        self.msrs.insert(index, value);
    }

    pub fn msr_iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.msrs.iter().map(|(&k, &v)| (k, v))
    }

    pub fn msr_count(&self) -> usize {
        self.msrs.len()
    }

    /// Replaces the whole MSR map wholesale, used by `loadState` so a
    /// restored processor doesn't retain any of the fresh-construction
    /// defaults the saved stream didn't mention (spec §6).
    pub fn set_msrs(&mut self, msrs: BTreeMap<u32, u64>) {
        self.msrs = msrs;
    }

    /// Clears the DR7 breakpoint-enable bits on task switch (spec §4.7
    /// step 9).
    pub fn clear_debug_breakpoint_enables(&mut self) {
        self.dr[7] &= !DR7_LOCAL_ENABLE_MASK;
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & CR0_PG != 0
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0 & CR0_PE != 0
    }

    pub fn alignment_checking_enabled_for_am(&self) -> bool {
        self.cr0 & CR0_AM != 0
    }
}

/// The atomically-shared interrupt/reset/NMI request word (spec §5). Three
/// independent bitfields, each updated with a single atomic
/// read-modify-write so external threads may raise/clear them without
/// locking, and the Processor observes them only at well-defined
/// interrupt-check points (after each block).
pub struct InterruptFlags {
    word: AtomicU32,
}

pub mod flag {
    pub const HARDWARE_INTERRUPT: u32 = 1 << 0;
    pub const RESET_REQUESTED: u32 = 1 << 1;
    pub const NMI_PENDING: u32 = 1 << 2;
}

impl Default for InterruptFlags {
    fn default() -> Self {
        InterruptFlags {
            word: AtomicU32::new(0),
        }
    }
}

impl InterruptFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, bit: u32) {
        self.word.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn clear(&self, bit: u32) {
        self.word.fetch_and(!bit, Ordering::AcqRel);
    }

    pub fn is_set(&self, bit: u32) -> bool {
        self.word.load(Ordering::Acquire) & bit != 0
    }

    pub fn snapshot(&self) -> u32 {
        self.word.load(Ordering::Acquire)
    }

    /// Overwrites the whole word, used by `loadState` to restore a saved
    /// value (spec §6). Not used on the hot interrupt-delivery path, where
    /// `raise`/`clear`/`take` keep every update a single atomic RMW.
    pub fn restore(&self, value: u32) {
        self.word.store(value, Ordering::Release);
    }

    /// Atomically consumes (tests-and-clears) a bit, returning whether it
    /// was set. Used at the single point the Processor acts on a flag, so a
    /// racing `raise` from another thread cannot be lost or double-consumed.
    pub fn take(&self, bit: u32) -> bool {
        self.word.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_msr_read_returns_zero() {
        let cs = ControlState::new();
        assert_eq!(cs.rdmsr(0xDEAD_BEEF), 0);
    }

    #[test]
    fn msr_write_always_succeeds_even_for_unknown_index() {
        let mut cs = ControlState::new();
        cs.wrmsr(0x1234, 0xABCD);
        assert_eq!(cs.rdmsr(0x1234), 0xABCD);
    }

    #[test]
    fn interrupt_flags_take_is_atomic_test_and_clear() {
        let flags = InterruptFlags::new();
        flags.raise(flag::HARDWARE_INTERRUPT);
        assert!(flags.take(flag::HARDWARE_INTERRUPT));
        assert!(!flags.is_set(flag::HARDWARE_INTERRUPT));
        assert!(!flags.take(flag::HARDWARE_INTERRUPT));
    }

    #[test]
    fn clear_debug_breakpoint_enables_clears_le_and_local_bits() {
        let mut cs = ControlState::new();
        cs.dr[7] = 0xFFFF_FFFF;
        cs.clear_debug_breakpoint_enables();
        assert_eq!(cs.dr[7] & DR7_LOCAL_ENABLE_MASK, 0);
        assert_ne!(cs.dr[7], 0); // other bits untouched
    }
}
