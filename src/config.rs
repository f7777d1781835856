//! Recognized configuration options (spec §6 / §4.12).

/// Options consumed by this core. Kept as a plain struct with `Default`
/// rather than a builder: there is exactly one documented option today, and
/// a builder would be speculative ceremony for a single `u32` (see the
/// project-wide "no premature abstraction" policy).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Upper bound on instructions per basic block. Default 1000. Setting
    /// this to 1 enables the `SKIP_SLEEPS` fast path in
    /// `interrupts::wait_for_interrupt`: a caller pinning block size to one
    /// instruction is single-stepping, so the HLT loop does not ask the
    /// clock collaborator to sleep between polls.
    pub max_instructions_per_block: u32,
}

impl Config {
    pub const DEFAULT_MAX_INSTRUCTIONS_PER_BLOCK: u32 = 1000;

    pub fn skip_sleeps(&self) -> bool {
        self.max_instructions_per_block == 1
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_instructions_per_block: Self::DEFAULT_MAX_INSTRUCTIONS_PER_BLOCK,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_value() {
        assert_eq!(Config::default().max_instructions_per_block, 1000);
        assert!(!Config::default().skip_sleeps());
    }

    #[test]
    fn block_size_one_enables_skip_sleeps() {
        let cfg = Config {
            max_instructions_per_block: 1,
        };
        assert!(cfg.skip_sleeps());
    }
}
