//! # Patch Statistics
//!
//! Counters collected over one load.

use core::fmt;

/// Statistics of a single load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    /// Records decoded (known and unknown)
    pub total_records: usize,
    /// Records that wrote target memory
    pub applied: usize,
    /// Unknown records skipped under the lenient policy
    pub unknown_skipped: usize,
    /// Bytes copied into the code section
    pub code_bytes: usize,
    /// Bytes zero-filled in the bss section
    pub bss_bytes: usize,
    /// Constructors invoked
    pub ctors_run: usize,
    /// Null constructor entries skipped
    pub ctors_skipped: usize,

    // Per-group counts
    /// Addr32 / Addr16Lo / Addr16Hi / Addr16Ha fixups
    pub addr_fixups: usize,
    /// Rel24 fixups
    pub rel24_fixups: usize,
    /// Write32 / Write16 / Write8 records
    pub writes: usize,
    /// Conditional writes whose expected value matched
    pub cond_written: usize,
    /// Conditional writes left alone because the value differed
    pub cond_skipped: usize,
    /// Branch / BranchLink injections
    pub branches: usize,
}

impl PatchStats {
    /// Creates a new `PatchStats` with all counters initialized to zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if every decoded record was a known opcode.
    pub fn is_clean(&self) -> bool {
        self.unknown_skipped == 0
    }
}

impl fmt::Display for PatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Patch Statistics:")?;
        writeln!(f, "  Records:        {}", self.total_records)?;
        writeln!(f, "  Applied:        {}", self.applied)?;
        writeln!(f, "  Unknown:        {}", self.unknown_skipped)?;
        writeln!(f, "  Code/bss bytes: {}/{}", self.code_bytes, self.bss_bytes)?;
        writeln!(f, "  Ctors:          {} run, {} null", self.ctors_run, self.ctors_skipped)?;
        writeln!(f, "  By group:")?;
        writeln!(f, "    Addr:         {}", self.addr_fixups)?;
        writeln!(f, "    Rel24:        {}", self.rel24_fixups)?;
        writeln!(f, "    Write:        {}", self.writes)?;
        writeln!(f, "    CondWrite:    {}/{}", self.cond_written, self.cond_skipped)?;
        write!(f, "    Branch:       {}", self.branches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_lists_groups() {
        let stats = PatchStats {
            total_records: 3,
            applied: 2,
            unknown_skipped: 1,
            writes: 2,
            ..PatchStats::new()
        };
        let report = format!("{}", stats);
        assert!(report.contains("Records:        3"));
        assert!(report.contains("Write:        2"));
        assert!(!stats.is_clean());
    }
}
