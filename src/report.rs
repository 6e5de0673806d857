use std::collections::BTreeMap;
use std::fmt;

use log::{info, warn};

/// Tally key recorded when a method is abandoned for an unsupported handler kind.
pub(crate) const UNHANDLED_EXCEPTION: &str = "unhandled-exception";

/// Per-run translation bookkeeping, merged across passes instead of kept in globals.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct TranslationLog {
    /// Abandoned methods and the number of instructions left untranslated.
    pub(crate) unfinished: BTreeMap<String, usize>,
    pub(crate) unknown_instructions: BTreeMap<String, usize>,
    pub(crate) timed_out: usize,
    pub(crate) skipped_duplicates: usize,
    pub(crate) skipped_no_debug_info: usize,
    pub(crate) translated_methods: usize,
    pub(crate) total_instructions: usize,
}

impl TranslationLog {
    pub(crate) fn record_translated(&mut self, instructions: usize) {
        self.translated_methods += 1;
        self.total_instructions += instructions;
    }

    pub(crate) fn record_unfinished(&mut self, method: &str, instructions: usize, remaining: usize) {
        self.total_instructions += instructions;
        self.unfinished.insert(method.to_string(), remaining);
    }

    pub(crate) fn record_unknown_instruction(&mut self, mnemonic: &str) {
        *self
            .unknown_instructions
            .entry(mnemonic.to_string())
            .or_default() += 1;
    }

    pub(crate) fn merge(&mut self, other: TranslationLog) {
        self.unfinished.extend(other.unfinished);
        for (mnemonic, count) in other.unknown_instructions {
            *self.unknown_instructions.entry(mnemonic).or_default() += count;
        }
        self.timed_out += other.timed_out;
        self.skipped_duplicates += other.skipped_duplicates;
        self.skipped_no_debug_info += other.skipped_no_debug_info;
        self.translated_methods += other.translated_methods;
        self.total_instructions += other.total_instructions;
    }

    pub(crate) fn coverage(&self) -> CoverageStats {
        let failed_methods = self.unfinished.len();
        let total_methods = self.translated_methods + failed_methods;
        let skipped_instructions: usize = self.unfinished.values().sum();
        CoverageStats {
            translated_methods: self.translated_methods,
            partial_methods: failed_methods,
            total_methods,
            translated_instructions: self.total_instructions.saturating_sub(skipped_instructions),
            skipped_instructions,
            total_instructions: self.total_instructions,
        }
    }

    /// Logs the unknown-instruction tally (least frequent first) and coverage.
    pub(crate) fn report(&self) {
        if self.timed_out > 0 {
            warn!("{} method(s) timed out", self.timed_out);
        }
        if !self.unknown_instructions.is_empty() {
            warn!("unknown instructions:");
            let mut tally: Vec<_> = self.unknown_instructions.iter().collect();
            tally.sort_by_key(|(_, count)| **count);
            for (mnemonic, count) in tally {
                warn!("{mnemonic}: {count}");
            }
        }
        for line in self.coverage().to_string().lines() {
            info!("{line}");
        }
    }
}

/// Method and instruction coverage of a translation run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct CoverageStats {
    pub(crate) translated_methods: usize,
    pub(crate) partial_methods: usize,
    pub(crate) total_methods: usize,
    pub(crate) translated_instructions: usize,
    pub(crate) skipped_instructions: usize,
    pub(crate) total_instructions: usize,
}

/// Integer percentage, ties rounded to even.
pub(crate) fn percent(part: usize, whole: usize) -> u32 {
    if whole == 0 {
        return 0;
    }
    (100.0 * part as f64 / whole as f64).round_ties_even() as u32
}

impl fmt::Display for CoverageStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "coverage statistics:")?;
        writeln!(
            f,
            "methods successfully translated: {} ({}%)",
            self.translated_methods,
            percent(self.translated_methods, self.total_methods)
        )?;
        writeln!(
            f,
            "methods partially translated: {} ({}%)",
            self.partial_methods,
            percent(self.partial_methods, self.total_methods)
        )?;
        writeln!(
            f,
            "instructions translated: {} ({}%)",
            self.translated_instructions,
            percent(self.translated_instructions, self.total_instructions)
        )?;
        write!(
            f,
            "instructions skipped: {} ({}%)",
            self.skipped_instructions,
            percent(self.skipped_instructions, self.total_instructions)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counters_and_tallies() {
        let mut left = TranslationLog::default();
        left.record_translated(10);
        left.record_unknown_instruction("conv.i8");

        let mut right = TranslationLog::default();
        right.record_unfinished("System.Void App::Run()", 8, 3);
        right.record_unknown_instruction("conv.i8");
        right.record_unknown_instruction(UNHANDLED_EXCEPTION);
        right.timed_out = 1;

        left.merge(right);

        assert_eq!(left.unknown_instructions["conv.i8"], 2);
        assert_eq!(left.unknown_instructions[UNHANDLED_EXCEPTION], 1);
        assert_eq!(left.timed_out, 1);
        assert_eq!(left.unfinished["System.Void App::Run()"], 3);
        assert_eq!(left.total_instructions, 18);
    }

    #[test]
    fn coverage_rounds_ties_to_even() {
        assert_eq!(percent(1, 8), 12);
        assert_eq!(percent(3, 8), 38);
        assert_eq!(percent(0, 0), 0);

        let mut log = TranslationLog::default();
        log.record_translated(6);
        log.record_unfinished("System.Void App::Run()", 2, 2);
        let stats = log.coverage();

        assert_eq!(stats.total_methods, 2);
        assert_eq!(stats.translated_instructions, 6);
        assert!(stats.to_string().contains("instructions skipped: 2 (25%)"));
    }
}
