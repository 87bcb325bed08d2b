//! Status lines printed to stdout.
//!
//! Scripts parse these, so separators and field order must stay as they are.

use crate::engine::RuleListing;
use crate::rules::RuleState;
use std::io::{self, Write};

pub const DRY_RUN_NOTICE: &str = "Note: Dry-Run!";

pub fn scalar_change(name: &str, current: u64, desired: u64) -> String {
    format!("{name}:\t{current}s -> {desired}s")
}

pub fn scalar_unchanged(name: &str, value: u64) -> String {
    format!("{name}:\t{value}s (no change)")
}

pub fn rule_change(name: &str, rule: &str, from: RuleState, to: RuleState) -> String {
    format!("{name}:\t{rule} [{from}] -> [{to}]")
}

pub fn rule_unchanged(name: &str, rule: &str, state: RuleState) -> String {
    format!("{name}:\t{rule} [{state}] (no change)")
}

pub fn no_rule(name: &str) -> String {
    format!("{name}:\t(no rule)")
}

pub struct Reporter<W: Write> {
    out: W,
}

impl<W: Write> Reporter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn line(&mut self, line: &str) -> io::Result<()> {
        writeln!(self.out, "{line}")
    }

    pub fn dry_run_notice(&mut self) -> io::Result<()> {
        self.line(DRY_RUN_NOTICE)
    }

    /// `name:` padded to the widest name, then the value in seconds.
    pub fn seconds_table(&mut self, rows: &[(String, u64)]) -> io::Result<()> {
        let width = rows.iter().map(|(name, _)| name.chars().count() + 1).max().unwrap_or(0) + 2;
        for (name, value) in rows {
            writeln!(self.out, "{:width$}{}s", format!("{name}:"), value, width = width)?;
        }
        Ok(())
    }

    pub fn rule_listings(&mut self, listings: &[RuleListing]) -> io::Result<()> {
        for listing in listings {
            writeln!(self.out, "{}:", listing.name)?;
            if listing.rules.is_empty() {
                writeln!(self.out, "  (no matching rule)")?;
                continue;
            }
            let width = listing
                .rules
                .iter()
                .map(|(rule, _)| rule.chars().count() + 3)
                .max()
                .unwrap_or(0)
                + 2;
            for (rule, state) in &listing.rules {
                writeln!(
                    self.out,
                    "  {:width$}[{}]",
                    format!("- {rule}:"),
                    state,
                    width = width
                )?;
            }
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}
