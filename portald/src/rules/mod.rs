pub mod iptables;
pub mod portal;

#[cfg(test)]
pub mod fake;

use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {output}")]
    Exit {
        command: String,
        status: i32,
        output: String,
    },

    #[error("unexpected rule-table output: {0}")]
    Malformed(String),

    #[error("{} rule operation(s) failed: {}", .0.len(), JoinErrors(.0))]
    Aggregate(Vec<RuleError>),
}

impl RuleError {
    /// Collapse collected errors: none is success, one is returned as-is.
    pub fn aggregate(mut errors: Vec<RuleError>) -> Result<(), RuleError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(RuleError::Aggregate(errors)),
        }
    }
}

struct JoinErrors<'a>(&'a [RuleError]);

impl fmt::Display for JoinErrors<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}

/// External packet-filter rule table.
///
/// Rules are ordered argument lists in iptables match/target syntax. Every
/// call is checked against the live table, so repeating a call is harmless.
pub trait RuleTable {
    /// Create `chain` if missing. Returns whether it already existed.
    fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool, RuleError>;

    /// Append the rule if missing. Returns whether it already existed.
    fn ensure_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError>;

    /// Delete the rule. Deleting a rule that is not present succeeds.
    fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<(), RuleError>;

    /// Remove every rule from `chain`.
    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError>;
}

impl<T: RuleTable + ?Sized> RuleTable for &T {
    fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool, RuleError> {
        (**self).ensure_chain(table, chain)
    }

    fn ensure_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError> {
        (**self).ensure_rule(table, chain, args)
    }

    fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<(), RuleError> {
        (**self).delete_rule(table, chain, args)
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        (**self).flush_chain(table, chain)
    }
}
