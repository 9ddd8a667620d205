//! `RuleTable` backed by the iptables command line tools.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::{Command, Output};
use super::{RuleError, RuleTable};

/// First release supporting `-C` for rule existence checks
const CHECK_MIN_VERSION: (u32, u32, u32) = (1, 4, 11);

/// First release supporting `-w` to wait for the xtables lock
const WAIT_MIN_VERSION: (u32, u32, u32) = (1, 4, 20);

pub struct IptablesRuntime {
    iptables: PathBuf,
    iptables_save: PathBuf,
    has_check: bool,
    has_wait: bool,
}

impl IptablesRuntime {
    /// Detect the installed iptables version to pick the check and locking strategy.
    pub fn new(iptables: impl Into<PathBuf>, iptables_save: impl Into<PathBuf>) -> Result<Self, RuleError> {
        let iptables = iptables.into();
        let output = Command::new(&iptables)
            .arg("--version")
            .output()
            .map_err(|source| RuleError::Spawn {
                command: format!("{} --version", iptables.display()),
                source,
            })?;
        let version = parse_version(&String::from_utf8_lossy(&output.stdout))?;

        let runtime = Self {
            iptables,
            iptables_save: iptables_save.into(),
            has_check: version >= CHECK_MIN_VERSION,
            has_wait: version >= WAIT_MIN_VERSION,
        };

        tracing::info!(
            "Using iptables {}.{}.{} (check: {}, wait: {})",
            version.0,
            version.1,
            version.2,
            if runtime.has_check { "-C" } else { "iptables-save" },
            runtime.has_wait
        );

        Ok(runtime)
    }

    fn run(&self, table: &str, op: &str, chain: &str, args: &[String]) -> Result<Output, RuleError> {
        let mut cmd = Command::new(&self.iptables);
        if self.has_wait {
            cmd.arg("-w");
        }
        cmd.args(["-t", table, op, chain]).args(args);

        cmd.output().map_err(|source| RuleError::Spawn {
            command: describe(&self.iptables, table, op, chain),
            source,
        })
    }

    fn run_checked(&self, table: &str, op: &str, chain: &str, args: &[String]) -> Result<(), RuleError> {
        let output = self.run(table, op, chain, args)?;
        if output.status.success() {
            return Ok(());
        }
        Err(exit_error(describe(&self.iptables, table, op, chain), &output))
    }

    fn check_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError> {
        if self.has_check {
            self.check_rule_native(table, chain, args)
        } else {
            self.check_rule_with_save(table, chain, args)
        }
    }

    fn check_rule_native(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError> {
        let output = self.run(table, "-C", chain, args)?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(exit_error(describe(&self.iptables, table, "-C", chain), &output)),
        }
    }

    fn check_rule_with_save(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError> {
        let output = Command::new(&self.iptables_save)
            .args(["-t", table])
            .output()
            .map_err(|source| RuleError::Spawn {
                command: format!("{} -t {}", self.iptables_save.display(), table),
                source,
            })?;
        if !output.status.success() {
            return Err(exit_error(
                format!("{} -t {}", self.iptables_save.display(), table),
                &output,
            ));
        }
        Ok(rule_in_save_output(&String::from_utf8_lossy(&output.stdout), chain, args))
    }
}

impl RuleTable for IptablesRuntime {
    fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool, RuleError> {
        let output = self.run(table, "-N", chain, &[])?;
        match output.status.code() {
            Some(0) => Ok(false),
            // Exit status 1 from -N: chain already exists
            Some(1) => Ok(true),
            _ => Err(exit_error(describe(&self.iptables, table, "-N", chain), &output)),
        }
    }

    fn ensure_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError> {
        if self.check_rule(table, chain, args)? {
            return Ok(true);
        }
        self.run_checked(table, "-A", chain, args)?;
        Ok(false)
    }

    fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<(), RuleError> {
        if !self.check_rule(table, chain, args)? {
            return Ok(());
        }
        self.run_checked(table, "-D", chain, args)
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        self.run_checked(table, "-F", chain, &[])
    }
}

fn describe(program: &std::path::Path, table: &str, op: &str, chain: &str) -> String {
    format!("{} -t {} {} {}", program.display(), table, op, chain)
}

fn exit_error(command: String, output: &Output) -> RuleError {
    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    RuleError::Exit {
        command,
        status: output.status.code().unwrap_or(-1),
        output: combined.trim().to_string(),
    }
}

/// Parse `iptables v1.8.7 (nf_tables)` style output into (major, minor, patch).
pub fn parse_version(output: &str) -> Result<(u32, u32, u32), RuleError> {
    let token = output
        .split_whitespace()
        .find_map(|word| word.strip_prefix('v'))
        .ok_or_else(|| RuleError::Malformed(format!("no version in {:?}", output.trim())))?;

    let mut parts = token.split('.').map(|part| {
        part.parse::<u32>()
            .map_err(|_| RuleError::Malformed(format!("bad version component {:?}", part)))
    });

    let major = parts.next().transpose()?.unwrap_or(0);
    let minor = parts.next().transpose()?.unwrap_or(0);
    let patch = parts.next().transpose()?.unwrap_or(0);
    Ok((major, minor, patch))
}

/// Whether an `iptables-save` dump holds a rule in `chain` matching every arg.
///
/// Fields are compared as sets with quotes stripped, so the args must use the
/// same spelling iptables-save prints (e.g. `-d 10.0.0.1/32`).
pub fn rule_in_save_output(dump: &str, chain: &str, args: &[String]) -> bool {
    let wanted: HashSet<&str> = args.iter().map(String::as_str).collect();

    dump.lines().any(|line| {
        let mut fields = line.split_whitespace();
        if fields.next() != Some("-A") || fields.next() != Some(chain) {
            return false;
        }
        let present: HashSet<&str> = fields.map(|f| f.trim_matches('"')).collect();
        present.is_superset(&wanted)
    })
}
