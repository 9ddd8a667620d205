//! In-memory rule table used by tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use super::{RuleError, RuleTable};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EnsureChain(String),
    EnsureRule(String, Vec<String>),
    DeleteRule(String, Vec<String>),
    FlushChain(String),
}

#[derive(Default)]
struct State {
    chains: BTreeMap<(String, String), Vec<Vec<String>>>,
    calls: Vec<Call>,
    fail_matching: Vec<String>,
}

/// Clones share the same table so tests can inspect what a moved copy did.
#[derive(Clone, Default)]
pub struct FakeTable {
    state: Arc<Mutex<State>>,
}

impl FakeTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Fail every rule mutation whose arguments contain `needle`.
    pub fn fail_rules_containing(&self, needle: &str) {
        self.state().fail_matching.push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.state().fail_matching.clear();
    }

    pub fn rules(&self, table: &str, chain: &str) -> Vec<Vec<String>> {
        self.state()
            .chains
            .get(&(table.to_string(), chain.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        self.state().chains.contains_key(&(table.to_string(), chain.to_string()))
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<Call> {
        std::mem::take(&mut self.state().calls)
    }

    /// Total rules across all chains whose arguments contain `needle`.
    pub fn count_rules_containing(&self, needle: &str) -> usize {
        self.state()
            .chains
            .values()
            .flatten()
            .filter(|args| args.iter().any(|a| a.contains(needle)))
            .count()
    }

    fn check_failure(state: &State, chain: &str, args: &[String]) -> Result<(), RuleError> {
        if state
            .fail_matching
            .iter()
            .any(|needle| args.iter().any(|a| a.contains(needle.as_str())))
        {
            return Err(RuleError::Exit {
                command: format!("fake -A {}", chain),
                status: 4,
                output: "resource temporarily unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl RuleTable for FakeTable {
    fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool, RuleError> {
        let mut state = self.state();
        state.calls.push(Call::EnsureChain(chain.to_string()));
        let key = (table.to_string(), chain.to_string());
        let existed = state.chains.contains_key(&key);
        state.chains.entry(key).or_default();
        Ok(existed)
    }

    fn ensure_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<bool, RuleError> {
        let mut state = self.state();
        state.calls.push(Call::EnsureRule(chain.to_string(), args.to_vec()));
        Self::check_failure(&state, chain, args)?;
        let rules = state.chains.entry((table.to_string(), chain.to_string())).or_default();
        if rules.iter().any(|r| r == args) {
            return Ok(true);
        }
        rules.push(args.to_vec());
        Ok(false)
    }

    fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<(), RuleError> {
        let mut state = self.state();
        state.calls.push(Call::DeleteRule(chain.to_string(), args.to_vec()));
        Self::check_failure(&state, chain, args)?;
        if let Some(rules) = state.chains.get_mut(&(table.to_string(), chain.to_string())) {
            rules.retain(|r| r != args);
        }
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<(), RuleError> {
        let mut state = self.state();
        state.calls.push(Call::FlushChain(chain.to_string()));
        match state.chains.get_mut(&(table.to_string(), chain.to_string())) {
            Some(rules) => {
                rules.clear();
                Ok(())
            }
            None => Err(RuleError::Exit {
                command: format!("fake -F {}", chain),
                status: 1,
                output: "No chain/target/match by that name.".to_string(),
            }),
        }
    }
}
