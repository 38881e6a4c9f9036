//! Explicitly constructed registry of test cases and implementations
//!
//! Nothing here is process-wide: callers build a `Registry` (from the
//! built-in presets, JSON files, or by hand) and pass it to whoever needs it.

use crate::implementation::Implementation;
use crate::scenario::TestCase;
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub struct Registry {
    test_cases: BTreeMap<String, TestCase>,
    implementations: BTreeMap<String, Implementation>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reference test cases and the pion implementation
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        for case in [
            TestCase::variable_capacity_single_flow(),
            TestCase::vnet_variable_capacity_single_flow(),
            TestCase::vnet_variable_capacity_multiple_flow(),
            TestCase::vnet_congested_feedback_link(),
            TestCase::vnet_round_trip_time_fairness(),
        ] {
            registry.add_test_case(case);
        }
        registry.add_implementation(Implementation::pion_gcc());
        registry
    }

    /// Load both maps from JSON files (`{"<name>": {...}, ...}`)
    pub fn from_files(
        test_cases: impl AsRef<Path>,
        implementations: impl AsRef<Path>,
    ) -> Result<Self> {
        let mut registry = Self::new();
        registry.load_test_cases(test_cases)?;
        registry.load_implementations(implementations)?;
        Ok(registry)
    }

    pub fn load_test_cases(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading test cases from {}", path.display()))?;
        self.merge_test_cases_json(&json)
            .with_context(|| format!("parsing test cases from {}", path.display()))
    }

    pub fn load_implementations(&mut self, path: impl AsRef<Path>) -> Result<&mut Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading implementations from {}", path.display()))?;
        self.merge_implementations_json(&json)
            .with_context(|| format!("parsing implementations from {}", path.display()))
    }

    /// Add every case of a JSON map; the map key names a case without one
    pub fn merge_test_cases_json(&mut self, json: &str) -> Result<&mut Self> {
        let cases: BTreeMap<String, TestCase> = serde_json::from_str(json)?;
        for (key, mut case) in cases {
            if case.name.is_empty() {
                case.name = key.clone();
            }
            case.validate().map_err(|e| anyhow!(e))?;
            self.test_cases.insert(key, case);
        }
        Ok(self)
    }

    pub fn merge_implementations_json(&mut self, json: &str) -> Result<&mut Self> {
        let implementations: BTreeMap<String, Implementation> = serde_json::from_str(json)?;
        for (key, mut implementation) in implementations {
            if implementation.name.is_empty() {
                implementation.name = key.clone();
            }
            self.implementations.insert(key, implementation);
        }
        Ok(self)
    }

    pub fn add_test_case(&mut self, case: TestCase) -> &mut Self {
        self.test_cases.insert(case.name.clone(), case);
        self
    }

    pub fn add_implementation(&mut self, implementation: Implementation) -> &mut Self {
        self.implementations
            .insert(implementation.name.clone(), implementation);
        self
    }

    pub fn test_case(&self, name: &str) -> Result<&TestCase> {
        self.test_cases.get(name).ok_or_else(|| {
            anyhow!(
                "unknown scenario: {} (options: {})",
                name,
                self.test_case_names().join(", ")
            )
        })
    }

    pub fn implementation(&self, name: &str) -> Result<&Implementation> {
        self.implementations.get(name).ok_or_else(|| {
            anyhow!(
                "unknown implementation: {} (options: {})",
                name,
                self.implementation_names().join(", ")
            )
        })
    }

    /// Sorted test case names
    pub fn test_case_names(&self) -> Vec<&str> {
        self.test_cases.keys().map(String::as_str).collect()
    }

    /// Sorted implementation names
    pub fn implementation_names(&self) -> Vec<&str> {
        self.implementations.keys().map(String::as_str).collect()
    }

    pub fn test_cases(&self) -> impl Iterator<Item = &TestCase> {
        self.test_cases.values()
    }
}
