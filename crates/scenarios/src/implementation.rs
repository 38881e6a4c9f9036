//! Test-subject implementations (sender/receiver container images)

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// One side of a test subject
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub image: String,
    #[serde(default)]
    pub args: String,
}

/// A sender/receiver pair under evaluation
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Implementation {
    #[serde(default)]
    pub name: String,
    #[serde(alias = "Sender")]
    pub sender: Endpoint,
    #[serde(alias = "Receiver")]
    pub receiver: Endpoint,
}

impl Implementation {
    pub fn new(name: impl Into<String>, sender: Endpoint, receiver: Endpoint) -> Self {
        Self {
            name: name.into(),
            sender,
            receiver,
        }
    }

    /// Pion's GCC implementation, sender and receiver from the same image
    pub fn pion_gcc() -> Self {
        let endpoint = Endpoint {
            image: "engelbart/bwe-test-pion".to_string(),
            args: String::new(),
        };
        Self::new("pion-gcc", endpoint.clone(), endpoint)
    }

    /// Environment consumed by the compose files
    ///
    /// Both flow slots (`_A` and `_B`) run the same implementation.
    pub fn compose_env(&self, output_dir: &Path) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        for slot in ["A", "B"] {
            env.insert(format!("SENDER_{}", slot), self.sender.image.clone());
            env.insert(format!("RECEIVER_{}", slot), self.receiver.image.clone());
            env.insert(format!("SENDER_{}_ARGS", slot), self.sender.args.clone());
            env.insert(format!("RECEIVER_{}_ARGS", slot), self.receiver.args.clone());
        }
        env.insert("OUTPUT".to_string(), output_dir.display().to_string());
        env
    }
}
