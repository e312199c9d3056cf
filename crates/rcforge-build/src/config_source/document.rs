//! Configuration document format shared by every configuration backend.
//!
//! ```json
//! {
//!   "version": "3.4.0",
//!   "parameters": [
//!     {"name": "power", "kind": {"type": "choice", "options": ["100mW", "250mW"]}, "default": "100mW"},
//!     {"name": "unlock_higher_power", "kind": {"type": "flag"}, "conflicts_with": ["regulatory_domain_eu"]}
//!   ],
//!   "devices": {
//!     "TX_ESP32": {"parameters": ["power", "unlock_higher_power"], "defaults": {"power": "250mW"}}
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashMap};

use rcforge_core::{ParamValue, ParameterSet, TargetId};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Value domain of a parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterKind {
    Flag,
    Integer { min: i64, max: i64 },
    Choice { options: Vec<String> },
    Text,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDefinition {
    pub name: String,

    pub kind: ParameterKind,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub default: Option<ParamValue>,

    /// Parameters that may not be active at the same time as this one.
    #[serde(default)]
    pub conflicts_with: Vec<String>,
}

impl ParameterDefinition {
    fn check(&self, value: &ParamValue) -> Result<(), ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidValue {
            parameter: self.name.clone(),
            reason,
        };
        match (&self.kind, value) {
            (ParameterKind::Flag, ParamValue::Flag(_)) => Ok(()),
            (ParameterKind::Integer { min, max }, ParamValue::Integer(v)) => {
                if v < min || v > max {
                    Err(invalid(format!("{v} outside {min}..={max}")))
                } else {
                    Ok(())
                }
            }
            (ParameterKind::Choice { options }, ParamValue::Text(v)) => {
                if options.iter().any(|o| o == v) {
                    Ok(())
                } else {
                    Err(invalid(format!("{v} is not one of {}", options.join(", "))))
                }
            }
            (ParameterKind::Text, ParamValue::Text(_)) => Ok(()),
            (kind, value) => Err(invalid(format!("expected {kind:?}, got {value:?}"))),
        }
    }
}

/// Per-target section of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Parameters the target accepts.
    #[serde(default)]
    pub parameters: Vec<String>,

    /// Target-specific defaults, applied over definition defaults.
    #[serde(default)]
    pub defaults: ParameterSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub parameters: Vec<ParameterDefinition>,

    #[serde(default)]
    pub devices: BTreeMap<TargetId, DeviceConfig>,
}

/// Active parameters take part in conflict checks; a `false` flag does not.
fn is_active(value: &ParamValue) -> bool {
    !matches!(value, ParamValue::Flag(false))
}

impl ConfigDocument {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Targets the document can resolve, ordered by id.
    pub fn targets(&self) -> Vec<TargetId> {
        self.devices.keys().cloned().collect()
    }

    /// Resolve the concrete parameter set for `target`.
    ///
    /// Precedence, lowest first: definition default, target default, override.
    pub fn resolve(&self, target: &TargetId, overrides: &ParameterSet) -> Result<ParameterSet, ConfigError> {
        let device = self
            .devices
            .get(target)
            .ok_or_else(|| ConfigError::UnknownDevice(target.to_string()))?;

        let definitions: HashMap<&str, &ParameterDefinition> =
            self.parameters.iter().map(|d| (d.name.as_str(), d)).collect();

        let mut resolved = ParameterSet::new();
        for name in &device.parameters {
            let definition = definitions.get(name.as_str()).ok_or_else(|| {
                ConfigError::Malformed(format!("target {target} lists undefined parameter {name}"))
            })?;
            if let Some(default) = &definition.default {
                resolved.insert(name.clone(), default.clone());
            }
        }

        for (name, value) in device.defaults.iter() {
            if !device.parameters.contains(name) {
                return Err(ConfigError::Malformed(format!(
                    "target {target} sets a default for unlisted parameter {name}"
                )));
            }
            resolved.insert(name.clone(), value.clone());
        }

        for (name, value) in overrides.iter() {
            if !definitions.contains_key(name.as_str()) {
                return Err(ConfigError::UnknownParameter(name.clone()));
            }
            if !device.parameters.contains(name) {
                return Err(ConfigError::NotAccepted {
                    target: target.to_string(),
                    parameter: name.clone(),
                });
            }
            resolved.insert(name.clone(), value.clone());
        }

        for (name, value) in resolved.iter() {
            let definition = definitions.get(name.as_str()).ok_or_else(|| {
                ConfigError::Malformed(format!("parameter {name} has no definition"))
            })?;
            definition.check(value)?;
            if !is_active(value) {
                continue;
            }
            for other in &definition.conflicts_with {
                if resolved.get(other).map(is_active).unwrap_or(false) {
                    let (first, second) = if name < other {
                        (name.clone(), other.clone())
                    } else {
                        (other.clone(), name.clone())
                    };
                    return Err(ConfigError::Conflict { first, second });
                }
            }
        }

        Ok(resolved)
    }
}
