//! Device extension registry.
//!
//! Maps the advertised BLE name of each supported device type to its decoder
//! factory and display metadata. The set of decoders is fixed at compile time
//! ([`builtin_factories`]); the registration file only selects which of them
//! are active and under which advertised names.
//!
//! ```json
//! {
//!   "heart_rate": { "ble_name": "HRM-Pro", "description": "Chest strap" },
//!   "ruuvitag":   { "ble_name": "Ruuvi 4C88", "description": "Sauna" }
//! }
//! ```

use crate::decoder::Decoder;
use crate::decoder::battery::BatteryDecoder;
use crate::decoder::environmental::EnvironmentalDecoder;
use crate::decoder::heart_rate::HeartRateDecoder;
use crate::decoder::ruuvi::RuuviDecoder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Creates a fresh decoder for one discovered device.
pub type DecoderFactory = fn() -> Box<dyn Decoder>;

/// Extension id to decoder factory.
pub type FactoryTable = HashMap<&'static str, DecoderFactory>;

/// Startup configuration failures. Always fatal.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed registration data: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("extension '{0}' has no decoder (known: {1})")]
    UnknownDecoder(String, String),
    #[error("extension '{0}' has an empty ble_name")]
    EmptyBleName(String),
    #[error("extensions '{first}' and '{second}' both claim ble_name '{ble_name}'")]
    DuplicateBleName {
        ble_name: String,
        first: String,
        second: String,
    },
}

/// The decoders compiled into this binary.
pub fn builtin_factories() -> FactoryTable {
    let mut table: FactoryTable = HashMap::new();
    table.insert("battery", || Box::new(BatteryDecoder::new()));
    table.insert("environmental_sensing", || {
        Box::new(EnvironmentalDecoder::new())
    });
    table.insert("heart_rate", || Box::new(HeartRateDecoder::new()));
    table.insert("ruuvitag", || Box::new(RuuviDecoder::new()));
    table
}

/// One entry of the registration file.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Registration {
    pub ble_name: String,
    pub description: String,
}

/// A registered device type.
#[derive(Clone)]
pub struct ExtensionDescriptor {
    /// Extension id, reported to the gateway as the device `type`
    pub id: String,
    pub ble_advertised_name: String,
    pub description: String,
    factory: DecoderFactory,
}

impl ExtensionDescriptor {
    pub fn new(
        id: impl Into<String>,
        ble_advertised_name: impl Into<String>,
        description: impl Into<String>,
        factory: DecoderFactory,
    ) -> Self {
        Self {
            id: id.into(),
            ble_advertised_name: ble_advertised_name.into(),
            description: description.into(),
            factory,
        }
    }

    pub fn new_decoder(&self) -> Box<dyn Decoder> {
        (self.factory)()
    }
}

impl fmt::Debug for ExtensionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionDescriptor")
            .field("id", &self.id)
            .field("ble_advertised_name", &self.ble_advertised_name)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Registered device types keyed by advertised BLE name. Read-only after load.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    by_ble_name: BTreeMap<String, ExtensionDescriptor>,
}

impl Registry {
    /// Load the registration file at `path`.
    pub fn load(path: &Path, factories: &FactoryTable) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&json, factories)
    }

    pub fn from_json(json: &str, factories: &FactoryTable) -> Result<Self, ConfigError> {
        let registrations: BTreeMap<String, Registration> = serde_json::from_str(json)?;
        Self::from_registrations(registrations, factories)
    }

    pub fn from_registrations(
        registrations: BTreeMap<String, Registration>,
        factories: &FactoryTable,
    ) -> Result<Self, ConfigError> {
        let mut registry = Registry::default();

        for (id, registration) in registrations {
            log::info!("Loading {id} extension...");

            let factory = *factories.get(id.as_str()).ok_or_else(|| {
                let mut known: Vec<_> = factories.keys().copied().collect();
                known.sort_unstable();
                ConfigError::UnknownDecoder(id.clone(), known.join(", "))
            })?;

            if registration.ble_name.trim().is_empty() {
                return Err(ConfigError::EmptyBleName(id));
            }

            if let Some(existing) = registry.by_ble_name.get(&registration.ble_name) {
                return Err(ConfigError::DuplicateBleName {
                    ble_name: registration.ble_name,
                    first: existing.id.clone(),
                    second: id,
                });
            }

            let descriptor = ExtensionDescriptor::new(
                id,
                &registration.ble_name,
                registration.description,
                factory,
            );
            registry.by_ble_name.insert(registration.ble_name, descriptor);
        }

        Ok(registry)
    }

    /// Look up the extension handling devices advertising `ble_name`.
    pub fn by_ble_name(&self, ble_name: &str) -> Option<&ExtensionDescriptor> {
        self.by_ble_name.get(ble_name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ExtensionDescriptor> {
        self.by_ble_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_ble_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ble_name.is_empty()
    }
}
