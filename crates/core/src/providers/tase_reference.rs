use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::errors::CoreError;
use crate::models::asset::InstrumentType;

/// One row of the local TASE reference dataset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaseSecurity {
    pub security_number: String,
    /// Official Yahoo-compatible symbol (`POLI.TA`, `TA35.TA`).
    pub yahoo_symbol: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub instrument_type: InstrumentType,
}

/// Built-in rows: (security number, Yahoo symbol, name, type).
const BUILTIN: &[(&str, &str, &str, InstrumentType)] = &[
    ("662577", "POLI.TA", "Bank Hapoalim", InstrumentType::Equity),
    ("604611", "LUMI.TA", "Bank Leumi", InstrumentType::Equity),
    ("629014", "TEVA.TA", "Teva Pharmaceutical", InstrumentType::Equity),
    ("1081124", "ESLT.TA", "Elbit Systems", InstrumentType::Equity),
    ("1183441", "1183441.TA", "", InstrumentType::Etf),
    ("142", "TA35.TA", "TA-35", InstrumentType::Index),
    ("137", "^TA125.TA", "TA-125", InstrumentType::Index),
];

/// Security number → official symbol lookup, entirely in memory.
///
/// The first TASE waterfall stage: when a security is listed here the
/// engine can ask Yahoo for it by its official symbol without any scraping.
#[derive(Debug, Clone, Default)]
pub struct TaseReference {
    by_number: HashMap<String, TaseSecurity>,
}

impl TaseReference {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::from_entries(BUILTIN.iter().map(|&(number, symbol, name, kind)| TaseSecurity {
            security_number: number.to_string(),
            yahoo_symbol: symbol.to_string(),
            name: (!name.is_empty()).then(|| name.to_string()),
            instrument_type: kind,
        }))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = TaseSecurity>) -> Self {
        let mut reference = Self::empty();
        reference.extend(entries);
        reference
    }

    /// Built-in table plus the rows of an optional JSON file (later rows win).
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        let mut reference = Self::builtin();
        if let Some(path) = path {
            let raw = std::fs::read_to_string(path).map_err(|e| {
                CoreError::Config(format!("cannot read TASE reference {}: {e}", path.display()))
            })?;
            let rows: Vec<TaseSecurity> = serde_json::from_str(&raw).map_err(|e| {
                CoreError::Config(format!("invalid TASE reference {}: {e}", path.display()))
            })?;
            reference.extend(rows);
        }
        Ok(reference)
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = TaseSecurity>) {
        for entry in entries {
            self.by_number
                .insert(entry.security_number.trim().to_string(), entry);
        }
    }

    pub fn lookup(&self, security_number: &str) -> Option<&TaseSecurity> {
        self.by_number.get(security_number.trim())
    }

    pub fn len(&self) -> usize {
        self.by_number.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_number.is_empty()
    }
}
