//! Register catalog
//!
//! The meter exposes one quantity per 16-bit register. Which registers get
//! polled, in which order, and under which labels is configuration; the two
//! presets cover the common single-direction and import/export installations.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 16-bit register identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterId(pub u16);

impl RegisterId {
    /// Big-endian wire representation
    pub fn to_be_bytes(self) -> [u8; 2] {
        self.0.to_be_bytes()
    }

    /// Build from the two big-endian bytes echoed by the meter
    pub fn from_be_bytes(bytes: [u8; 2]) -> Self {
        Self(u16::from_be_bytes(bytes))
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

impl From<u16> for RegisterId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl FromStr for RegisterId {
    type Err = std::num::ParseIntError;

    /// Accepts `0x041e` style hex or plain decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let value = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16)?,
            None => s.parse()?,
        };
        Ok(Self(value))
    }
}

/// Unit code reported by the meter in every response
///
/// Only used for diagnostics; the value itself is never rescaled by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitCode(pub u8);

impl UnitCode {
    /// Human-readable unit, when known
    pub fn name(self) -> Option<&'static str> {
        match self.0 {
            1 => Some("Wh"),
            2 => Some("kWh"),
            3 => Some("MWh"),
            4 => Some("GWh"),
            13 => Some("m3"),
            19 => Some("h"),
            33 => Some("s"),
            34 => Some("ms"),
            _ => None,
        }
    }
}

impl fmt::Display for UnitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unit#{}", self.0),
        }
    }
}

/// One configured register
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterDescriptor {
    /// Register number
    pub id: RegisterId,
    /// Label used when publishing
    pub label: String,
    /// Unit hint for sinks (e.g. "kWh", "W", "V")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl RegisterDescriptor {
    /// Create a descriptor
    pub fn new(id: u16, label: &str, unit: Option<&str>) -> Self {
        Self {
            id: RegisterId(id),
            label: label.to_string(),
            unit: unit.map(String::from),
        }
    }
}

/// Built-in catalogs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogPreset {
    /// Import-only installation (13 registers)
    #[default]
    Single,
    /// Import and export (16 registers)
    ///
    /// Adds export energy, high resolution export energy and total export
    /// power. Per-phase export power registers differ between meter firmware
    /// versions and are not part of the preset; list them explicitly under
    /// `[[registers.list]]` to poll the 19-register set.
    Bidirectional,
}

impl CatalogPreset {
    /// Get all presets
    pub fn all() -> &'static [CatalogPreset] {
        &[CatalogPreset::Single, CatalogPreset::Bidirectional]
    }

    /// Preset name as used in the config file
    pub fn name(&self) -> &'static str {
        match self {
            CatalogPreset::Single => "single",
            CatalogPreset::Bidirectional => "bidirectional",
        }
    }

    /// Registers in polling order
    pub fn descriptors(&self) -> Vec<RegisterDescriptor> {
        let mut regs = vec![
            RegisterDescriptor::new(0x0001, "EnergyIn", Some("kWh")),
            RegisterDescriptor::new(0x000d, "EnergyInHiRes", Some("kWh")),
            RegisterDescriptor::new(0x03ff, "CurrentPower", Some("kW")),
            RegisterDescriptor::new(0x0438, "PowerP1In", Some("kW")),
            RegisterDescriptor::new(0x0439, "PowerP2In", Some("kW")),
            RegisterDescriptor::new(0x043a, "PowerP3In", Some("kW")),
            RegisterDescriptor::new(0x0434, "CurrentP1", Some("A")),
            RegisterDescriptor::new(0x0435, "CurrentP2", Some("A")),
            RegisterDescriptor::new(0x0436, "CurrentP3", Some("A")),
            RegisterDescriptor::new(0x0027, "MaxPower", Some("kW")),
            RegisterDescriptor::new(0x041e, "VoltageP1", Some("V")),
            RegisterDescriptor::new(0x041f, "VoltageP2", Some("V")),
            RegisterDescriptor::new(0x0420, "VoltageP3", Some("V")),
        ];

        if *self == CatalogPreset::Bidirectional {
            regs.extend([
                RegisterDescriptor::new(0x0002, "EnergyOut", Some("kWh")),
                RegisterDescriptor::new(0x000e, "EnergyOutHiRes", Some("kWh")),
                RegisterDescriptor::new(0x0400, "CurrentPowerOut", Some("kW")),
            ]);
        }

        regs
    }
}

impl FromStr for CatalogPreset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "bidirectional" | "bidir" => Ok(Self::Bidirectional),
            other => {
                let known: Vec<&str> = Self::all().iter().map(CatalogPreset::name).collect();
                Err(format!(
                    "unknown register preset: {other} (expected {})",
                    known.join(", ")
                ))
            }
        }
    }
}

/// Catalog construction errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    /// No registers configured
    #[error("Register catalog is empty")]
    Empty,
    /// Same register listed twice
    #[error("Register {0} is listed more than once")]
    Duplicate(RegisterId),
}

/// Immutable ordered list of registers, index `0..len()`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterCatalog {
    entries: Vec<RegisterDescriptor>,
}

impl RegisterCatalog {
    /// Build a catalog, rejecting empty lists and duplicate ids
    pub fn new(entries: Vec<RegisterDescriptor>) -> Result<Self, CatalogError> {
        if entries.is_empty() {
            return Err(CatalogError::Empty);
        }
        for (i, entry) in entries.iter().enumerate() {
            if entries[..i].iter().any(|e| e.id == entry.id) {
                return Err(CatalogError::Duplicate(entry.id));
            }
        }
        Ok(Self { entries })
    }

    /// Catalog for a built-in preset
    pub fn preset(preset: CatalogPreset) -> Self {
        Self {
            entries: preset.descriptors(),
        }
    }

    /// Number of registers (N)
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Always false for a constructed catalog
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptor at `index`
    pub fn get(&self, index: usize) -> Option<&RegisterDescriptor> {
        self.entries.get(index)
    }

    /// Index of a register id
    pub fn index_of(&self, id: RegisterId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    /// Iterate in polling order
    pub fn iter(&self) -> impl Iterator<Item = &RegisterDescriptor> {
        self.entries.iter()
    }

    /// All descriptors
    pub fn entries(&self) -> &[RegisterDescriptor] {
        &self.entries
    }
}

impl Default for RegisterCatalog {
    fn default() -> Self {
        Self::preset(CatalogPreset::Single)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preset_sizes() {
        assert_eq!(RegisterCatalog::preset(CatalogPreset::Single).len(), 13);
        assert_eq!(RegisterCatalog::preset(CatalogPreset::Bidirectional).len(), 16);
    }

    #[test]
    fn test_bidirectional_extends_single_in_order() {
        let single = CatalogPreset::Single.descriptors();
        let bidir = CatalogPreset::Bidirectional.descriptors();
        assert_eq!(&bidir[..single.len()], single.as_slice());
        let export: Vec<RegisterId> = bidir[single.len()..].iter().map(|d| d.id).collect();
        assert_eq!(export, [RegisterId(0x0002), RegisterId(0x000e), RegisterId(0x0400)]);
    }

    #[test]
    fn test_presets_have_unique_ids() {
        for preset in CatalogPreset::all() {
            assert!(RegisterCatalog::new(preset.descriptors()).is_ok());
        }
    }

    #[test]
    fn test_rejects_duplicates_and_empty() {
        assert_eq!(RegisterCatalog::new(Vec::new()), Err(CatalogError::Empty));

        let dup = vec![
            RegisterDescriptor::new(0x0001, "A", None),
            RegisterDescriptor::new(0x0001, "B", None),
        ];
        assert_eq!(
            RegisterCatalog::new(dup),
            Err(CatalogError::Duplicate(RegisterId(0x0001)))
        );
    }

    #[test]
    fn test_parse_preset() {
        assert_eq!("bidir".parse::<CatalogPreset>(), Ok(CatalogPreset::Bidirectional));
        let err = "triple".parse::<CatalogPreset>().unwrap_err();
        assert!(err.ends_with("(expected single, bidirectional)"), "{err}");
    }

    #[test]
    fn test_parse_register_id() {
        assert_eq!("0x041e".parse::<RegisterId>().unwrap(), RegisterId(0x041e));
        assert_eq!("1023".parse::<RegisterId>().unwrap(), RegisterId(0x03ff));
        assert!("0xzz".parse::<RegisterId>().is_err());
        assert_eq!(RegisterId(0x41e).to_string(), "0x041e");
    }

    #[test]
    fn test_index_of() {
        let catalog = RegisterCatalog::default();
        assert_eq!(catalog.index_of(RegisterId(0x0001)), Some(0));
        assert_eq!(catalog.index_of(RegisterId(0x0420)), Some(12));
        assert_eq!(catalog.index_of(RegisterId(0x9999)), None);
    }
}
