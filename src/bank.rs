//! Pattern banks and their persistence.
//!
//! Three banks of four slots, each slot holding a whole pattern document or
//! nothing. Banks persist through a key-value store; a whole set (banks plus
//! the current pattern) travels as one JSON document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BANK_SLOTS;
use crate::error::{EngineError, Result};
use crate::pattern::PatternDocument;

/// Store key the banks are saved under.
pub const BANKS_KEY: &str = "loopbrushBanks";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BankId {
    A,
    B,
    C,
}

impl BankId {
    pub const ALL: [BankId; 3] = [BankId::A, BankId::B, BankId::C];

    pub fn name(self) -> &'static str {
        match self {
            BankId::A => "A",
            BankId::B => "B",
            BankId::C => "C",
        }
    }

    pub fn from_name(name: &str) -> Option<BankId> {
        BankId::ALL
            .into_iter()
            .find(|b| b.name().eq_ignore_ascii_case(name.trim()))
    }
}

type Slots = Vec<Option<PatternDocument>>;

fn empty_bank() -> Slots {
    vec![None; BANK_SLOTS]
}

/// Accepts short or long slot arrays and normalizes them to the slot count.
fn bank_slots<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Slots, D::Error> {
    let mut slots = Option::<Slots>::deserialize(deserializer)?.unwrap_or_default();
    slots.resize(BANK_SLOTS, None);
    Ok(slots)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternBanks {
    #[serde(rename = "A", default = "empty_bank", deserialize_with = "bank_slots")]
    a: Slots,
    #[serde(rename = "B", default = "empty_bank", deserialize_with = "bank_slots")]
    b: Slots,
    #[serde(rename = "C", default = "empty_bank", deserialize_with = "bank_slots")]
    c: Slots,
}

impl Default for PatternBanks {
    fn default() -> Self {
        PatternBanks {
            a: empty_bank(),
            b: empty_bank(),
            c: empty_bank(),
        }
    }
}

impl PatternBanks {
    pub fn new() -> Self {
        Self::default()
    }

    fn bank(&self, bank: BankId) -> &Slots {
        match bank {
            BankId::A => &self.a,
            BankId::B => &self.b,
            BankId::C => &self.c,
        }
    }

    fn bank_mut(&mut self, bank: BankId) -> &mut Slots {
        match bank {
            BankId::A => &mut self.a,
            BankId::B => &mut self.b,
            BankId::C => &mut self.c,
        }
    }

    fn check(bank: BankId, slot: usize) -> Result<()> {
        if slot < BANK_SLOTS {
            Ok(())
        } else {
            Err(EngineError::SlotOutOfRange {
                bank: bank.name().to_string(),
                slot,
            })
        }
    }

    /// The document in a slot, `None` when the slot is empty.
    pub fn get(&self, bank: BankId, slot: usize) -> Result<Option<&PatternDocument>> {
        Self::check(bank, slot)?;
        Ok(self.bank(bank)[slot].as_ref())
    }

    pub fn store(&mut self, bank: BankId, slot: usize, document: PatternDocument) -> Result<()> {
        Self::check(bank, slot)?;
        self.bank_mut(bank)[slot] = Some(document);
        Ok(())
    }

    /// Every filled slot, bank by bank.
    pub fn occupied(&self) -> Vec<(BankId, usize)> {
        BankId::ALL
            .into_iter()
            .flat_map(|bank| {
                self.bank(bank)
                    .iter()
                    .enumerate()
                    .filter(|(_, doc)| doc.is_some())
                    .map(move |(slot, _)| (bank, slot))
            })
            .collect()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Banks saved in `store`, or empty banks when nothing usable is there.
    pub fn load(store: &dyn KeyValueStore) -> Self {
        match store.get(BANKS_KEY) {
            Ok(Some(json)) => Self::from_json(&json).unwrap_or_else(|e| {
                warn!("ignoring malformed pattern banks: {e}");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                warn!("could not read pattern banks: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self, store: &mut dyn KeyValueStore) -> Result<()> {
        store.set(BANKS_KEY, &self.to_json()?)?;
        debug!(filled = self.occupied().len(), "pattern banks saved");
        Ok(())
    }
}

// ── Whole-set documents ─────────────────────────────────────

/// A full set: the current pattern plus every bank.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SetDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current: Option<PatternDocument>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banks: Option<PatternBanks>,
}

impl SetDocument {
    /// Parse a set. A document with neither `current` nor `banks` is read as
    /// a bare pattern document.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut value: Value = serde_json::from_str(json)?;
        let Some(object) = value.as_object_mut() else {
            return Ok(SetDocument {
                current: Some(PatternDocument::from_value(value)?),
                banks: None,
            });
        };
        let current = object.remove("current");
        let banks = object.remove("banks");
        if current.is_none() && banks.is_none() {
            return Ok(SetDocument {
                current: Some(PatternDocument::from_value(value)?),
                banks: None,
            });
        }
        Ok(SetDocument {
            current: current
                .filter(|v| !v.is_null())
                .map(PatternDocument::from_value)
                .transpose()?,
            banks: banks
                .filter(|v| !v.is_null())
                .map(serde_json::from_value)
                .transpose()?,
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

// ── Stores ──────────────────────────────────────────────────

/// String key-value persistence, the way a browser's local storage works.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn set(&mut self, key: &str, value: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    entries: BTreeMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Every key in one JSON object on disk, rewritten on each `set`.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(data) => Ok(serde_json::from_str(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all()?.remove(key))
    }

    fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.read_all()?;
        entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&entries)?)?;
        Ok(())
    }
}
