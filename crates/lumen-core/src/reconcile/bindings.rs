//! In-memory store of the slots currently shown for each source.
//!
//! The canvas owns this data in a real deployment; the store mirrors what it
//! would persist so headless runs and tests can chain reconciliations.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

use super::{Reconciliation, Slot, sort_slots};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BindingStore {
    sources: BTreeMap<String, Vec<Slot>>,
    /// Counter for naming freshly allocated slots.
    next_slot: u64,
}

impl BindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slots shown for `source_id`, in display order.
    pub fn prior_slots(&self, source_id: &str) -> Vec<Slot> {
        let mut slots = self.sources.get(source_id).cloned().unwrap_or_default();
        sort_slots(&mut slots);
        slots
    }

    /// Replace the binding of `source_id` with the outcome of a run.
    ///
    /// New slots are named `"{source_id}#{n}"`; the named slots are returned
    /// in assignment order.
    pub fn apply(&mut self, source_id: &str, reconciliation: &Reconciliation) -> Vec<Slot> {
        let slots: Vec<Slot> = reconciliation
            .assignments
            .iter()
            .map(|assignment| {
                let mut slot = assignment.slot.clone();
                if slot.id.is_none() {
                    self.next_slot += 1;
                    slot.id = Some(format!("{}#{}", source_id, self.next_slot));
                }
                slot
            })
            .collect();

        self.sources.insert(source_id.to_string(), slots.clone());
        slots
    }

    /// Forget a source entirely.
    pub fn remove(&mut self, source_id: &str) -> Option<Vec<Slot>> {
        self.sources.remove(source_id)
    }

    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Json(format!("invalid layout file {}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}
