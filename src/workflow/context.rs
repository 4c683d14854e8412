//! Execution context shared by every step task of a run

use crate::expression::Scope;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SlotError {
    #[error("no context slot for step '{0}'")]
    Unknown(String),

    #[error("context slot for step '{0}' was already written")]
    AlreadyWritten(String),
}

/// Inputs, defaults and one write-once slot per step
///
/// Slots are created up front for every step id. Each slot is written by
/// the task that owns its step and is read-only afterwards, so readers
/// never take a lock.
#[derive(Debug)]
pub struct ExecutionContext {
    inputs: Value,
    defaults: Value,
    slots: HashMap<String, OnceLock<Value>>,
}

impl ExecutionContext {
    pub fn new<'a>(
        inputs: Map<String, Value>,
        defaults: Map<String, Value>,
        step_ids: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            inputs: Value::Object(inputs),
            defaults: Value::Object(defaults),
            slots: step_ids
                .into_iter()
                .map(|id| (id.to_string(), OnceLock::new()))
                .collect(),
        }
    }

    /// Write a step's record; fails if the slot is unknown or already set
    pub fn record(&self, step_id: &str, entry: Value) -> Result<(), SlotError> {
        let slot = self
            .slots
            .get(step_id)
            .ok_or_else(|| SlotError::Unknown(step_id.to_string()))?;
        slot.set(entry)
            .map_err(|_| SlotError::AlreadyWritten(step_id.to_string()))
    }

    /// A step's record, if it has finished
    pub fn entry(&self, step_id: &str) -> Option<&Value> {
        self.slots.get(step_id).and_then(OnceLock::get)
    }
}

impl Scope for ExecutionContext {
    fn lookup(&self, name: &str) -> Option<&Value> {
        match name {
            "inputs" => Some(&self.inputs),
            "defaults" => Some(&self.defaults),
            _ => self.entry(name),
        }
    }
}
