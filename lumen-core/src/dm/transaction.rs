//! The per-object transaction discipline for mutating server operations.

use super::RegisteredObject;
use super::object::{DmError, TxResult};
use crate::flat_map::FlatMap;
use tracing::debug;

/// Tracks which objects had `transaction_begin` run during one server
/// operation. Objects join on their first mutating call; at the end every
/// joined object gets `validate` (while prior validations succeed) and
/// then `transaction_end` with the overall result.
#[derive(Debug, Default)]
pub(crate) struct TxScope {
    begun: Vec<u16>,
}

impl TxScope {
    pub fn new() -> TxScope {
        TxScope::default()
    }

    /// Runs `transaction_begin` on first touch of `oid`.
    pub fn touch(&mut self, oid: u16, objects: &mut FlatMap<u16, RegisteredObject>) {
        if self.begun.contains(&oid) {
            return;
        }
        if let Some(object) = objects.get_mut(&oid) {
            object.handler.transaction_begin();
            self.begun.push(oid);
        }
    }

    /// Validate-then-end over every begun object.
    ///
    /// `operation_result` is the outcome of the mutating calls themselves;
    /// validation runs only when they all succeeded, and stops at the
    /// first failure. `transaction_end` always runs on every begun object.
    pub fn close(
        self,
        operation_result: Result<(), DmError>,
        objects: &mut FlatMap<u16, RegisteredObject>,
    ) -> Result<(), DmError> {
        let mut verdict = operation_result;
        if verdict.is_ok() {
            for oid in &self.begun {
                if let Some(object) = objects.get_mut(oid) {
                    verdict = object.handler.transaction_validate();
                    if verdict.is_err() {
                        break;
                    }
                }
            }
        }
        let result = if verdict.is_ok() {
            TxResult::Success
        } else {
            TxResult::Failure
        };
        if result == TxResult::Failure && !self.begun.is_empty() {
            debug!(objects = ?self.begun, "rolling back transaction");
        }
        for oid in &self.begun {
            if let Some(object) = objects.get_mut(oid) {
                object.handler.transaction_end(result);
            }
        }
        verdict
    }
}
