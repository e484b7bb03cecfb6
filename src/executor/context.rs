//! Execution-thread state of a run.
//!
//! Nothing in here is shared: the context is created when a run starts, owned by the
//! execution thread and dropped with it. The cross-thread flags live in the control surface.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::warn;

use super::error::ExecError;
use super::timing::EtaEstimator;
use crate::config::{Action, match_data_loops, sort_by_order};
use crate::sources::Row;
use crate::utils::interpolation::{Bindings, interpolate_json, value_to_text};

/// An action list ready to run: sorted by `order_index`, loop markers paired.
#[derive(Debug, Clone)]
pub(crate) struct Block {
    pub actions: Vec<Action>,
    /// `data_loop_start` position -> matching `data_loop_end` position.
    pub loops: BTreeMap<usize, usize>,
}

impl Block {
    pub fn new(actions: &[Action]) -> Result<Self, String> {
        let actions = sort_by_order(actions);
        let loops = match_data_loops(&actions)?;
        Ok(Self { actions, loops })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }
}

/// One active data loop.
#[derive(Debug, Clone)]
pub struct LoopFrame {
    pub rows: Vec<Row>,
    /// Row currently bound to placeholders.
    pub cursor: usize,
}

impl LoopFrame {
    pub fn current_row(&self) -> Option<&Row> {
        self.rows.get(self.cursor)
    }
}

#[derive(Debug)]
pub struct ExecutionContext {
    pub current_index: usize,
    pub total_actions: usize,
    pub start_time: Instant,
    /// Wall-clock duration of every dispatch, in order.
    pub timing: EtaEstimator,
    /// Innermost loop last.
    pub loop_stack: Vec<LoopFrame>,
    /// Outcome of the most recent dispatched action, read by conditionals.
    pub last_success: bool,
    pub dispatched: usize,
    pub failed: usize,
}

impl ExecutionContext {
    pub fn new(total_actions: usize) -> Self {
        Self {
            current_index: 0,
            total_actions,
            start_time: Instant::now(),
            timing: EtaEstimator::new(),
            loop_stack: Vec::new(),
            last_success: true,
            dispatched: 0,
            failed: 0,
        }
    }

    pub fn in_loop(&self) -> bool {
        !self.loop_stack.is_empty()
    }

    pub fn record(&mut self, duration: Duration) {
        self.timing.record(duration);
    }

    /// Columns of the current row of every active loop. Inner loops shadow outer ones.
    pub fn bindings(&self) -> Bindings {
        let mut vars = Bindings::new();
        for frame in &self.loop_stack {
            if let Some(row) = frame.current_row() {
                for (column, cell) in row {
                    vars.insert(column.clone(), value_to_text(cell));
                }
            }
        }
        vars
    }

    /// Substitute `{{column}}` tokens in every string inside `value`.
    ///
    /// Unknown columns are left as literal text and logged.
    pub fn resolve<T>(&self, value: &T) -> Result<T, ExecError>
    where
        T: Serialize + DeserializeOwned,
    {
        let raw = serde_json::to_value(value)
            .map_err(|e| ExecError::Validation(format!("cannot prepare parameters: {e}")))?;
        let mut unresolved = Vec::new();
        let resolved = interpolate_json(&raw, &self.bindings(), &mut unresolved);
        if !unresolved.is_empty() {
            warn!(
                target: "macroflow::engine",
                placeholders = ?unresolved,
                "Unresolved placeholders left as literal text"
            );
        }
        serde_json::from_value(resolved)
            .map_err(|e| ExecError::Validation(format!("parameters invalid after substitution: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionKind, DelayParams, TypeParams};
    use serde_json::json;

    fn frame(rows: Vec<Row>) -> LoopFrame {
        LoopFrame {
            rows,
            cursor: 0,
        }
    }

    fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_inner_loop_shadows_outer() {
        let mut ctx = ExecutionContext::new(3);
        ctx.loop_stack.push(frame(vec![row(&[("name", json!("outer")), ("id", json!(7))])]));
        ctx.loop_stack.push(frame(vec![row(&[("name", json!("inner"))])]));
        let vars = ctx.bindings();
        assert_eq!(vars["name"], "inner");
        assert_eq!(vars["id"], "7");
    }

    #[test]
    fn test_resolve_substitutes_strings_only() {
        let mut ctx = ExecutionContext::new(1);
        ctx.loop_stack.push(frame(vec![row(&[("user", json!("kim"))])]));
        let kind = ActionKind::KeyboardType(TypeParams {
            text: "id={{user}} pw={{missing}}".into(),
            interval: 0.0,
        });
        match ctx.resolve(&kind).unwrap() {
            ActionKind::KeyboardType(p) => assert_eq!(p.text, "id=kim pw={{missing}}"),
            other => panic!("unexpected kind {other:?}"),
        }

        let delay = ActionKind::Delay(DelayParams {
            seconds: 0.5,
            max_seconds: None,
        });
        assert_eq!(ctx.resolve(&delay).unwrap(), delay);
    }

    #[test]
    fn test_block_sorts_and_pairs_loops() {
        let a = |id: u64, order: u32| {
            Action::new(
                id,
                order,
                ActionKind::Delay(DelayParams {
                    seconds: 0.0,
                    max_seconds: None,
                }),
            )
        };
        let block = Block::new(&[a(2, 2), a(1, 1)]).unwrap();
        assert_eq!(block.actions[0].id, 1);
        assert!(block.loops.is_empty());
        assert_eq!(block.len(), 2);
    }
}
