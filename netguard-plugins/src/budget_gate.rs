//! Budget enforcement gate. Reads the same `MonotonicUsd` total the
//! usage logger writes — a plain shared `Arc`, not a `CostProvider`
//! trait object; see `DESIGN.md` for why that's a deliberate
//! simplification.

use netguard_core::types::{GateVerdict, MonotonicUsd};
use netguard_plugin::plugin::{GatePlugin, PluginContext};
use std::sync::Arc;

pub struct BudgetGate {
    total: Arc<MonotonicUsd>,
    limit_usd: f64,
}

impl BudgetGate {
    pub fn new(total: Arc<MonotonicUsd>, limit_usd: f64) -> Self {
        Self { total, limit_usd }
    }
}

impl GatePlugin for BudgetGate {
    fn name(&self) -> &str {
        "budget-gate"
    }

    fn gate(&self, _host: &str, _ctx: &mut PluginContext) -> GateVerdict {
        let spent = self.total.get();
        if spent >= self.limit_usd {
            return GateVerdict::deny_with(
                429,
                "application/json",
                format!(
                    r#"{{"error":{{"message":"Budget limit exceeded. Spent ${spent:.2} of ${limit:.2} limit.","type":"budget_exceeded","code":429}}}}"#,
                    spent = spent,
                    limit = self.limit_usd,
                ),
                format!("spent {spent} >= limit {}", self.limit_usd),
            );
        }
        GateVerdict::allow(format!("spent {spent} below limit {}", self.limit_usd))
    }
}
