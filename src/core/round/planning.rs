use std::collections::HashMap;

use tracing::debug;

use crate::core::directive::{parse_calls, PlannedCall};
use crate::mcp::catalog::{ServerResolution, ToolCatalog};

/// One distinct call to execute, plus how many identical proposals it
/// stands for. Each proposal still gets its own tag.
#[derive(Debug, Clone, PartialEq)]
pub struct CallGroup {
    pub signature: String,
    pub call: PlannedCall,
    pub proposals: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RejectedCall {
    pub call: PlannedCall,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoundPlan {
    pub groups: Vec<CallGroup>,
    pub rejected: Vec<RejectedCall>,
    /// Distinct calls beyond the per-round budget.
    pub dropped: usize,
}

impl RoundPlan {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty() && self.rejected.is_empty()
    }
}

/// Parses every directive block of a round into an execution plan.
///
/// `unterminated` is only parsed when no complete block was seen. Server ids
/// are resolved against the catalog before calls are coalesced, so a blank
/// id and the explicit id of the same server share a signature.
pub fn plan_round(
    blocks: &[String],
    unterminated: Option<&str>,
    catalog: &ToolCatalog,
    max_calls: usize,
) -> RoundPlan {
    let mut proposed: Vec<PlannedCall> = blocks.iter().flat_map(|block| parse_calls(block)).collect();
    if blocks.is_empty() {
        if let Some(raw) = unterminated {
            proposed = parse_calls(raw);
        }
    }

    let mut plan = RoundPlan::default();
    let mut index_by_signature: HashMap<String, usize> = HashMap::new();
    for mut call in proposed {
        match catalog.resolve(&call.server_id, &call.tool_name) {
            ServerResolution::Resolved(server_id) => call.server_id = server_id,
            ServerResolution::Unknown => {
                let reason = format!("No enabled tool server offers {}", call.tool_name);
                plan.rejected.push(RejectedCall { call, reason });
                continue;
            }
            ServerResolution::Ambiguous(ids) => {
                let reason = format!(
                    "{} is offered by several servers ({}); name one with serverId",
                    call.tool_name,
                    ids.join(", ")
                );
                plan.rejected.push(RejectedCall { call, reason });
                continue;
            }
        }

        let signature = call.signature();
        if let Some(&index) = index_by_signature.get(&signature) {
            plan.groups[index].proposals += 1;
            continue;
        }
        if plan.groups.len() >= max_calls {
            plan.dropped += 1;
            debug!(signature = %signature, "Dropping call over the per-round budget");
            continue;
        }
        index_by_signature.insert(signature.clone(), plan.groups.len());
        plan.groups.push(CallGroup {
            signature,
            call,
            proposals: 1,
        });
    }
    plan
}
