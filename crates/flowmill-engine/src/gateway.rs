use tracing::warn;

use flowmill_core::definition::Edge;
use flowmill_core::error::{FlowError, Result};
use flowmill_core::types::Variables;

use crate::expr::eval_condition;

/// Branch-selection discipline of a gateway node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayKind {
    Exclusive,
    Parallel,
    Inclusive,
}

impl GatewayKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exclusive => "exclusive",
            Self::Parallel => "parallel",
            Self::Inclusive => "inclusive",
        }
    }
}

/// Edges chosen by a gateway plus any evaluation warnings.
#[derive(Debug)]
pub struct Selection<'a> {
    pub edges: Vec<&'a Edge>,
    pub warnings: Vec<String>,
}

/// Decide which outgoing edges of a gateway fire.
///
/// Edges are considered in definition order. A missing condition counts as
/// true. A condition that fails to parse or evaluate counts as false and adds
/// a warning. An exclusive or inclusive gateway with nothing to fire is an
/// error, never a silent stop.
pub fn select<'a>(
    kind: GatewayKind,
    node_id: &str,
    edges: &[&'a Edge],
    vars: &Variables,
) -> Result<Selection<'a>> {
    let mut warnings = Vec::new();

    if edges.is_empty() {
        return Err(FlowError::EngineFault(format!(
            "{} gateway '{}' has no outgoing edges",
            kind.as_str(),
            node_id
        )));
    }

    let chosen: Vec<&'a Edge> = match kind {
        GatewayKind::Parallel => edges.to_vec(),
        GatewayKind::Exclusive => edges
            .iter()
            .copied()
            .find(|e| fires(e, vars, &mut warnings))
            .into_iter()
            .collect(),
        GatewayKind::Inclusive => edges
            .iter()
            .copied()
            .filter(|e| fires(e, vars, &mut warnings))
            .collect(),
    };

    if chosen.is_empty() {
        let mut message = format!(
            "{} gateway '{}': no outgoing condition matched",
            kind.as_str(),
            node_id
        );
        if !warnings.is_empty() {
            message.push_str(&format!(" ({})", warnings.join("; ")));
        }
        return Err(FlowError::EngineFault(message));
    }

    Ok(Selection {
        edges: chosen,
        warnings,
    })
}

fn fires(edge: &Edge, vars: &Variables, warnings: &mut Vec<String>) -> bool {
    let Some(condition) = edge.guard() else {
        return true;
    };
    match eval_condition(condition, vars) {
        Ok(result) => result,
        Err(e) => {
            let message = format!(
                "edge {}: condition `{}` treated as false: {}",
                edge.display_id(),
                condition,
                e
            );
            warn!(edge = %edge.display_id(), error = %e, "Condition evaluation failed");
            warnings.push(message);
            false
        }
    }
}
