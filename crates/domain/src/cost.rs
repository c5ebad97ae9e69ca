//! 节点费用投影，只读、按需计算

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::{hours_between, DedicatedNode};
use crate::value_objects::{BillingPeriod, NodeType};

pub const CURRENCY: &str = "USD";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCost {
    pub node_id: String,
    pub node_name: String,
    pub node_type: NodeType,
    pub hours: f64,
    pub hourly_rate: f64,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCostReport {
    pub workspace_id: String,
    pub period: BillingPeriod,
    pub nodes: Vec<NodeCost>,
    pub total_cost: f64,
    pub currency: String,
}

/// 节点在计费周期内的费用
///
/// 活跃区间为 `[created_at, min(now, 计费截止时间或周期结束))`，再与计费周期求交。
/// 失败且没有虚拟机的节点以最后更新时间为截止。
pub fn node_cost(node: &DedicatedNode, period: &BillingPeriod, now: DateTime<Utc>) -> NodeCost {
    let start = node.created_at.max(period.start());
    let end = node
        .billing_end()
        .unwrap_or(period.end())
        .min(period.end())
        .min(now);

    let hours = hours_between(start, end);
    let hourly_rate = node.node_type().hourly_rate();
    NodeCost {
        node_id: node.id.clone(),
        node_name: node.name.clone(),
        node_type: node.node_type(),
        hours,
        hourly_rate,
        cost: hours * hourly_rate,
    }
}

pub fn build_report(
    workspace_id: &str,
    nodes: &[DedicatedNode],
    period: BillingPeriod,
    now: DateTime<Utc>,
) -> NodeCostReport {
    let nodes: Vec<NodeCost> = nodes
        .iter()
        .map(|node| node_cost(node, &period, now))
        .collect();
    let total_cost = nodes.iter().map(|cost| cost.cost).sum();
    NodeCostReport {
        workspace_id: workspace_id.to_string(),
        period,
        nodes,
        total_cost,
        currency: CURRENCY.to_string(),
    }
}
