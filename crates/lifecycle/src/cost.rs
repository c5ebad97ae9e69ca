//! 费用核算，只读取节点时间戳，不产生副作用

use std::sync::Arc;

use kaas_core::{Clock, OrchestratorResult};
use kaas_domain::cost::{build_report, NodeCostReport};
use kaas_domain::{BillingPeriod, NodeRepository};
use tracing::{debug, instrument};

pub struct CostAccountant {
    nodes: Arc<dyn NodeRepository>,
    clock: Arc<dyn Clock>,
}

impl CostAccountant {
    pub fn new(nodes: Arc<dyn NodeRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { nodes, clock }
    }

    /// 工作空间全部节点（含已删除）在计费周期内的费用
    #[instrument(skip(self, period))]
    pub async fn get_node_costs(
        &self,
        workspace_id: &str,
        period: BillingPeriod,
    ) -> OrchestratorResult<NodeCostReport> {
        let nodes = self.nodes.list_by_workspace(workspace_id, true).await?;
        let report = build_report(workspace_id, &nodes, period, self.clock.now());
        debug!(
            "工作空间 {} 费用: {} 个节点, 合计 {:.2} {}",
            workspace_id,
            report.nodes.len(),
            report.total_cost,
            report.currency
        );
        Ok(report)
    }

    pub async fn current_month_costs(
        &self,
        workspace_id: &str,
    ) -> OrchestratorResult<NodeCostReport> {
        let period = BillingPeriod::current_month(self.clock.now());
        self.get_node_costs(workspace_id, period).await
    }
}
