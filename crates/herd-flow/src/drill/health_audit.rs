//! Health metric audit: join the `*_up` gauge with the expected node set.
//!
//! For each cluster, the time-series backend is queried for the family's
//! `*_up` gauge and joined with the member list from inventory. Every
//! expected node gets exactly one row.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use herd_core::{BizId, ClusterId};

use crate::error::Result;
use crate::external::{
    ClusterType, InstanceRole, InventoryRepository, SeriesQuery, TimeSeriesBackend,
};

/// Per-node audit verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    /// Gauge present with value 1 and a matching role label.
    Ok,
    /// No series for the node.
    MetricNotFound,
    /// Gauge present but its latest value is not 1.
    ValueNot1,
    /// Gauge present but the `instance_role` label disagrees with inventory.
    BadInstanceRoleLabel,
}

/// One audit row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRow {
    /// The cluster.
    pub cluster_id: ClusterId,
    /// Node host.
    pub host: String,
    /// Node port.
    pub port: u16,
    /// Verdict.
    pub health: NodeHealth,
}

const fn metric_for(cluster_type: ClusterType) -> &'static str {
    match cluster_type {
        ClusterType::TendbHa | ClusterType::TendbCluster => "mysql_up",
        ClusterType::RedisCluster => "redis_up",
        ClusterType::MongoCluster => "mongodb_up",
    }
}

const fn role_label(role: InstanceRole) -> &'static str {
    match role {
        InstanceRole::Proxy => "proxy",
        InstanceRole::Storage => "storage",
        InstanceRole::Mongos => "mongos",
        InstanceRole::MongoStorage => "mongo_storage",
    }
}

/// Audits every cluster of a business, one row per expected node.
///
/// # Errors
///
/// Returns an error if the inventory or time-series backend fails.
#[tracing::instrument(skip(inventory, tsdb), fields(biz_id = %biz_id))]
pub async fn audit_health(
    inventory: &dyn InventoryRepository,
    tsdb: &dyn TimeSeriesBackend,
    biz_id: BizId,
    window: Duration,
    now: DateTime<Utc>,
) -> Result<Vec<HealthRow>> {
    let mut rows = Vec::new();

    for cluster in inventory.clusters_by_biz(biz_id).await? {
        let mut filters = std::collections::BTreeMap::new();
        filters.insert("cluster_domain".to_owned(), cluster.domain.clone());

        let result = tsdb
            .unify_query(SeriesQuery {
                metric: metric_for(cluster.cluster_type).to_owned(),
                filters,
                start: now - window,
                end: now,
            })
            .await?;

        for member in &cluster.members {
            let instance = format!("{}:{}", member.host, member.port);
            let series = result
                .series
                .iter()
                .find(|s| s.dimensions.get("instance") == Some(&instance));

            let health = match series {
                None => NodeHealth::MetricNotFound,
                Some(series) => {
                    let up = series
                        .latest()
                        .is_some_and(|v| (v - 1.0).abs() < f64::EPSILON);
                    if !up {
                        NodeHealth::ValueNot1
                    } else if series
                        .dimensions
                        .get("instance_role")
                        .is_some_and(|r| r != role_label(member.role))
                    {
                        NodeHealth::BadInstanceRoleLabel
                    } else {
                        NodeHealth::Ok
                    }
                }
            };

            rows.push(HealthRow {
                cluster_id: cluster.id,
                host: member.host.clone(),
                port: member.port,
                health,
            });
        }
    }

    Ok(rows)
}
