//! Region topology: placing a server on a node inside a region, falling
//! back along `fallback_region_id` when a region is full or has no usable
//! node.

use std::collections::HashSet;

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, instrument, warn};
use warden_id::{NodeId, RegionId};

use crate::db::Database;
use crate::error::{CoreError, CoreResult};
use crate::repos::nodes::NODE_COLUMNS;
use crate::repos::{regions, servers, Node, Region};

/// Where a region placement landed.
#[derive(Debug, Clone, Serialize)]
pub struct Placement {
    pub node: Node,
    pub region_id: RegionId,
    /// Fallback hops taken from the requested region. `0` is the region itself.
    pub hops: usize,
}

/// Regions and nodes a placement must skip because an earlier attempt found
/// them full. Skipped regions still forward to their fallback.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub regions: HashSet<RegionId>,
    pub nodes: HashSet<NodeId>,
}

#[derive(Clone)]
pub struct RegionResolver {
    db: Database,
}

impl RegionResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Pick a node for a new server in `region_id` or, failing that, along
    /// its fallback chain. Regions in `attempted` count as already visited.
    #[instrument(skip(self, attempted))]
    pub async fn resolve_placement(
        &self,
        region_id: RegionId,
        attempted: &HashSet<RegionId>,
    ) -> CoreResult<Placement> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                Self::resolve_in(&mut conn, region_id, attempted, &Exclusions::default()).await
            })
            .await
    }

    /// The region followed by its fallbacks, stopping before any repeat.
    pub async fn fallback_chain(&self, region_id: RegionId) -> CoreResult<Vec<Region>> {
        self.db
            .timed(async {
                let mut conn = self.db.acquire().await?;
                let mut chain: Vec<Region> = Vec::new();
                let mut next = Some(region_id);

                while let Some(current) = next {
                    if chain.iter().any(|region| region.id == current) {
                        break;
                    }
                    let region = regions::find_in(&mut conn, current)
                        .await?
                        .ok_or_else(|| CoreError::not_found("region", current))?;
                    next = region.fallback_region_id;
                    chain.push(region);
                }

                Ok(chain)
            })
            .await
    }

    pub(crate) async fn resolve_in(
        conn: &mut SqliteConnection,
        region_id: RegionId,
        attempted: &HashSet<RegionId>,
        exclusions: &Exclusions,
    ) -> CoreResult<Placement> {
        let mut visited = attempted.clone();
        let mut next = Some(region_id);
        let mut hops = 0;

        while let Some(current) = next {
            if !visited.insert(current) {
                warn!(region_id = %region_id, revisited = %current, "Fallback chain loops");
                break;
            }

            let region = regions::find_in(conn, current)
                .await?
                .ok_or_else(|| CoreError::not_found("region", current))?;

            if !exclusions.regions.contains(&current) && Self::has_room_for(conn, &region).await? {
                if let Some(node) = Self::pick_node_in(conn, current, &exclusions.nodes).await? {
                    debug!(region_id = %current, node_id = %node.id, hops, "Placement resolved");
                    return Ok(Placement {
                        node,
                        region_id: current,
                        hops,
                    });
                }
            }

            debug!(region_id = %current, "Region cannot take a server, trying fallback");
            next = region.fallback_region_id;
            hops += 1;
        }

        Err(CoreError::NoAvailableRegion { region_id })
    }

    /// Whether the region's `server_limit`, if any, leaves room for one more.
    pub(crate) async fn has_room_in(
        conn: &mut SqliteConnection,
        region_id: RegionId,
    ) -> CoreResult<bool> {
        let region = regions::find_in(conn, region_id)
            .await?
            .ok_or_else(|| CoreError::not_found("region", region_id))?;
        Self::has_room_for(conn, &region).await
    }

    async fn has_room_for(conn: &mut SqliteConnection, region: &Region) -> CoreResult<bool> {
        let Some(limit) = region.server_limit else {
            return Ok(true);
        };
        let count = servers::count_in_region_in(conn, region.id).await?;
        Ok(count < limit)
    }

    /// The online, non-maintenance node in the region with the most free
    /// allocations; ties go to the lowest name.
    async fn pick_node_in(
        conn: &mut SqliteConnection,
        region_id: RegionId,
        excluded: &HashSet<NodeId>,
    ) -> CoreResult<Option<Node>> {
        let candidates = sqlx::query_as::<_, Node>(&format!(
            "SELECT {NODE_COLUMNS} FROM nodes
             WHERE region_id = ? AND is_online = 1 AND maintenance = 0
               AND EXISTS (
                   SELECT 1 FROM allocations a
                   WHERE a.node_id = nodes.id AND a.assigned = 0 AND a.server_id IS NULL
               )
             ORDER BY (
                 SELECT COUNT(*) FROM allocations a
                 WHERE a.node_id = nodes.id AND a.assigned = 0 AND a.server_id IS NULL
             ) DESC, name"
        ))
        .bind(region_id)
        .fetch_all(&mut *conn)
        .await?;

        Ok(candidates
            .into_iter()
            .find(|node| !excluded.contains(&node.id)))
    }
}
