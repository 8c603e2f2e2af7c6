use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::docker::docker_gateway::{self, ContainerRuntime};
use crate::error::IdeError;
use crate::models::container_models::{ListRow, SessionRow, SortKey, UsageRow};
use crate::models::session_models::SessionIdentity;

/// Builds the administrative container listing by joining two independent
/// runtime snapshots. Which snapshot is fetched, sorted and sliced first
/// depends on the sort key: identity fields come cheap from `ps`, live
/// percentages only from `stats`.
pub struct ListingService {
    runtime: Arc<dyn ContainerRuntime>,
    prefix: String,
}

impl ListingService {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, prefix: String) -> Self {
        ListingService { runtime, prefix }
    }

    /// Returns the requested page plus the unfiltered row count. Offsets at
    /// or past the end yield an empty page, never an error.
    pub async fn list(
        &self,
        ctx: &CancellationToken,
        offset: usize,
        limit: usize,
        key: SortKey,
        descending: bool,
    ) -> Result<(Vec<SessionRow>, usize), IdeError> {
        match key {
            SortKey::CreatedAt | SortKey::DiskSize => {
                self.page_from_list(ctx, offset, limit, key, descending).await
            }
            SortKey::Cpu | SortKey::Memory => {
                self.page_from_usage(ctx, offset, limit, key, descending).await
            }
        }
    }

    async fn page_from_list(
        &self,
        ctx: &CancellationToken,
        offset: usize,
        limit: usize,
        key: SortKey,
        descending: bool,
    ) -> Result<(Vec<SessionRow>, usize), IdeError> {
        let mut rows = self.runtime.list_all(ctx).await?;
        let total = rows.len();
        if offset >= total || limit == 0 {
            return Ok((Vec::new(), total));
        }

        rows.sort_by(|a, b| match key {
            SortKey::DiskSize => a.raw_size.cmp(&b.raw_size),
            _ => a.created_at.cmp(&b.created_at),
        });
        if descending {
            rows.reverse();
        }
        let page: Vec<ListRow> = rows.into_iter().skip(offset).take(limit).collect();

        let ids: Vec<String> = page.iter().map(|row| row.container_id.clone()).collect();
        let usages = self.runtime.usage_for(ctx, &ids).await?;
        if usages.len() != page.len() {
            return Err(IdeError::ParseFailure(format!(
                "usage snapshot returned {} rows for {} containers",
                usages.len(),
                page.len()
            )));
        }

        let mut merged = Vec::with_capacity(page.len());
        for (row, usage) in page.into_iter().zip(usages) {
            merged.push(self.session_row(&row, usage.cpu_perc, usage.mem_usage)?);
        }
        Ok((merged, total))
    }

    async fn page_from_usage(
        &self,
        ctx: &CancellationToken,
        offset: usize,
        limit: usize,
        key: SortKey,
        descending: bool,
    ) -> Result<(Vec<SessionRow>, usize), IdeError> {
        let mut rows = self.runtime.usage_all(ctx).await?;
        let total = rows.len();
        if offset >= total || limit == 0 {
            return Ok((Vec::new(), total));
        }

        rows.sort_by(|a, b| {
            let (x, y) = match key {
                SortKey::Memory => (a.mem_perc, b.mem_perc),
                _ => (a.cpu_perc, b.cpu_perc),
            };
            x.total_cmp(&y)
        });
        if descending {
            rows.reverse();
        }
        let page: Vec<UsageRow> = rows.into_iter().skip(offset).take(limit).collect();

        let ids: Vec<String> = page.iter().map(|row| row.container_id.clone()).collect();
        let listed = self.runtime.list_by_ids(ctx, &ids).await?;
        let by_id: HashMap<String, ListRow> = listed
            .into_iter()
            .map(|row| (row.container_id.clone(), row))
            .collect();

        let mut merged = Vec::with_capacity(page.len());
        for usage in page {
            // a container that vanished between the two snapshots is dropped
            let Some(row) = by_id.get(&usage.container_id) else {
                continue;
            };
            merged.push(self.session_row(row, usage.cpu_raw, usage.mem_usage)?);
        }
        Ok((merged, total))
    }

    fn session_row(
        &self,
        row: &ListRow,
        cpu_perc: String,
        mem_usage: String,
    ) -> Result<SessionRow, IdeError> {
        Ok(SessionRow {
            container_id: row.container_id.clone(),
            identity: SessionIdentity::from_container_name(&self.prefix, &row.container_name)?,
            port: docker_gateway::published_port(&row.raw_port)?,
            created_at: row.created_at,
            disk_size: docker_gateway::size_token(&row.raw_size)?,
            cpu_perc,
            mem_usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::FakeRuntime;

    fn listing(runtime: Arc<FakeRuntime>) -> ListingService {
        ListingService::new(runtime, "mytheia".to_string())
    }

    fn two_container_runtime() -> Arc<FakeRuntime> {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.push_list_row("aaa", "mytheia-1-2", 30001, "2021-07-01 10:00:00 +0800 CST", "10MB");
        runtime.push_list_row("bbb", "mytheia-3-4", 30002, "2021-07-02 10:00:00 +0800 CST", "20MB");
        runtime.push_usage_row("aaa", 1.5, 2.0);
        runtime.push_usage_row("bbb", 12.0, 1.0);
        runtime
    }

    #[tokio::test]
    async fn cpu_descending_first_page_returns_the_hotter_container() {
        let runtime = two_container_runtime();
        let listing = listing(runtime);
        let (rows, total) = listing
            .list(&CancellationToken::new(), 0, 1, SortKey::Cpu, true)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].container_id, "bbb");
        assert_eq!(rows[0].identity, SessionIdentity::for_student(3, 4));
        assert_eq!(rows[0].port, 30002);
    }

    #[tokio::test]
    async fn memory_ascending_orders_by_mem_percent() {
        let runtime = two_container_runtime();
        let listing = listing(runtime);
        let (rows, total) = listing
            .list(&CancellationToken::new(), 0, 10, SortKey::Memory, false)
            .await
            .unwrap();
        assert_eq!(total, 2);
        let ids: Vec<&str> = rows.iter().map(|r| r.container_id.as_str()).collect();
        assert_eq!(ids, vec!["bbb", "aaa"]);
    }

    #[tokio::test]
    async fn time_sort_returns_a_contiguous_ordered_slice() {
        let runtime = two_container_runtime();
        let listing = listing(runtime);

        let (asc, total) = listing
            .list(&CancellationToken::new(), 0, 10, SortKey::CreatedAt, false)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(asc[0].container_id, "aaa");
        assert_eq!(asc[1].container_id, "bbb");

        let (desc, _) = listing
            .list(&CancellationToken::new(), 0, 10, SortKey::CreatedAt, true)
            .await
            .unwrap();
        assert_eq!(desc[0].container_id, "bbb");

        let (second, total) = listing
            .list(&CancellationToken::new(), 1, 10, SortKey::CreatedAt, false)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].container_id, "bbb");
    }

    #[tokio::test]
    async fn disk_size_sort_uses_the_raw_size_column() {
        let runtime = two_container_runtime();
        let listing = listing(runtime);
        let (rows, _) = listing
            .list(&CancellationToken::new(), 0, 10, SortKey::DiskSize, true)
            .await
            .unwrap();
        assert_eq!(rows[0].disk_size, "20MB");
    }

    #[tokio::test]
    async fn offset_past_the_end_yields_an_empty_page_with_total() {
        let runtime = two_container_runtime();
        let listing = listing(runtime);
        for key in [SortKey::CreatedAt, SortKey::Cpu] {
            let (rows, total) = listing
                .list(&CancellationToken::new(), 5, 10, key, false)
                .await
                .unwrap();
            assert!(rows.is_empty());
            assert_eq!(total, 2);
        }
    }

    #[tokio::test]
    async fn oversized_limit_returns_all_remaining_rows() {
        let runtime = two_container_runtime();
        let listing = listing(runtime);
        let (rows, total) = listing
            .list(&CancellationToken::new(), 1, 1000, SortKey::Cpu, false)
            .await
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn empty_runtime_yields_an_empty_listing() {
        let runtime = Arc::new(FakeRuntime::new());
        let listing = listing(runtime);
        let (rows, total) = listing
            .list(&CancellationToken::new(), 0, 10, SortKey::CreatedAt, false)
            .await
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn undecodable_container_name_fails_the_whole_listing() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.push_list_row("aaa", "rogue-name", 30001, "2021-07-01 10:00:00 +0800 CST", "10MB");
        runtime.push_usage_row("aaa", 1.5, 2.0);
        let listing = listing(runtime);
        let result = listing
            .list(&CancellationToken::new(), 0, 10, SortKey::CreatedAt, false)
            .await;
        assert!(matches!(result, Err(IdeError::InvalidName(_))));
    }
}
