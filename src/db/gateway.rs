use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use tracing::debug;

use crate::db::models::{DealRow, DEAL_COLUMNS};
use crate::db::{format_ts, parse_ts};
use crate::error::Result;
use crate::types::EnrichedRow;

/// Storage for the crawl: watermark, existing-row snapshots and enriched rows.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>>;

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<()>;

    /// Stored rows for whichever of `ids` exist.
    async fn load_existing_snapshot(&self, ids: &[String]) -> Result<HashMap<String, EnrichedRow>>;

    /// Insert or supersede by id. Returns the number of rows written.
    async fn upsert_rows(&self, rows: &[EnrichedRow]) -> Result<usize>;

    async fn delete_rows(&self, ids: &[String]) -> Result<u64>;

    /// Deletes rows not seen since `cutoff`.
    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

pub struct SqliteGateway {
    pool: sqlx::SqlitePool,
    /// Key of this schedule's watermark row.
    watermark_name: String,
}

impl SqliteGateway {
    pub fn new(pool: sqlx::SqlitePool, watermark_name: impl Into<String>) -> Self {
        Self { pool, watermark_name: watermark_name.into() }
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn load_watermark(&self) -> Result<Option<DateTime<Utc>>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM watermarks WHERE name = ?")
            .bind(&self.watermark_name)
            .fetch_optional(&self.pool)
            .await?;
        value.as_deref().map(parse_ts).transpose()
    }

    async fn save_watermark(&self, at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watermarks (name, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&self.watermark_name)
        .bind(format_ts(at))
        .bind(format_ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_existing_snapshot(&self, ids: &[String]) -> Result<HashMap<String, EnrichedRow>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {DEAL_COLUMNS} FROM deals WHERE id IN ("));
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id);
        }
        sep.push_unseparated(")");

        let rows: Vec<DealRow> = qb.build_query_as().fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let row = row.into_enriched()?;
            out.insert(row.id.clone(), row);
        }
        Ok(out)
    }

    async fn upsert_rows(&self, rows: &[EnrichedRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for r in rows {
            let derived = serde_json::to_string(&r.derived)?;
            sqlx::query(
                r#"
                INSERT INTO deals (
                    id, title, buy_price_cents, sales_rank, used_offer_count, new_offer_count,
                    trend, list_at_cents, avg_sale_1yr_cents, recent_sale_cents, profit_cents, margin,
                    profit_confidence, sale_events, drop_candidates, peak_month, trough_month, seller_id,
                    seller_name, seller_quality, derived, catalog_updated_at, last_seen, source
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    buy_price_cents = excluded.buy_price_cents,
                    sales_rank = excluded.sales_rank,
                    used_offer_count = excluded.used_offer_count,
                    new_offer_count = excluded.new_offer_count,
                    trend = excluded.trend,
                    list_at_cents = excluded.list_at_cents,
                    avg_sale_1yr_cents = excluded.avg_sale_1yr_cents,
                    recent_sale_cents = excluded.recent_sale_cents,
                    profit_cents = excluded.profit_cents,
                    margin = excluded.margin,
                    profit_confidence = excluded.profit_confidence,
                    sale_events = excluded.sale_events,
                    drop_candidates = excluded.drop_candidates,
                    peak_month = excluded.peak_month,
                    trough_month = excluded.trough_month,
                    seller_id = excluded.seller_id,
                    seller_name = excluded.seller_name,
                    seller_quality = excluded.seller_quality,
                    derived = excluded.derived,
                    catalog_updated_at = excluded.catalog_updated_at,
                    last_seen = excluded.last_seen,
                    source = excluded.source
                "#,
            )
            .bind(&r.id)
            .bind(&r.title)
            .bind(r.buy_price_cents)
            .bind(r.sales_rank)
            .bind(r.used_offer_count)
            .bind(r.new_offer_count)
            .bind(r.trend.to_string())
            .bind(r.list_at_cents)
            .bind(r.avg_sale_1yr_cents)
            .bind(r.recent_sale_cents)
            .bind(r.profit_cents)
            .bind(r.margin)
            .bind(r.profit_confidence)
            .bind(r.sale_events)
            .bind(r.drop_candidates)
            .bind(r.peak_month.map(i64::from))
            .bind(r.trough_month.map(i64::from))
            .bind(&r.seller_id)
            .bind(&r.seller_name)
            .bind(r.seller_quality)
            .bind(derived)
            .bind(r.catalog_updated_at)
            .bind(format_ts(r.last_seen))
            .bind(r.source.to_string())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!(count = rows.len(), "upserted deal rows");
        Ok(rows.len())
    }

    async fn delete_rows(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM deals WHERE id IN (");
        let mut sep = qb.separated(", ");
        for id in ids {
            sep.push_bind(id);
        }
        sep.push_unseparated(")");
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn delete_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let res = sqlx::query("DELETE FROM deals WHERE last_seen < ?")
            .bind(format_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{memory_pool, row};

    #[tokio::test]
    async fn watermark_round_trip_per_schedule() {
        let pool = memory_pool().await;
        let gw = SqliteGateway::new(pool.clone(), "incremental_crawl");
        let other = SqliteGateway::new(pool, "backfill");

        assert_eq!(gw.load_watermark().await.unwrap(), None);

        let at = DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z").unwrap().with_timezone(&Utc);
        gw.save_watermark(at).await.unwrap();
        gw.save_watermark(at + chrono::Duration::minutes(5)).await.unwrap();

        assert_eq!(gw.load_watermark().await.unwrap(), Some(at + chrono::Duration::minutes(5)));
        assert_eq!(other.load_watermark().await.unwrap(), None);
    }

    #[tokio::test]
    async fn upsert_supersedes_in_place() {
        let gw = SqliteGateway::new(memory_pool().await, "w");
        let mut a = row("A1");
        a.derived.insert("percent_down_365".to_string(), 12.5);
        gw.upsert_rows(&[a.clone(), row("B2")]).await.unwrap();

        a.buy_price_cents = Some(999);
        gw.upsert_rows(&[a.clone()]).await.unwrap();
        // Idempotent on id.
        gw.upsert_rows(&[a.clone()]).await.unwrap();

        let snap = gw
            .load_existing_snapshot(&["A1".to_string(), "B2".to_string(), "C3".to_string()])
            .await
            .unwrap();
        assert_eq!(snap.len(), 2);
        let stored = &snap["A1"];
        assert_eq!(stored.buy_price_cents, Some(999));
        assert_eq!(stored.derived.get("percent_down_365"), Some(&12.5));
        assert_eq!(stored.last_seen.timestamp_millis(), a.last_seen.timestamp_millis());
    }

    #[tokio::test]
    async fn delete_rows_and_stale() {
        let gw = SqliteGateway::new(memory_pool().await, "w");
        let now = Utc::now();
        let mut old = row("OLD");
        old.last_seen = now - chrono::Duration::hours(80);
        let mut fresh = row("NEW");
        fresh.last_seen = now;
        gw.upsert_rows(&[old, fresh, row("GONE")]).await.unwrap();

        assert_eq!(gw.delete_rows(&["GONE".to_string()]).await.unwrap(), 1);
        assert_eq!(gw.delete_rows(&[]).await.unwrap(), 0);

        let removed = gw.delete_stale(now - chrono::Duration::hours(72)).await.unwrap();
        assert_eq!(removed, 1);

        let snap = gw
            .load_existing_snapshot(&["OLD".to_string(), "NEW".to_string()])
            .await
            .unwrap();
        assert!(snap.contains_key("NEW"));
        assert!(!snap.contains_key("OLD"));
    }
}
