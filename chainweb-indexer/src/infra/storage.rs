// This file is part of chainweb-indexer.
// Copyright (C) 2025 Chainweb Indexer Contributors
// SPDX-License-Identifier: Apache-2.0
// Licensed under the Apache License, Version 2.0 (the "License");
// You may not use this file except in compliance with the License.
// You may obtain a copy of the License at
// http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::domain::{
    ChainId, Event,
    storage::{CoverageUpdate, Storage},
};
use indexer_common::{domain::IntervalSet, infra::pool::PostgresPool};
use indoc::{formatdoc, indoc};
use log::debug;
use sqlx::{Postgres, QueryBuilder, Row, postgres::PgRow, types::Json};

type Tx = sqlx::Transaction<'static, Postgres>;

/// Postgres based implementation of [Storage]: one table per watched event
/// plus the shared `coordinator` table holding the coverage ranges.
#[derive(Debug, Clone)]
pub struct PostgresStorage {
    pool: PostgresPool,
}

impl PostgresStorage {
    /// Create a new [PostgresStorage].
    pub fn new(pool: PostgresPool) -> Self {
        Self { pool }
    }
}

impl Storage for PostgresStorage {
    type Tx = Tx;

    async fn provision(&self, event_names: &[String]) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            CREATE TABLE IF NOT EXISTS coordinator (
                chain TEXT NOT NULL,
                name TEXT NOT NULL,
                range JSONB NOT NULL
            )
        "};
        sqlx::query(query).execute(&*self.pool).await?;

        let query = indoc! {"
            CREATE UNIQUE INDEX IF NOT EXISTS coordinator_name_chain_idx
            ON coordinator (name, chain)
        "};
        sqlx::query(query).execute(&*self.pool).await?;

        for name in event_names {
            let table = quote_ident(name);

            let query = formatdoc! {"
                CREATE TABLE IF NOT EXISTS {table} (
                    name TEXT NOT NULL,
                    params JSONB NOT NULL,
                    req_key TEXT NOT NULL,
                    chain TEXT NOT NULL,
                    block TEXT NOT NULL,
                    rank BIGINT NOT NULL,
                    height BIGINT NOT NULL,
                    ts TIMESTAMPTZ NOT NULL
                )
            "};
            sqlx::query(&query).execute(&*self.pool).await?;

            for column in ["req_key", "height", "block", "ts"] {
                let query = format!(
                    "CREATE INDEX IF NOT EXISTS {index} ON {table} ({column})",
                    index = index_ident(name, column),
                );
                sqlx::query(&query).execute(&*self.pool).await?;
            }

            // Compound index used by pruning.
            let query = format!(
                "CREATE INDEX IF NOT EXISTS {index} ON {table} (chain, height)",
                index = index_ident(name, "prune"),
            );
            sqlx::query(&query).execute(&*self.pool).await?;

            debug!(name; "event table provisioned");
        }

        Ok(())
    }

    async fn get_coverage(
        &self,
        chain: &ChainId,
        name: &str,
    ) -> Result<Option<IntervalSet>, sqlx::Error> {
        let query = indoc! {"
            SELECT range
            FROM coordinator
            WHERE chain = $1 AND name = $2
        "};

        sqlx::query(query)
            .bind(chain.as_str())
            .bind(name)
            .fetch_optional(&*self.pool)
            .await?
            .map(|row: PgRow| {
                row.try_get::<Json<IntervalSet>, _>("range")
                    .map(|Json(range)| range)
            })
            .transpose()
    }

    async fn put_coverage(
        &self,
        chain: &ChainId,
        name: &str,
        range: &IntervalSet,
    ) -> Result<(), sqlx::Error> {
        let query = indoc! {"
            INSERT INTO coordinator (chain, name, range)
            VALUES ($1, $2, $3)
            ON CONFLICT (name, chain) DO UPDATE SET range = EXCLUDED.range
        "};

        sqlx::query(query)
            .bind(chain.as_str())
            .bind(name)
            .bind(Json(range))
            .execute(&*self.pool)
            .await?;

        Ok(())
    }

    async fn begin(&self) -> Result<Tx, sqlx::Error> {
        self.pool.begin().await
    }

    async fn lock_coverage(
        &self,
        chain: &ChainId,
        tx: &mut Tx,
    ) -> Result<Vec<CoverageUpdate>, sqlx::Error> {
        // Ordered so concurrent transactions acquire the row locks in the
        // same sequence.
        let query = indoc! {"
            SELECT name, range
            FROM coordinator
            WHERE chain = $1
            ORDER BY name
            FOR UPDATE
        "};

        sqlx::query(query)
            .bind(chain.as_str())
            .fetch_all(&mut **tx)
            .await?
            .into_iter()
            .map(|row: PgRow| {
                let name = row.try_get::<String, _>("name")?;
                let Json(range) = row.try_get::<Json<IntervalSet>, _>("range")?;

                Ok(CoverageUpdate { name, range })
            })
            .collect()
    }

    async fn save_event(&self, event: &Event, tx: &mut Tx) -> Result<(), sqlx::Error> {
        let query = formatdoc! {"
            INSERT INTO {table} (name, params, req_key, chain, block, rank, height, ts)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
            table = quote_ident(&event.name),
        };

        sqlx::query(&query)
            .bind(&event.name)
            .bind(Json(&event.params))
            .bind(&event.req_key)
            .bind(event.chain.as_str())
            .bind(&event.block)
            .bind(event.rank as i64)
            .bind(event.height as i64)
            .bind(event.ts)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn save_coverage(
        &self,
        chain: &ChainId,
        updates: &[CoverageUpdate],
        tx: &mut Tx,
    ) -> Result<(), sqlx::Error> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut query =
            QueryBuilder::<Postgres>::new("INSERT INTO coordinator (chain, name, range) ");
        query.push_values(updates, |mut q, update| {
            q.push_bind(chain.as_str())
                .push_bind(&update.name)
                .push_bind(Json(&update.range));
        });
        query.push(" ON CONFLICT (name, chain) DO UPDATE SET range = EXCLUDED.range");

        query.build().execute(&mut **tx).await?;

        Ok(())
    }

    async fn commit(&self, tx: Tx) -> Result<(), sqlx::Error> {
        tx.commit().await
    }

    async fn prune(
        &self,
        chain: &ChainId,
        name: &str,
        lo: u64,
        hi: u64,
    ) -> Result<u64, sqlx::Error> {
        let query = formatdoc! {"
            DELETE FROM {table}
            WHERE chain = $1 AND (height < $2 OR height > $3)
            ",
            table = quote_ident(name),
        };

        let result = sqlx::query(&query)
            .bind(chain.as_str())
            .bind(lo as i64)
            .bind(hi as i64)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

/// Quote an event name as a table identifier. Names are validated at startup
/// to contain no quotes.
fn quote_ident(name: &str) -> String {
    format!("\"{name}\"")
}

/// Index names are schema-global in Postgres, so they embed the table name,
/// with anything outside `[a-z0-9_]` flattened to underscores.
fn index_ident(name: &str, column: &str) -> String {
    let sanitized = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>();
    format!("{sanitized}_{column}_idx")
}
