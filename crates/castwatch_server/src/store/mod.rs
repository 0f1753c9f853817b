#![forbid(unsafe_code)]

pub mod memory;

#[cfg(test)]
mod tests;

use std::str::FromStr;

use anyhow::{Context, anyhow};
use castwatch_domain::{AccountId, Cast, CastName, CastSource, ChannelId, SessionId};
use castwatch_platform::{
	CastEvent, PayerEntry, SessionAggregates, SessionRecord, Store, ThumbnailRecord, ViewerSnapshot, unix_ms_now,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::warn;

pub use memory::MemoryStore;

/// `Store` over sqlx; the backend is picked from the URL scheme.
#[derive(Clone)]
pub struct SqlStore {
	backend: SqlBackend,
}

#[derive(Clone)]
enum SqlBackend {
	Sqlite(sqlx::SqlitePool),
	Postgres(sqlx::PgPool),
	Mysql(sqlx::MySqlPool),
}

type CastRow = (String, String, Option<String>, Option<i64>, String);

impl SqlStore {
	pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
		if database_url.starts_with("sqlite:") {
			let opts = SqliteConnectOptions::from_str(database_url)
				.context("parse sqlite url")?
				.create_if_missing(true);
			// Every connection to an in-memory database is a separate database.
			let max = if database_url.contains(":memory:") { 1 } else { 4 };
			let pool = SqlitePoolOptions::new()
				.max_connections(max)
				.connect_with(opts)
				.await
				.context("connect sqlite")?;
			sqlx::migrate!("migrations/sqlite")
				.run(&pool)
				.await
				.context("run sqlite migrations")?;

			Ok(Self {
				backend: SqlBackend::Sqlite(pool),
			})
		} else if database_url.starts_with("postgres:") || database_url.starts_with("postgresql:") {
			let pool = sqlx::PgPool::connect(database_url).await.context("connect postgres")?;
			sqlx::migrate!("migrations/postgres")
				.run(&pool)
				.await
				.context("run postgres migrations")?;

			Ok(Self {
				backend: SqlBackend::Postgres(pool),
			})
		} else if database_url.starts_with("mysql:") || database_url.starts_with("mariadb:") {
			let pool = sqlx::MySqlPool::connect(database_url).await.context("connect mysql")?;
			sqlx::migrate!("migrations/mysql")
				.run(&pool)
				.await
				.context("run mysql migrations")?;

			Ok(Self {
				backend: SqlBackend::Mysql(pool),
			})
		} else {
			Err(anyhow!("unsupported database_url (use sqlite:, postgres:, mysql:)"))
		}
	}

	pub fn backend_name(&self) -> &'static str {
		match self.backend {
			SqlBackend::Sqlite(_) => "sqlite",
			SqlBackend::Postgres(_) => "postgres",
			SqlBackend::Mysql(_) => "mysql",
		}
	}
}

fn cast_from_row((name, account, display_name, channel_id, source): CastRow) -> Option<Cast> {
	let name = match CastName::new(name) {
		Ok(n) => n,
		Err(e) => {
			warn!(error = %e, "skipping cast row with invalid name");
			return None;
		}
	};
	let account = match AccountId::new(account) {
		Ok(a) => a,
		Err(e) => {
			warn!(cast = %name, error = %e, "skipping cast row with invalid account");
			return None;
		}
	};
	let mut cast = Cast::new(name, account).with_source(source.parse().unwrap_or(CastSource::Owned));
	cast.display_name = display_name.filter(|d| !d.trim().is_empty());
	cast.channel_id = channel_id.filter(|id| *id > 0).map(|id| ChannelId::new(id as u64));
	Some(cast)
}

fn session_key(id: Option<SessionId>) -> String {
	id.map(|s| s.to_string()).unwrap_or_default()
}

#[async_trait::async_trait]
impl Store for SqlStore {
	async fn insert_session(&self, session: &SessionRecord) -> anyhow::Result<()> {
		let id = session.id.to_string();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("INSERT INTO sessions (session_id, cast_name, account_id, started_at) VALUES (?, ?, ?, ?)")
					.bind(&id)
					.bind(session.cast.as_str())
					.bind(session.account_id.as_str())
					.bind(session.started_at_ms)
					.execute(pool)
					.await
					.context("insert session (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO sessions (session_id, cast_name, account_id, started_at) VALUES ($1, $2, $3, $4)",
				)
				.bind(&id)
				.bind(session.cast.as_str())
				.bind(session.account_id.as_str())
				.bind(session.started_at_ms)
				.execute(pool)
				.await
				.context("insert session (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("INSERT INTO sessions (session_id, cast_name, account_id, started_at) VALUES (?, ?, ?, ?)")
					.bind(&id)
					.bind(session.cast.as_str())
					.bind(session.account_id.as_str())
					.bind(session.started_at_ms)
					.execute(pool)
					.await
					.context("insert session (mysql)")?;
			}
		}
		Ok(())
	}

	async fn finalize_session(&self, id: SessionId, ended_at_ms: i64, aggregates: SessionAggregates) -> anyhow::Result<()> {
		let id = id.to_string();
		let messages = aggregates.message_count as i64;
		let tokens = aggregates.tip_total as i64;
		let peak = i64::from(aggregates.peak_viewers);
		let affected = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query(
				"UPDATE sessions SET ended_at = ?, total_messages = ?, total_tokens = ?, peak_viewers = ? \
				WHERE session_id = ? AND ended_at IS NULL",
			)
			.bind(ended_at_ms)
			.bind(messages)
			.bind(tokens)
			.bind(peak)
			.bind(&id)
			.execute(pool)
			.await
			.context("finalize session (sqlite)")?
			.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query(
				"UPDATE sessions SET ended_at = $1, total_messages = $2, total_tokens = $3, peak_viewers = $4 \
				WHERE session_id = $5 AND ended_at IS NULL",
			)
			.bind(ended_at_ms)
			.bind(messages)
			.bind(tokens)
			.bind(peak)
			.bind(&id)
			.execute(pool)
			.await
			.context("finalize session (postgres)")?
			.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query(
				"UPDATE sessions SET ended_at = ?, total_messages = ?, total_tokens = ?, peak_viewers = ? \
				WHERE session_id = ? AND ended_at IS NULL",
			)
			.bind(ended_at_ms)
			.bind(messages)
			.bind(tokens)
			.bind(peak)
			.bind(&id)
			.execute(pool)
			.await
			.context("finalize session (mysql)")?
			.rows_affected(),
		};
		if affected == 0 {
			warn!(session = %id, "finalize matched no open session");
		}
		Ok(())
	}

	async fn insert_events_batch(&self, events: &[CastEvent]) -> anyhow::Result<u64> {
		if events.is_empty() {
			return Ok(0);
		}
		let mut inserted = 0;
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				for e in events {
					inserted += sqlx::query(
						"INSERT INTO cast_events (dedup_key, cast_name, account_id, session_id, message_time, kind, \
						user_name, user_id, body, tokens, is_vip, user_league, user_level, metadata) \
						VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) ON CONFLICT (dedup_key) DO NOTHING",
					)
					.bind(e.dedup_key())
					.bind(e.cast.as_str())
					.bind(e.account_id.as_str())
					.bind(e.session_id.map(|s| s.to_string()))
					.bind(e.message_time_ms)
					.bind(e.kind.as_str())
					.bind(&e.user_name)
					.bind(e.user_id.as_deref())
					.bind(&e.body)
					.bind(e.tokens as i64)
					.bind(e.is_vip)
					.bind(e.user_league.as_deref())
					.bind(e.user_level.map(i64::from))
					.bind(e.metadata.to_string())
					.execute(&mut *tx)
					.await
					.context("insert event (sqlite)")?
					.rows_affected();
				}
				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				for e in events {
					inserted += sqlx::query(
						"INSERT INTO cast_events (dedup_key, cast_name, account_id, session_id, message_time, kind, \
						user_name, user_id, body, tokens, is_vip, user_league, user_level, metadata) \
						VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14) \
						ON CONFLICT (dedup_key) DO NOTHING",
					)
					.bind(e.dedup_key())
					.bind(e.cast.as_str())
					.bind(e.account_id.as_str())
					.bind(e.session_id.map(|s| s.to_string()))
					.bind(e.message_time_ms)
					.bind(e.kind.as_str())
					.bind(&e.user_name)
					.bind(e.user_id.as_deref())
					.bind(&e.body)
					.bind(e.tokens as i64)
					.bind(e.is_vip)
					.bind(e.user_league.as_deref())
					.bind(e.user_level.map(i64::from))
					.bind(e.metadata.to_string())
					.execute(&mut *tx)
					.await
					.context("insert event (postgres)")?
					.rows_affected();
				}
				tx.commit().await.context("commit postgres tx")?;
			}
			SqlBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				for e in events {
					inserted += sqlx::query(
						"INSERT IGNORE INTO cast_events (dedup_key, cast_name, account_id, session_id, message_time, kind, \
						user_name, user_id, body, tokens, is_vip, user_league, user_level, metadata) \
						VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
					)
					.bind(e.dedup_key())
					.bind(e.cast.as_str())
					.bind(e.account_id.as_str())
					.bind(e.session_id.map(|s| s.to_string()))
					.bind(e.message_time_ms)
					.bind(e.kind.as_str())
					.bind(&e.user_name)
					.bind(e.user_id.as_deref())
					.bind(&e.body)
					.bind(e.tokens as i64)
					.bind(e.is_vip)
					.bind(e.user_league.as_deref())
					.bind(e.user_level.map(i64::from))
					.bind(e.metadata.to_string())
					.execute(&mut *tx)
					.await
					.context("insert event (mysql)")?
					.rows_affected();
				}
				tx.commit().await.context("commit mysql tx")?;
			}
		}
		Ok(inserted)
	}

	async fn query_event_count(&self, id: SessionId) -> anyhow::Result<u64> {
		let id = id.to_string();
		let (count,): (i64,) = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as("SELECT COUNT(*) FROM cast_events WHERE session_id = ?")
				.bind(&id)
				.fetch_one(pool)
				.await
				.context("count events (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as("SELECT COUNT(*) FROM cast_events WHERE session_id = $1")
				.bind(&id)
				.fetch_one(pool)
				.await
				.context("count events (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as("SELECT COUNT(*) FROM cast_events WHERE session_id = ?")
				.bind(&id)
				.fetch_one(pool)
				.await
				.context("count events (mysql)")?,
		};
		Ok(count.max(0) as u64)
	}

	async fn load_casts(&self) -> anyhow::Result<Vec<Cast>> {
		const SQL: &str =
			"SELECT name, account_id, display_name, channel_id, source FROM casts WHERE is_active ORDER BY name";
		let rows: Vec<CastRow> = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query_as(SQL)
				.fetch_all(pool)
				.await
				.context("load casts (sqlite)")?,
			SqlBackend::Postgres(pool) => sqlx::query_as(SQL)
				.fetch_all(pool)
				.await
				.context("load casts (postgres)")?,
			SqlBackend::Mysql(pool) => sqlx::query_as(SQL)
				.fetch_all(pool)
				.await
				.context("load casts (mysql)")?,
		};
		Ok(rows.into_iter().filter_map(cast_from_row).collect())
	}

	async fn upsert_cast(&self, cast: &Cast) -> anyhow::Result<()> {
		let channel_id = cast.channel_id.map(|c| c.get() as i64);
		let now = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO casts (name, account_id, display_name, channel_id, source, is_active, updated_at) \
					VALUES (?, ?, ?, ?, ?, TRUE, ?) \
					ON CONFLICT (name) DO UPDATE SET account_id = excluded.account_id, \
					display_name = excluded.display_name, channel_id = COALESCE(excluded.channel_id, casts.channel_id), \
					source = excluded.source, is_active = TRUE, updated_at = excluded.updated_at",
				)
				.bind(cast.name.as_str())
				.bind(cast.account_id.as_str())
				.bind(cast.display_name.as_deref())
				.bind(channel_id)
				.bind(cast.source.as_str())
				.bind(now)
				.execute(pool)
				.await
				.context("upsert cast (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO casts (name, account_id, display_name, channel_id, source, is_active, updated_at) \
					VALUES ($1, $2, $3, $4, $5, TRUE, $6) \
					ON CONFLICT (name) DO UPDATE SET account_id = EXCLUDED.account_id, \
					display_name = EXCLUDED.display_name, channel_id = COALESCE(EXCLUDED.channel_id, casts.channel_id), \
					source = EXCLUDED.source, is_active = TRUE, updated_at = EXCLUDED.updated_at",
				)
				.bind(cast.name.as_str())
				.bind(cast.account_id.as_str())
				.bind(cast.display_name.as_deref())
				.bind(channel_id)
				.bind(cast.source.as_str())
				.bind(now)
				.execute(pool)
				.await
				.context("upsert cast (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO casts (name, account_id, display_name, channel_id, source, is_active, updated_at) \
					VALUES (?, ?, ?, ?, ?, TRUE, ?) \
					ON DUPLICATE KEY UPDATE account_id = VALUES(account_id), display_name = VALUES(display_name), \
					channel_id = COALESCE(VALUES(channel_id), channel_id), source = VALUES(source), \
					is_active = TRUE, updated_at = VALUES(updated_at)",
				)
				.bind(cast.name.as_str())
				.bind(cast.account_id.as_str())
				.bind(cast.display_name.as_deref())
				.bind(channel_id)
				.bind(cast.source.as_str())
				.bind(now)
				.execute(pool)
				.await
				.context("upsert cast (mysql)")?;
			}
		}
		Ok(())
	}

	async fn save_channel_id(&self, cast: &CastName, channel_id: ChannelId) -> anyhow::Result<()> {
		let channel_id = channel_id.get() as i64;
		let now = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE casts SET channel_id = ?, updated_at = ? WHERE name = ?")
					.bind(channel_id)
					.bind(now)
					.bind(cast.as_str())
					.execute(pool)
					.await
					.context("save channel id (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE casts SET channel_id = $1, updated_at = $2 WHERE name = $3")
					.bind(channel_id)
					.bind(now)
					.bind(cast.as_str())
					.execute(pool)
					.await
					.context("save channel id (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("UPDATE casts SET channel_id = ?, updated_at = ? WHERE name = ?")
					.bind(channel_id)
					.bind(now)
					.bind(cast.as_str())
					.execute(pool)
					.await
					.context("save channel id (mysql)")?;
			}
		}
		Ok(())
	}

	async fn touch_cast_online(&self, cast: &CastName, at_ms: i64) -> anyhow::Result<()> {
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query("UPDATE casts SET last_seen_online = ? WHERE name = ?")
					.bind(at_ms)
					.bind(cast.as_str())
					.execute(pool)
					.await
					.context("touch cast (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query("UPDATE casts SET last_seen_online = $1 WHERE name = $2")
					.bind(at_ms)
					.bind(cast.as_str())
					.execute(pool)
					.await
					.context("touch cast (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query("UPDATE casts SET last_seen_online = ? WHERE name = ?")
					.bind(at_ms)
					.bind(cast.as_str())
					.execute(pool)
					.await
					.context("touch cast (mysql)")?;
			}
		}
		Ok(())
	}

	async fn close_orphan_sessions(&self, ended_at_ms: i64) -> anyhow::Result<u64> {
		let closed = match &self.backend {
			SqlBackend::Sqlite(pool) => sqlx::query("UPDATE sessions SET ended_at = ? WHERE ended_at IS NULL")
				.bind(ended_at_ms)
				.execute(pool)
				.await
				.context("close orphan sessions (sqlite)")?
				.rows_affected(),
			SqlBackend::Postgres(pool) => sqlx::query("UPDATE sessions SET ended_at = $1 WHERE ended_at IS NULL")
				.bind(ended_at_ms)
				.execute(pool)
				.await
				.context("close orphan sessions (postgres)")?
				.rows_affected(),
			SqlBackend::Mysql(pool) => sqlx::query("UPDATE sessions SET ended_at = ? WHERE ended_at IS NULL")
				.bind(ended_at_ms)
				.execute(pool)
				.await
				.context("close orphan sessions (mysql)")?
				.rows_affected(),
		};
		Ok(closed)
	}

	async fn record_viewers(&self, snapshot: &ViewerSnapshot) -> anyhow::Result<()> {
		if snapshot.viewers.is_empty() {
			return Ok(());
		}
		let session = session_key(snapshot.session_id);
		let at = snapshot.taken_at_ms;
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				for v in &snapshot.viewers {
					sqlx::query(
						"INSERT INTO viewer_snapshots (account_id, cast_name, session_id, user_name, user_id, league, level, \
						is_fan_club, first_seen_at, last_seen_at, visit_count) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1) \
						ON CONFLICT (account_id, cast_name, user_name, session_id) DO UPDATE SET \
						user_id = COALESCE(excluded.user_id, viewer_snapshots.user_id), \
						league = COALESCE(excluded.league, viewer_snapshots.league), \
						level = COALESCE(excluded.level, viewer_snapshots.level), \
						is_fan_club = excluded.is_fan_club, last_seen_at = excluded.last_seen_at, \
						visit_count = viewer_snapshots.visit_count + 1",
					)
					.bind(snapshot.account_id.as_str())
					.bind(snapshot.cast.as_str())
					.bind(&session)
					.bind(&v.user_name)
					.bind(v.user_id.as_deref())
					.bind(v.league.as_deref())
					.bind(v.level.map(i64::from))
					.bind(v.is_fan_club)
					.bind(at)
					.bind(at)
					.execute(&mut *tx)
					.await
					.context("upsert viewer (sqlite)")?;
				}
				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				for v in &snapshot.viewers {
					sqlx::query(
						"INSERT INTO viewer_snapshots (account_id, cast_name, session_id, user_name, user_id, league, level, \
						is_fan_club, first_seen_at, last_seen_at, visit_count) \
						VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 1) \
						ON CONFLICT (account_id, cast_name, user_name, session_id) DO UPDATE SET \
						user_id = COALESCE(EXCLUDED.user_id, viewer_snapshots.user_id), \
						league = COALESCE(EXCLUDED.league, viewer_snapshots.league), \
						level = COALESCE(EXCLUDED.level, viewer_snapshots.level), \
						is_fan_club = EXCLUDED.is_fan_club, last_seen_at = EXCLUDED.last_seen_at, \
						visit_count = viewer_snapshots.visit_count + 1",
					)
					.bind(snapshot.account_id.as_str())
					.bind(snapshot.cast.as_str())
					.bind(&session)
					.bind(&v.user_name)
					.bind(v.user_id.as_deref())
					.bind(v.league.as_deref())
					.bind(v.level.map(i64::from))
					.bind(v.is_fan_club)
					.bind(at)
					.bind(at)
					.execute(&mut *tx)
					.await
					.context("upsert viewer (postgres)")?;
				}
				tx.commit().await.context("commit postgres tx")?;
			}
			SqlBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				for v in &snapshot.viewers {
					sqlx::query(
						"INSERT INTO viewer_snapshots (account_id, cast_name, session_id, user_name, user_id, league, level, \
						is_fan_club, first_seen_at, last_seen_at, visit_count) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1) \
						ON DUPLICATE KEY UPDATE user_id = COALESCE(VALUES(user_id), user_id), \
						league = COALESCE(VALUES(league), league), level = COALESCE(VALUES(level), level), \
						is_fan_club = VALUES(is_fan_club), last_seen_at = VALUES(last_seen_at), \
						visit_count = visit_count + 1",
					)
					.bind(snapshot.account_id.as_str())
					.bind(snapshot.cast.as_str())
					.bind(&session)
					.bind(&v.user_name)
					.bind(v.user_id.as_deref())
					.bind(v.league.as_deref())
					.bind(v.level.map(i64::from))
					.bind(v.is_fan_club)
					.bind(at)
					.bind(at)
					.execute(&mut *tx)
					.await
					.context("upsert viewer (mysql)")?;
				}
				tx.commit().await.context("commit mysql tx")?;
			}
		}
		Ok(())
	}

	async fn upsert_payers(&self, account: &AccountId, payers: &[PayerEntry]) -> anyhow::Result<u64> {
		if payers.is_empty() {
			return Ok(0);
		}
		let now = unix_ms_now();
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				let mut tx = pool.begin().await.context("begin sqlite tx")?;
				for p in payers {
					sqlx::query(
						"INSERT INTO payers (account_id, user_name, user_id, total_tokens, last_paid, updated_at) \
						VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT (account_id, user_name) DO UPDATE SET \
						user_id = COALESCE(excluded.user_id, payers.user_id), total_tokens = excluded.total_tokens, \
						last_paid = COALESCE(excluded.last_paid, payers.last_paid), updated_at = excluded.updated_at",
					)
					.bind(account.as_str())
					.bind(&p.user_name)
					.bind(p.user_id.as_deref())
					.bind(p.total_tokens as i64)
					.bind(p.last_paid.as_deref())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("upsert payer (sqlite)")?;
				}
				tx.commit().await.context("commit sqlite tx")?;
			}
			SqlBackend::Postgres(pool) => {
				let mut tx = pool.begin().await.context("begin postgres tx")?;
				for p in payers {
					sqlx::query(
						"INSERT INTO payers (account_id, user_name, user_id, total_tokens, last_paid, updated_at) \
						VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (account_id, user_name) DO UPDATE SET \
						user_id = COALESCE(EXCLUDED.user_id, payers.user_id), total_tokens = EXCLUDED.total_tokens, \
						last_paid = COALESCE(EXCLUDED.last_paid, payers.last_paid), updated_at = EXCLUDED.updated_at",
					)
					.bind(account.as_str())
					.bind(&p.user_name)
					.bind(p.user_id.as_deref())
					.bind(p.total_tokens as i64)
					.bind(p.last_paid.as_deref())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("upsert payer (postgres)")?;
				}
				tx.commit().await.context("commit postgres tx")?;
			}
			SqlBackend::Mysql(pool) => {
				let mut tx = pool.begin().await.context("begin mysql tx")?;
				for p in payers {
					sqlx::query(
						"INSERT INTO payers (account_id, user_name, user_id, total_tokens, last_paid, updated_at) \
						VALUES (?, ?, ?, ?, ?, ?) ON DUPLICATE KEY UPDATE \
						user_id = COALESCE(VALUES(user_id), user_id), total_tokens = VALUES(total_tokens), \
						last_paid = COALESCE(VALUES(last_paid), last_paid), updated_at = VALUES(updated_at)",
					)
					.bind(account.as_str())
					.bind(&p.user_name)
					.bind(p.user_id.as_deref())
					.bind(p.total_tokens as i64)
					.bind(p.last_paid.as_deref())
					.bind(now)
					.execute(&mut *tx)
					.await
					.context("upsert payer (mysql)")?;
				}
				tx.commit().await.context("commit mysql tx")?;
			}
		}
		Ok(payers.len() as u64)
	}

	async fn insert_thumbnail(&self, thumbnail: &ThumbnailRecord) -> anyhow::Result<()> {
		let session = thumbnail.session_id.map(|s| s.to_string());
		match &self.backend {
			SqlBackend::Sqlite(pool) => {
				sqlx::query(
					"INSERT INTO thumbnails (account_id, cast_name, session_id, image_url, captured_at) \
					VALUES (?, ?, ?, ?, ?)",
				)
				.bind(thumbnail.account_id.as_str())
				.bind(thumbnail.cast.as_str())
				.bind(session)
				.bind(&thumbnail.url)
				.bind(thumbnail.captured_at_ms)
				.execute(pool)
				.await
				.context("insert thumbnail (sqlite)")?;
			}
			SqlBackend::Postgres(pool) => {
				sqlx::query(
					"INSERT INTO thumbnails (account_id, cast_name, session_id, image_url, captured_at) \
					VALUES ($1, $2, $3, $4, $5)",
				)
				.bind(thumbnail.account_id.as_str())
				.bind(thumbnail.cast.as_str())
				.bind(session)
				.bind(&thumbnail.url)
				.bind(thumbnail.captured_at_ms)
				.execute(pool)
				.await
				.context("insert thumbnail (postgres)")?;
			}
			SqlBackend::Mysql(pool) => {
				sqlx::query(
					"INSERT INTO thumbnails (account_id, cast_name, session_id, image_url, captured_at) \
					VALUES (?, ?, ?, ?, ?)",
				)
				.bind(thumbnail.account_id.as_str())
				.bind(thumbnail.cast.as_str())
				.bind(session)
				.bind(&thumbnail.url)
				.bind(thumbnail.captured_at_ms)
				.execute(pool)
				.await
				.context("insert thumbnail (mysql)")?;
			}
		}
		Ok(())
	}
}
