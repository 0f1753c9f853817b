#![forbid(unsafe_code)]

use castwatch_domain::{AccountId, Cast, CastName, CastSource, ChannelId, EventKind, SessionId};
use castwatch_platform::{
	CastEvent, PayerEntry, SessionAggregates, SessionRecord, Store, ThumbnailRecord, ViewerEntry, ViewerSnapshot,
};

use super::SqlStore;

async fn sqlite() -> SqlStore {
	SqlStore::connect("sqlite::memory:").await.unwrap()
}

fn name(s: &str) -> CastName {
	CastName::new(s).unwrap()
}

fn account() -> AccountId {
	AccountId::new("acc-1").unwrap()
}

fn event(session: SessionId, body: &str, tokens: u64) -> CastEvent {
	CastEvent {
		wire_id: format!("msg:{body}"),
		cast: name("risa"),
		account_id: account(),
		session_id: Some(session),
		message_time_ms: 1_700_000_000_000,
		kind: if tokens > 0 { EventKind::Tip } else { EventKind::Chat },
		user_name: "fan".to_string(),
		user_id: Some("42".to_string()),
		body: body.to_string(),
		tokens,
		is_vip: false,
		user_league: Some("gold".to_string()),
		user_level: Some(12),
		metadata: serde_json::json!({ "raw": true }),
	}
}

#[tokio::test]
async fn unsupported_url_is_rejected() {
	assert!(SqlStore::connect("redis://localhost").await.is_err());
}

#[tokio::test]
async fn casts_round_trip_and_keep_known_channel() {
	let store = sqlite().await;
	assert_eq!(store.backend_name(), "sqlite");

	let risa = Cast::new(name("risa"), account()).with_channel_id(ChannelId::new(178));
	let mut rival = Cast::new(name("rival"), account()).with_source(CastSource::Observed);
	rival.display_name = Some("Rival".to_string());
	store.upsert_cast(&risa).await.unwrap();
	store.upsert_cast(&rival).await.unwrap();

	// re-seeding without a channel id keeps the learned one
	store.upsert_cast(&Cast::new(name("risa"), account())).await.unwrap();
	store.save_channel_id(&name("rival"), ChannelId::new(999)).await.unwrap();
	store.touch_cast_online(&name("risa"), 1_000).await.unwrap();

	let casts = store.load_casts().await.unwrap();
	assert_eq!(casts.len(), 2);
	assert_eq!(casts[0].name.as_str(), "risa");
	assert_eq!(casts[0].channel_id, Some(ChannelId::new(178)));
	assert_eq!(casts[1].source, CastSource::Observed);
	assert_eq!(casts[1].display(), "Rival");
	assert_eq!(casts[1].channel_id, Some(ChannelId::new(999)));
}

#[tokio::test]
async fn sessions_finalize_once_and_orphans_close() {
	let store = sqlite().await;
	let first = SessionRecord {
		id: SessionId::new_v4(),
		cast: name("risa"),
		account_id: account(),
		started_at_ms: 1_000,
	};
	let second = SessionRecord {
		id: SessionId::new_v4(),
		started_at_ms: 2_000,
		..first.clone()
	};
	store.insert_session(&first).await.unwrap();
	store.insert_session(&second).await.unwrap();
	assert!(store.insert_session(&first).await.is_err());

	let totals = SessionAggregates {
		message_count: 3,
		tip_total: 70,
		peak_viewers: 25,
	};
	store.finalize_session(first.id, 5_000, totals).await.unwrap();
	// a second finalize matches nothing and is not an error
	store
		.finalize_session(first.id, 9_000, SessionAggregates::default())
		.await
		.unwrap();

	assert_eq!(store.close_orphan_sessions(10_000).await.unwrap(), 1);
	assert_eq!(store.close_orphan_sessions(11_000).await.unwrap(), 0);
}

#[tokio::test]
async fn event_batches_are_idempotent() {
	let store = sqlite().await;
	let session = SessionId::new_v4();
	let batch = vec![event(session, "hi", 0), event(session, "tip", 50)];

	assert_eq!(store.insert_events_batch(&batch).await.unwrap(), 2);
	assert_eq!(store.insert_events_batch(&batch).await.unwrap(), 0);
	assert_eq!(store.insert_events_batch(&[]).await.unwrap(), 0);

	let mut more = batch.clone();
	more.push(event(session, "again", 0));
	assert_eq!(store.insert_events_batch(&more).await.unwrap(), 1);
	assert_eq!(store.query_event_count(session).await.unwrap(), 3);
	assert_eq!(store.query_event_count(SessionId::new_v4()).await.unwrap(), 0);
}

#[tokio::test]
async fn repeated_tips_in_the_same_instant_all_persist() {
	let store = sqlite().await;
	let session = SessionId::new_v4();
	let tips: Vec<CastEvent> = (0..3)
		.map(|n| CastEvent {
			wire_id: format!("client:{n}"),
			..event(session, "", 10)
		})
		.collect();
	assert_eq!(tips[0].message_time_ms, tips[2].message_time_ms);

	assert_eq!(store.insert_events_batch(&tips).await.unwrap(), 3);
	assert_eq!(store.insert_events_batch(&tips[1..]).await.unwrap(), 0);
	assert_eq!(store.query_event_count(session).await.unwrap(), 3);
}

#[tokio::test]
async fn viewers_payers_and_thumbnails_persist() {
	let store = sqlite().await;
	let session = Some(SessionId::new_v4());
	let viewer = ViewerEntry {
		user_name: "fan".to_string(),
		user_id: Some("42".to_string()),
		league: None,
		level: Some(3),
		is_fan_club: false,
	};
	for at in [1_000, 2_000] {
		store
			.record_viewers(&ViewerSnapshot {
				cast: name("risa"),
				account_id: account(),
				session_id: session,
				taken_at_ms: at,
				viewers: vec![viewer.clone()],
			})
			.await
			.unwrap();
	}
	let (visits,): (i64,) = match &store.backend {
		super::SqlBackend::Sqlite(pool) => {
			sqlx::query_as("SELECT visit_count FROM viewer_snapshots WHERE user_name = 'fan'")
				.fetch_one(pool)
				.await
				.unwrap()
		}
		_ => unreachable!(),
	};
	assert_eq!(visits, 2);

	let payers = vec![
		PayerEntry {
			user_name: "whale".to_string(),
			user_id: Some("7".to_string()),
			total_tokens: 1_000,
			last_paid: Some("2025-01-01".to_string()),
		},
		PayerEntry {
			user_name: "minnow".to_string(),
			user_id: None,
			total_tokens: 5,
			last_paid: None,
		},
	];
	assert_eq!(store.upsert_payers(&account(), &payers).await.unwrap(), 2);
	assert_eq!(store.upsert_payers(&account(), &payers[..1]).await.unwrap(), 1);

	store
		.insert_thumbnail(&ThumbnailRecord {
			cast: name("risa"),
			account_id: account(),
			session_id: session,
			url: "https://img.example/thumbs/178_webp".to_string(),
			captured_at_ms: 3_000,
		})
		.await
		.unwrap();
}
