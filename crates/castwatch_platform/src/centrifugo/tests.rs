#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use castwatch_domain::{AccountId, Cast, CastName, ChannelId, EventKind, SessionId};
use parking_lot::Mutex;
use proptest::prelude::*;
use serde_json::json;

use super::buffer::{EventBuffer, flush};
use super::chat::{classify_tip, model_event_type, parse_chat, system_event};
use super::frames::{InboundFrame, channel_base, connect_command, decode_payload, parse_frame, split_frames, subscribe_command};
use super::{ChannelKind, DEFAULT_CHANNELS, subscription_set};
use crate::{
	CastEvent, PayerEntry, SessionAggregates, SessionRecord, Store, ThumbnailRecord, ViewerSnapshot,
};

fn cast() -> CastName {
	CastName::new("risa").expect("cast")
}

fn account() -> AccountId {
	AccountId::new("acc-1").expect("account")
}

fn chat_event(n: usize) -> CastEvent {
	CastEvent {
		wire_id: format!("test:{n}"),
		cast: cast(),
		account_id: account(),
		session_id: None,
		message_time_ms: 1_700_000_000_000 + n as i64,
		kind: EventKind::Chat,
		user_name: format!("user{n}"),
		user_id: None,
		body: format!("msg {n}"),
		tokens: 0,
		is_vip: false,
		user_league: None,
		user_level: None,
		metadata: serde_json::Value::Null,
	}
}

/// Store that records event batches and fails the next `fail_batches` calls.
#[derive(Default)]
struct RecordingStore {
	events: Mutex<Vec<CastEvent>>,
	fail_batches: AtomicUsize,
	calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Store for RecordingStore {
	async fn insert_session(&self, _session: &SessionRecord) -> anyhow::Result<()> {
		Ok(())
	}

	async fn finalize_session(&self, _id: SessionId, _ended_at_ms: i64, _aggregates: SessionAggregates) -> anyhow::Result<()> {
		Ok(())
	}

	async fn insert_events_batch(&self, events: &[CastEvent]) -> anyhow::Result<u64> {
		self.calls.fetch_add(1, Ordering::SeqCst);
		if self
			.fail_batches
			.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
			.is_ok()
		{
			anyhow::bail!("store unavailable");
		}
		self.events.lock().extend_from_slice(events);
		Ok(events.len() as u64)
	}

	async fn query_event_count(&self, _id: SessionId) -> anyhow::Result<u64> {
		Ok(self.events.lock().len() as u64)
	}

	async fn load_casts(&self) -> anyhow::Result<Vec<Cast>> {
		Ok(Vec::new())
	}

	async fn upsert_cast(&self, _cast: &Cast) -> anyhow::Result<()> {
		Ok(())
	}

	async fn save_channel_id(&self, _cast: &CastName, _channel_id: ChannelId) -> anyhow::Result<()> {
		Ok(())
	}

	async fn touch_cast_online(&self, _cast: &CastName, _at_ms: i64) -> anyhow::Result<()> {
		Ok(())
	}

	async fn close_orphan_sessions(&self, _ended_at_ms: i64) -> anyhow::Result<u64> {
		Ok(0)
	}

	async fn record_viewers(&self, _snapshot: &ViewerSnapshot) -> anyhow::Result<()> {
		Ok(())
	}

	async fn upsert_payers(&self, _account: &AccountId, payers: &[PayerEntry]) -> anyhow::Result<u64> {
		Ok(payers.len() as u64)
	}

	async fn insert_thumbnail(&self, _thumbnail: &ThumbnailRecord) -> anyhow::Result<()> {
		Ok(())
	}
}

#[test]
fn splits_concatenated_replies() {
	let payload = r#"{"id":1,"connect":{"client":"abc"}}{"id":2,"subscribe":{"channel":"chat@123"}}"#;
	let parts = split_frames(payload);
	assert_eq!(parts.len(), 2);

	let frames = decode_payload(payload);
	assert_eq!(
		frames[0],
		InboundFrame::Connected {
			id: Some(1),
			client: Some("abc".to_string())
		}
	);
	assert_eq!(frames[1], InboundFrame::Subscribed { id: Some(2) });
}

#[test]
fn splits_whitespace_and_newline_joined_frames() {
	let payload = "{\"id\":1,\"subscribe\":{}}\n  {\"id\":2,\"subscribe\":{}}\n";
	assert_eq!(split_frames(payload).len(), 2);
}

#[test]
fn braces_inside_strings_do_not_split() {
	let payload = r#"{"push":{"channel":"newChatMessage@1","pub":{"data":{"body":"}{ \"x\" {"}}}}{"id":3,"subscribe":{}}"#;
	let frames = decode_payload(payload);
	assert_eq!(frames.len(), 2);
	assert!(matches!(frames[0], InboundFrame::Push { .. }));
}

#[test]
fn trailing_malformed_fragment_keeps_leading_frames() {
	let payload = r#"{"id":1,"subscribe":{}}{"id":2,"subscribe":{}}{"id":3,"subsc"#;
	let frames = decode_payload(payload);
	assert_eq!(frames.len(), 2);

	let payload = r#"{"id":1,"subscribe":{}}{not json}"#;
	assert_eq!(decode_payload(payload).len(), 1);
}

#[test]
fn classifies_frame_shapes() {
	assert_eq!(parse_frame("{}").unwrap(), InboundFrame::Keepalive);
	assert_eq!(
		parse_frame(r#"{"id":1,"error":{"code":3501,"message":"invalid token"}}"#).unwrap(),
		InboundFrame::Error {
			id: Some(1),
			code: 3501,
			message: "invalid token".to_string()
		}
	);
	assert_eq!(
		parse_frame(r#"{"push":{"channel":"newModelEvent@9","pub":{"data":{"event":"goal"}}}}"#).unwrap(),
		InboundFrame::Push {
			channel: "newModelEvent@9".to_string(),
			data: json!({"event": "goal"})
		}
	);
	assert_eq!(parse_frame(r#"{"push":{"channel":"x@1","join":{}}}"#).unwrap(), InboundFrame::Other);
	assert!(parse_frame(r#"{"id":"#).is_err());
}

#[test]
fn commands_have_expected_shape() {
	let connect: serde_json::Value = serde_json::from_str(&connect_command(1, "jwt").unwrap()).unwrap();
	assert_eq!(connect, json!({"id": 1, "connect": {"token": "jwt", "name": "js"}}));

	let sub: serde_json::Value = serde_json::from_str(&subscribe_command(2, "newChatMessage@5").unwrap()).unwrap();
	assert_eq!(sub, json!({"id": 2, "subscribe": {"channel": "newChatMessage@5"}}));
}

#[test]
fn subscription_set_is_scoped_by_channel_id() {
	let set = subscription_set(&DEFAULT_CHANNELS[..], ChannelId::new(178845750));
	assert_eq!(
		set,
		vec![
			"newChatMessage@178845750",
			"newModelEvent@178845750",
			"clearChatMessages@178845750",
			"userUpdated@178845750",
		]
	);
	assert_eq!(ChannelKind::from_base(channel_base(&set[0])), ChannelKind::Chat);
	assert_eq!(ChannelKind::from_base(channel_base("userUpdated")), ChannelKind::UserUpdated);
	assert_eq!(ChannelKind::from_base("somethingElse"), ChannelKind::Unknown);
}

#[test]
fn tip_classification() {
	assert_eq!(classify_tip(0, ""), EventKind::Chat);
	assert_eq!(classify_tip(0, "text"), EventKind::Chat);
	assert_eq!(classify_tip(50, ""), EventKind::Tip);
	assert_eq!(classify_tip(0, "tip"), EventKind::Tip);
}

#[test]
fn parses_tip_with_enrichment() {
	let data = json!({
		"message": {
			"type": "tip",
			"createdAt": "2026-01-02T03:04:05Z",
			"userData": {
				"id": 42,
				"username": "bigfan",
				"isModel": false,
				"userRanking": {"league": "gold", "level": 17}
			},
			"details": {"body": "", "amount": "1500", "fanClubNumberMonthsOfSubscribed": 2},
			"additionalData": {"isKing": false, "isKnight": true}
		}
	});
	let chat = parse_chat(&data).unwrap();
	assert_eq!(chat.kind, EventKind::Tip);
	assert_eq!(chat.tokens, 1500);
	assert_eq!(chat.user_name, "bigfan");
	assert_eq!(chat.user_id.as_deref(), Some("42"));
	assert_eq!(chat.league.as_deref(), Some("gold"));
	assert_eq!(chat.level, Some(17));
	assert!(chat.is_fan_club);
	assert!(chat.is_knight);
	assert!(chat.is_vip);
	assert_eq!(chat.created_at_ms, Some(1_767_323_045_000));

	let event = chat.into_event(&cast(), &account(), None, "newChatMessage", 1, "client:0".to_string());
	assert_eq!(event.message_time_ms, 1_767_323_045_000);
	assert_eq!(event.wire_id, "client:0");
	assert_eq!(event.metadata["isKnight"], json!(true));
	assert_eq!(event.metadata["providerUserId"], json!("42"));
}

#[test]
fn parses_plain_chat_with_defaults() {
	let data = json!({
		"message": {
			"type": "text",
			"userData": {"screenName": "quiet", "userRanking": null},
			"details": {"text": "hello"},
			"additionalData": null
		}
	});
	let chat = parse_chat(&data).unwrap();
	assert_eq!(chat.kind, EventKind::Chat);
	assert_eq!(chat.user_name, "quiet");
	assert_eq!(chat.body, "hello");
	assert_eq!(chat.tokens, 0);
	assert_eq!(chat.level, None);
	assert!(!chat.is_vip);
	assert!(!chat.is_fan_club);
	assert_eq!(chat.created_at_ms, None);

	let event = chat.into_event(&cast(), &account(), None, "newChatMessage", 77, "client:1".to_string());
	assert_eq!(event.message_time_ms, 77);
}

#[test]
fn rejects_chat_without_sender_or_message() {
	assert!(parse_chat(&json!({"message": {"details": {"body": "x"}}})).is_err());
	assert!(parse_chat(&json!({"foo": 1})).is_err());
	assert!(parse_chat(&json!("string")).is_err());
}

#[test]
fn model_event_type_fallbacks() {
	assert_eq!(model_event_type(&json!({"event": "goalReached"})), "goalReached");
	assert_eq!(model_event_type(&json!({"type": "statusChanged"})), "statusChanged");
	assert_eq!(model_event_type(&json!({"other": 1})), "unknown");
	assert_eq!(model_event_type(&json!(null)), "unknown");

	let sys = system_event(
		"goalReached".to_string(),
		&cast(),
		&account(),
		None,
		"newModelEvent",
		5,
		"client:2".to_string(),
	);
	assert_eq!(sys.kind, EventKind::System);
	assert_eq!(sys.body, "goalReached");
	assert_eq!(sys.tokens, 0);
}

#[tokio::test]
async fn failed_flush_requeues_events_ahead_of_new_ones() {
	let store = RecordingStore::default();
	store.fail_batches.store(1, Ordering::SeqCst);
	let buffer = EventBuffer::new();
	for n in 0..3 {
		buffer.push(chat_event(n));
	}

	let outcome = flush(&buffer, &store, 500).await;
	assert_eq!(outcome.taken, 3);
	assert_eq!(outcome.requeued, 3);
	assert_eq!(buffer.len(), 3);

	buffer.push(chat_event(3));
	let outcome = flush(&buffer, &store, 500).await;
	assert_eq!(outcome.persisted, 4);
	assert!(buffer.is_empty());

	let stored = store.events.lock();
	let names: Vec<_> = stored.iter().map(|e| e.user_name.as_str()).collect();
	assert_eq!(names, vec!["user0", "user1", "user2", "user3"]);
}

#[tokio::test]
async fn flush_requeues_only_unpersisted_chunks() {
	let store = Arc::new(RecordingStore::default());
	let buffer = EventBuffer::new();
	for n in 0..5 {
		buffer.push(chat_event(n));
	}

	let first = flush(&buffer, store.as_ref(), 2).await;
	assert_eq!(first.persisted, 5);
	assert_eq!(store.calls.load(Ordering::SeqCst), 3);

	for n in 5..10 {
		buffer.push(chat_event(n));
	}
	struct FailSecond(Arc<RecordingStore>, AtomicUsize);
	#[async_trait::async_trait]
	impl Store for FailSecond {
		async fn insert_session(&self, s: &SessionRecord) -> anyhow::Result<()> {
			self.0.insert_session(s).await
		}
		async fn finalize_session(&self, id: SessionId, at: i64, a: SessionAggregates) -> anyhow::Result<()> {
			self.0.finalize_session(id, at, a).await
		}
		async fn insert_events_batch(&self, events: &[CastEvent]) -> anyhow::Result<u64> {
			if self.1.fetch_add(1, Ordering::SeqCst) == 1 {
				anyhow::bail!("second chunk rejected");
			}
			self.0.insert_events_batch(events).await
		}
		async fn query_event_count(&self, id: SessionId) -> anyhow::Result<u64> {
			self.0.query_event_count(id).await
		}
		async fn load_casts(&self) -> anyhow::Result<Vec<Cast>> {
			self.0.load_casts().await
		}
		async fn upsert_cast(&self, c: &Cast) -> anyhow::Result<()> {
			self.0.upsert_cast(c).await
		}
		async fn save_channel_id(&self, c: &CastName, id: ChannelId) -> anyhow::Result<()> {
			self.0.save_channel_id(c, id).await
		}
		async fn touch_cast_online(&self, c: &CastName, at: i64) -> anyhow::Result<()> {
			self.0.touch_cast_online(c, at).await
		}
		async fn close_orphan_sessions(&self, at: i64) -> anyhow::Result<u64> {
			self.0.close_orphan_sessions(at).await
		}
		async fn record_viewers(&self, s: &ViewerSnapshot) -> anyhow::Result<()> {
			self.0.record_viewers(s).await
		}
		async fn upsert_payers(&self, a: &AccountId, p: &[PayerEntry]) -> anyhow::Result<u64> {
			self.0.upsert_payers(a, p).await
		}
		async fn insert_thumbnail(&self, t: &ThumbnailRecord) -> anyhow::Result<()> {
			self.0.insert_thumbnail(t).await
		}
	}

	let failing = FailSecond(store.clone(), AtomicUsize::new(0));
	let outcome = flush(&buffer, &failing, 2).await;
	assert_eq!(outcome.taken, 5);
	assert_eq!(outcome.persisted, 2);
	assert_eq!(outcome.requeued, 3);

	let left: Vec<_> = buffer.take().into_iter().map(|e| e.user_name).collect();
	assert_eq!(left, vec!["user7", "user8", "user9"]);
}

proptest! {
	#[test]
	fn split_recovers_every_concatenated_object(
		ids in proptest::collection::vec(0u64..1_000_000, 1..8),
		seps in proptest::collection::vec(prop_oneof![Just(""), Just(" "), Just("\n"), Just("\r\n  ")], 8),
		bodies in proptest::collection::vec("[a-z{}\" ]{0,12}", 8),
	) {
		let mut payload = String::new();
		for (i, id) in ids.iter().enumerate() {
			let obj = json!({"id": id, "push": {"channel": "c@1", "pub": {"data": {"body": bodies[i]}}}});
			payload.push_str(&obj.to_string());
			payload.push_str(seps[i]);
		}

		let frames = decode_payload(&payload);
		prop_assert_eq!(frames.len(), ids.len());
		for (frame, body) in frames.iter().zip(bodies.iter()) {
			match frame {
				InboundFrame::Push { data, .. } => prop_assert_eq!(&data["body"], &json!(body)),
				other => prop_assert!(false, "unexpected frame {:?}", other),
			}
		}
	}

	#[test]
	fn split_never_panics_on_arbitrary_text(s in "\\PC{0,64}") {
		let _ = decode_payload(&s);
	}
}
