use chrono::Utc;
use tokio::time::Duration;

use shared::{
    domain::{MessageId, ParticipantId},
    payload::{ReactionAction, WirePayload},
};

use super::support::*;
use crate::{ephemeral_stream_id, SessionEvent};

fn presence_from(sender: &str) -> WirePayload {
    WirePayload::Presence {
        sender: ParticipantId::from(sender),
        timestamp: Utc::now(),
        nickname: Some(sender.trim_start_matches("0x").to_string()),
    }
}

fn reaction_from(sender: &str, action: ReactionAction) -> WirePayload {
    WirePayload::Reaction {
        message_id: MessageId::from("m1"),
        emoji: "👍".to_string(),
        sender: ParticipantId::from(sender),
        action,
        timestamp: Utc::now(),
    }
}

async fn reaction_publishes(transport: &RecordingTransport) -> usize {
    transport
        .published_to(&stream())
        .await
        .iter()
        .filter(|payload| matches!(payload, WirePayload::Reaction { .. }))
        .count()
}

#[tokio::test(start_paused = true)]
async fn heartbeat_fires_immediately_and_then_on_interval_while_active() {
    let (session, transport, _verifier) = session_with_channel().await;
    let ephemeral = ephemeral_stream_id(&stream());

    session.set_active_channel(Some(stream())).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.published_to(&ephemeral).await.len(), 1);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(transport.published_to(&ephemeral).await.len(), 2);

    session.set_active_channel(None).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(transport.published_to(&ephemeral).await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn liveness_expires_after_the_timeout() {
    let (session, _transport, _verifier) = session_with_channel().await;

    session.ingest(stream(), presence_from("0xbob")).await;
    assert_eq!(
        session.online_participants(&stream()).await,
        vec![ParticipantId::from("0xbob")]
    );

    // A few missed beats are tolerated.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(session.online_participants(&stream()).await.len(), 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    assert!(session.online_participants(&stream()).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn online_members_carry_heartbeat_nicknames() {
    let (session, _transport, _verifier) = session_with_channel().await;

    session.ingest(stream(), presence_from("0xbob")).await;

    let members = session.online_members(&stream()).await;
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].id, ParticipantId::from("0xbob"));
    assert_eq!(members[0].nickname.as_deref(), Some("bob"));
}

#[tokio::test(start_paused = true)]
async fn newly_online_participants_emit_a_presence_change() {
    let (session, _transport, _verifier) = session_with_channel().await;
    let mut rx = session.subscribe_events();

    session.ingest(stream(), presence_from("0xbob")).await;
    session.ingest(stream(), presence_from("0xbob")).await;

    let events = drain_events(&mut rx);
    let changes = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::PresenceChanged { .. }))
        .count();
    assert_eq!(changes, 1);
}

#[tokio::test(start_paused = true)]
async fn toggle_reaction_follows_the_add_then_remove_contract() {
    let (session, _transport, _verifier) = session_with_channel().await;
    let message_id = MessageId::from("m1");

    let is_removing = session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("first toggle");
    assert!(!is_removing);

    let reactions = session
        .message_reactions(&stream(), &message_id)
        .await
        .expect("reaction set");
    assert_eq!(
        reactions.get("👍"),
        Some(&vec![ParticipantId::from(LOCAL_IDENTITY)])
    );

    let is_removing = session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("second toggle");
    assert!(is_removing);
    // Empty sets are pruned, not left dangling.
    assert!(session
        .message_reactions(&stream(), &message_id)
        .await
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn rapid_double_toggle_publishes_at_most_once() {
    let (session, transport, _verifier) = session_with_channel().await;
    let message_id = MessageId::from("m1");

    session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("add");
    session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("remove");

    assert_eq!(reaction_publishes(&transport).await, 1);
    // Local state still reflects both toggles.
    assert!(session
        .message_reactions(&stream(), &message_id)
        .await
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn genuine_retoggle_after_the_window_publishes_again() {
    let (session, transport, _verifier) = session_with_channel().await;
    let message_id = MessageId::from("m1");

    session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("add");
    tokio::time::sleep(Duration::from_millis(600)).await;
    session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("remove");

    assert_eq!(reaction_publishes(&transport).await, 2);
}

#[tokio::test(start_paused = true)]
async fn remote_reactions_merge_idempotently() {
    let (session, _transport, _verifier) = session_with_channel().await;
    let mut rx = session.subscribe_events();

    session
        .ingest(stream(), reaction_from("0xalice", ReactionAction::Add))
        .await;
    session
        .ingest(stream(), reaction_from("0xalice", ReactionAction::Add))
        .await;

    let reactions = session
        .message_reactions(&stream(), &MessageId::from("m1"))
        .await
        .expect("reaction set");
    assert_eq!(
        reactions.get("👍"),
        Some(&vec![ParticipantId::from("0xalice")])
    );

    // The no-op second merge emits nothing.
    let events = drain_events(&mut rx);
    let reaction_events = events
        .iter()
        .filter(|e| matches!(e, SessionEvent::Reaction { .. }))
        .count();
    assert_eq!(reaction_events, 1);

    session
        .ingest(stream(), reaction_from("0xalice", ReactionAction::Remove))
        .await;
    assert!(session
        .message_reactions(&stream(), &MessageId::from("m1"))
        .await
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn own_reaction_echo_inside_the_window_is_ignored() {
    let (session, _transport, _verifier) = session_with_channel().await;
    let message_id = MessageId::from("m1");

    session
        .toggle_reaction(&stream(), &message_id, "👍")
        .await
        .expect("add");
    let mut rx = session.subscribe_events();

    session
        .ingest(stream(), reaction_from(LOCAL_IDENTITY, ReactionAction::Add))
        .await;

    let reactions = session
        .message_reactions(&stream(), &message_id)
        .await
        .expect("reaction set");
    assert_eq!(
        reactions.get("👍"),
        Some(&vec![ParticipantId::from(LOCAL_IDENTITY)])
    );
    assert!(drain_events(&mut rx)
        .iter()
        .all(|e| !matches!(e, SessionEvent::Reaction { .. })));
}
