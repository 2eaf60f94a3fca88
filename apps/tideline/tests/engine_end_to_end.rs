//! Whole-engine runs against the in-process server: real websocket
//! dialer, real HTTP api, both delivery paths feeding one store.

mod support;

use std::time::Duration;

use tideline_core::api::ApiError;
use tideline_core::client::SyncClient;
use tideline_core::config::SyncTuning;
use tideline_core::proto::{ChannelId, ClientFrame, ConversationScope};
use tideline_core::sync::ConnectionHealth;

use support::TestServer;

fn fast_tuning() -> SyncTuning {
    SyncTuning {
        poll_interval: Duration::from_millis(100),
        poll_request_timeout: Duration::from_millis(500),
        typing_window: Duration::from_millis(150),
        typing_debounce: Duration::from_millis(100),
        handshake_timeout: Duration::from_secs(2),
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        ..SyncTuning::default()
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    while !check() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn client_for(server: &TestServer) -> SyncClient {
    let client = SyncClient::connect(&server.config(), fast_tuning()).expect("client");
    let mut health = client.health();
    health
        .wait_for(|h| *h == ConnectionHealth::Online)
        .await
        .expect("health channel closed");
    client
}

#[test_deadline::deadline(20)]
async fn select_seeds_and_push_extends_the_view() {
    let server = TestServer::start().await;
    let scope = server.state.seed_channel("c-general", "general");
    for n in 0..3 {
        server
            .state
            .insert_silently(&scope, "u-other", &format!("backlog {n}"));
    }
    let client = client_for(&server).await;

    client.select(scope.clone()).await.expect("select");
    let view = client.active_view().expect("active view");
    assert_eq!(view.messages.len(), 3);
    assert_eq!(view.messages[0].body, "backlog 0");

    server.state.insert_and_push(&scope, "u-other", "fresh");
    wait_until(|| client.active_view().unwrap().messages.len() == 4).await;
    let view = client.active_view().unwrap();
    assert_eq!(view.messages.last().unwrap().body, "fresh");

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn selection_is_guarded_by_the_server() {
    let server = TestServer::start().await;
    let sealed = server.state.seed_channel("c-sealed", "sealed");
    server.state.forbid(sealed.clone());
    let client = client_for(&server).await;

    let missing = ConversationScope::Channel(ChannelId("c-missing".to_string()));
    assert!(matches!(
        client.select(missing).await,
        Err(ApiError::NotFound)
    ));
    assert!(matches!(
        client.select(sealed).await,
        Err(ApiError::Forbidden)
    ));
    assert!(client.active_view().is_none());

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn poller_repairs_a_silently_missed_push() {
    let server = TestServer::start().await;
    let scope = server.state.seed_channel("c-general", "general");
    let client = client_for(&server).await;
    client.select(scope.clone()).await.expect("select");

    // Never broadcast: only the pull path can learn about this message.
    server.state.insert_silently(&scope, "u-other", "dropped by push");
    wait_until(|| client.active_view().unwrap().messages.len() == 1).await;

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn remote_typing_shows_and_expires_without_a_stop() {
    let server = TestServer::start().await;
    let scope = server.state.seed_channel("c-general", "general");
    let client = client_for(&server).await;
    client.select(scope.clone()).await.expect("select");

    server.state.push_typing(&scope, "u-other", "Avery", true);
    wait_until(|| !client.active_view().unwrap().typists.is_empty()).await;
    assert_eq!(client.active_view().unwrap().typists[0].display_name, "Avery");

    // No stop signal; the window alone clears it.
    wait_until(|| client.active_view().unwrap().typists.is_empty()).await;

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn switching_scopes_keeps_background_updates_out_of_the_view() {
    let server = TestServer::start().await;
    let first = server.state.seed_channel("c-first", "first");
    let second = server.state.seed_channel("c-second", "second");
    server.state.insert_silently(&first, "u-other", "old news");
    let client = client_for(&server).await;

    client.select(first.clone()).await.expect("select first");
    client.open_thread(client.active_view().unwrap().messages[0].id.clone())
        .expect("open thread");
    client.select(second.clone()).await.expect("select second");

    // Thread view died with the switch.
    assert_eq!(client.active_view().unwrap().thread, None);

    // A push for the background conversation updates its log and its
    // unread count, never the active view.
    server.state.insert_and_push(&first, "u-other", "while you were away");
    wait_until(|| client.conversation_snapshot(&first).messages.len() == 2).await;
    assert!(client.active_view().unwrap().messages.is_empty());
    assert_eq!(client.conversation_snapshot(&first).unread, 1);

    // Re-selecting clears the unread counter.
    client.select(first.clone()).await.expect("reselect");
    assert_eq!(client.conversation_snapshot(&first).unread, 0);

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn mutations_roundtrip_and_deduplicate_against_echoes() {
    let server = TestServer::start().await;
    let scope = server.state.seed_channel("c-general", "general");
    let client = client_for(&server).await;
    client.select(scope.clone()).await.expect("select");

    let sent = client
        .send_message(&scope, "hello", None)
        .await
        .expect("send");
    // The push echo of our own send must not duplicate the ack insert.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.active_view().unwrap().messages.len(), 1);

    let edited = client
        .edit_message(&scope, &sent.id, "hello, edited")
        .await
        .expect("edit");
    assert_eq!(edited.body, "hello, edited");
    wait_until(|| {
        client.active_view().unwrap().messages[0].body == "hello, edited"
    })
    .await;

    let reacted = client
        .add_reaction(&scope, &sent.id, "👍")
        .await
        .expect("react");
    assert_eq!(reacted.reactions.len(), 1);

    client.delete_message(&scope, &sent.id).await.expect("delete");
    assert!(client.active_view().unwrap().messages.is_empty());
    // Survives the poll tick too: the server really deleted it.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(client.active_view().unwrap().messages.is_empty());

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn failed_edit_rolls_back_the_optimistic_copy() {
    let server = TestServer::start().await;
    let scope = server.state.seed_channel("c-general", "general");
    let client = client_for(&server).await;
    client.select(scope.clone()).await.expect("select");

    let sent = client
        .send_message(&scope, "original", None)
        .await
        .expect("send");

    // Delete server-side behind the client's back; the edit will 404.
    server
        .state
        .insert_silently(&scope, "u-other", "keep the poll busy");
    let api = tideline_core::api::HttpApi::new(&server.config());
    use tideline_core::api::ConversationApi;
    api.delete_message(&scope, &sent.id).await.expect("delete");

    let err = client
        .edit_message(&scope, &sent.id, "never lands")
        .await
        .expect_err("edit should fail");
    assert!(matches!(err, ApiError::NotFound));
    // Rolled back, not left showing the optimistic body.
    let resident = client
        .active_view()
        .unwrap()
        .messages
        .iter()
        .find(|m| m.id == sent.id)
        .cloned();
    if let Some(resident) = resident {
        assert_eq!(resident.body, "original");
    }

    client.shutdown().await;
}

#[test_deadline::deadline(20)]
async fn local_typing_is_debounced_and_stopped_explicitly() {
    let server = TestServer::start().await;
    let scope = server.state.seed_channel("c-general", "general");
    let client = client_for(&server).await;
    client.select(scope.clone()).await.expect("select");

    client.notify_typing();
    client.notify_typing();
    client.notify_typing();
    wait_until(|| !server.state.typing_frames().is_empty()).await;
    // Three keystrokes inside one debounce window: one refresh frame.
    assert_eq!(server.state.typing_frames().len(), 1);
    assert!(matches!(
        &server.state.typing_frames()[0],
        ClientFrame::Typing { is_typing: true, .. }
    ));

    client.notify_stopped();
    wait_until(|| server.state.typing_frames().len() == 2).await;
    assert!(matches!(
        &server.state.typing_frames()[1],
        ClientFrame::Typing { is_typing: false, .. }
    ));

    client.shutdown().await;
}
