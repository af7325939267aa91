mod common;

use common::{count_kind, settle, Client, Fleet};
use realtime_relay_service::broker::Topic;
use realtime_relay_service::websocket::message_types::ServerFrame;
use serde_json::json;

fn chat_message(conversation_id: uuid::Uuid, body: &str) -> ServerFrame {
    ServerFrame::NewMessage {
        conversation_id,
        message: json!({ "body": body }),
    }
}

#[tokio::test]
async fn new_message_reaches_remote_participant_exactly_once() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let conversation = fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut a = Client::connect(&p1, &alice).await;
    let mut b = Client::connect(&p2, &bob).await;
    a.join(conversation).await;
    b.join(conversation).await;

    // Bob's message is stored by the CRUD layer talking to P2.
    p2.registry
        .broadcast_to_conversation(conversation, chat_message(conversation, "hi"), None)
        .await;

    let a_frames = a.frames().await;
    let b_frames = b.frames().await;
    assert_eq!(a_frames, vec![chat_message(conversation, "hi")]);
    assert_eq!(b_frames, vec![chat_message(conversation, "hi")]);
}

#[tokio::test]
async fn every_tab_on_every_process_gets_one_copy() {
    let fleet = Fleet::new();
    let processes = [fleet.process(), fleet.process(), fleet.process()];
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let conversation = fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut tabs = Vec::new();
    for (i, process) in processes.iter().enumerate() {
        for user in [&alice, &bob] {
            let mut tab = Client::connect(process, user).await;
            tab.join(conversation).await;
            tabs.push((i, tab));
        }
    }
    // Drain presence chatter from the connects.
    for (_, tab) in tabs.iter_mut() {
        tab.frames().await;
    }

    processes[1]
        .registry
        .broadcast_to_conversation(conversation, chat_message(conversation, "x"), None)
        .await;

    for (_, tab) in tabs.iter_mut() {
        let frames = tab.frames().await;
        assert_eq!(count_kind(&frames, "new_message"), 1);
    }
}

#[tokio::test]
async fn exclusion_applies_on_every_process() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let conversation = fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut a1 = Client::connect(&p1, &alice).await;
    let mut a2 = Client::connect(&p2, &alice).await;
    let mut b = Client::connect(&p2, &bob).await;
    for client in [&mut a1, &mut a2, &mut b] {
        client.join(conversation).await;
        client.frames().await;
    }

    p1.registry
        .broadcast_to_conversation(
            conversation,
            chat_message(conversation, "from alice"),
            Some(alice.id),
        )
        .await;

    assert!(a1.frames().await.is_empty());
    assert!(a2.frames().await.is_empty());
    assert_eq!(count_kind(&b.frames().await, "new_message"), 1);
}

#[tokio::test]
async fn direct_events_follow_the_user_across_processes() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");

    let mut on_p1 = Client::connect(&p1, &alice).await;
    let mut on_p2 = Client::connect(&p2, &alice).await;

    p2.registry
        .broadcast_to_user(alice.id, ServerFrame::error("ping"))
        .await;

    assert_eq!(on_p1.frames().await, vec![ServerFrame::error("ping")]);
    assert_eq!(on_p2.frames().await, vec![ServerFrame::error("ping")]);
}

#[tokio::test]
async fn conversation_topic_is_reference_counted() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let conversation = fleet.directory.add_conversation(&[alice.id, bob.id]);
    let topic = Topic::Conversation(conversation).to_string();

    let mut clients = vec![
        Client::connect(&p1, &alice).await,
        Client::connect(&p1, &alice).await,
        Client::connect(&p1, &bob).await,
    ];
    for client in clients.iter_mut() {
        client.join(conversation).await;
    }
    assert_eq!(fleet.hub.subscriber_count(&topic), 1);
    assert_eq!(p1.registry.conversation_connection_count(conversation).await, 3);

    clients[0]
        .send(realtime_relay_service::websocket::message_types::ClientFrame::Leave)
        .await;
    clients[1].close().await;
    assert_eq!(fleet.hub.subscriber_count(&topic), 1);

    clients[2].close().await;
    assert_eq!(fleet.hub.subscriber_count(&topic), 0);
    assert_eq!(p1.registry.conversation_connection_count(conversation).await, 0);
}

#[tokio::test]
async fn joining_another_conversation_stops_delivery_from_the_first() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let first = fleet.directory.add_conversation(&[alice.id, bob.id]);
    let second = fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut a = Client::connect(&p1, &alice).await;
    a.join(first).await;
    a.join(second).await;
    assert_eq!(
        fleet.hub.subscriber_count(&Topic::Conversation(first).to_string()),
        0
    );

    p2.registry
        .broadcast_to_conversation(first, chat_message(first, "old"), None)
        .await;
    p2.registry
        .broadcast_to_conversation(second, chat_message(second, "new"), None)
        .await;

    assert_eq!(a.frames().await, vec![chat_message(second, "new")]);
}

#[tokio::test]
async fn broker_outage_keeps_local_delivery() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let carol = fleet.user("carol");
    let conversation = fleet
        .directory
        .add_conversation(&[alice.id, bob.id, carol.id]);

    let mut a = Client::connect(&p1, &alice).await;
    let mut b = Client::connect(&p1, &bob).await;
    let mut c = Client::connect(&p2, &carol).await;
    for client in [&mut a, &mut b, &mut c] {
        client.join(conversation).await;
        client.frames().await;
    }

    fleet.hub.set_unavailable(true);
    p1.registry
        .broadcast_to_conversation(conversation, chat_message(conversation, "local"), None)
        .await;
    settle().await;

    assert_eq!(count_kind(&a.frames().await, "new_message"), 1);
    assert_eq!(count_kind(&b.frames().await, "new_message"), 1);
    assert!(c.frames().await.is_empty());

    fleet.hub.set_unavailable(false);
    p1.registry
        .broadcast_to_conversation(conversation, chat_message(conversation, "back"), None)
        .await;
    assert_eq!(count_kind(&c.frames().await, "new_message"), 1);
}
