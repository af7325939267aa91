mod common;

use common::{count_kind, Client, Fleet};
use realtime_relay_service::websocket::message_types::{ClientFrame, ServerFrame};

#[tokio::test]
async fn two_tabs_announce_online_once_and_offline_after_last() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut watcher = Client::connect(&p2, &bob).await;

    let mut tab1 = Client::connect(&p1, &alice).await;
    let mut tab2 = Client::connect(&p1, &alice).await;
    let frames = watcher.frames().await;
    assert_eq!(
        frames,
        vec![ServerFrame::UserOnline {
            user_id: alice.id,
            username: "alice".into()
        }]
    );

    tab1.close().await;
    assert!(watcher.frames().await.is_empty());
    assert!(p1.presence.is_online(alice.id).await.unwrap());

    tab2.close().await;
    let frames = watcher.frames().await;
    assert_eq!(count_kind(&frames, "user_offline"), 1);
    match &frames[0] {
        ServerFrame::UserOffline {
            user_id, username, ..
        } => {
            assert_eq!(*user_id, alice.id);
            assert_eq!(username, "alice");
        }
        other => panic!("unexpected frame {other:?}"),
    }
    assert!(!p1.presence.is_online(alice.id).await.unwrap());
    assert!(p1.presence.last_seen(alice.id).await.unwrap().is_some());
}

#[tokio::test]
async fn tabs_on_different_processes_share_fleet_presence() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut watcher = Client::connect(&p1, &bob).await;
    let mut on_p1 = Client::connect(&p1, &alice).await;
    let mut on_p2 = Client::connect(&p2, &alice).await;
    assert_eq!(count_kind(&watcher.frames().await, "user_online"), 1);

    // Last local tab on P1 goes, but alice is still online through P2.
    on_p1.close().await;
    assert!(watcher.frames().await.is_empty());

    on_p2.close().await;
    assert_eq!(count_kind(&watcher.frames().await, "user_offline"), 1);
}

#[tokio::test]
async fn hidden_users_are_never_announced() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    fleet.directory.add_conversation(&[alice.id, bob.id]);
    fleet.directory.set_status_hidden(alice.id, true);

    let mut watcher = Client::connect(&p1, &bob).await;
    let mut hidden = Client::connect(&p1, &alice).await;
    hidden.close().await;

    assert!(watcher.frames().await.is_empty());
}

#[tokio::test]
async fn hidden_partners_receive_no_status_broadcasts() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    fleet.directory.add_conversation(&[alice.id, bob.id]);
    fleet.directory.set_status_hidden(bob.id, true);

    let mut hidden_watcher = Client::connect(&p1, &bob).await;
    let mut alice_tab = Client::connect(&p1, &alice).await;
    alice_tab.close().await;

    assert!(hidden_watcher.frames().await.is_empty());
}

#[tokio::test]
async fn status_query_applies_privacy_gate() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");

    let _alice_tab = Client::connect(&p1, &alice).await;

    let seen = p1
        .presence
        .status_for(fleet.directory.as_ref(), Some(bob.id), alice.id)
        .await
        .unwrap();
    assert!(seen.online);
    assert!(seen.last_seen_at.is_none());

    fleet.directory.set_status_hidden(alice.id, true);
    let seen = p1
        .presence
        .status_for(fleet.directory.as_ref(), Some(bob.id), alice.id)
        .await
        .unwrap();
    assert!(!seen.online);
    assert!(seen.last_seen_at.is_none());
}

#[tokio::test]
async fn viewing_pointer_tracks_latest_join_across_tabs() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let first = fleet.directory.add_conversation(&[alice.id, bob.id]);
    let second = fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut tab1 = Client::connect(&p1, &alice).await;
    let mut tab2 = Client::connect(&p2, &alice).await;
    tab1.join(first).await;
    tab2.join(second).await;
    assert!(p1.presence.is_viewing(alice.id, second).await.unwrap());

    // Closing the tab on the older conversation leaves the newer pointer.
    tab1.close().await;
    assert!(p2.presence.is_viewing(alice.id, second).await.unwrap());

    tab2.close().await;
    assert!(!p2.presence.is_viewing(alice.id, second).await.unwrap());
}

#[tokio::test]
async fn leaving_one_tab_keeps_viewing_pointer() {
    let fleet = Fleet::new();
    let p1 = fleet.process();
    let p2 = fleet.process();
    let alice = fleet.user("alice");
    let bob = fleet.user("bob");
    let conversation = fleet.directory.add_conversation(&[alice.id, bob.id]);

    let mut tab1 = Client::connect(&p1, &alice).await;
    let mut tab2 = Client::connect(&p1, &alice).await;
    let mut tab3 = Client::connect(&p2, &alice).await;
    tab1.join(conversation).await;
    tab2.join(conversation).await;
    tab3.join(conversation).await;
    // Re-joining the same conversation does not count the tab twice.
    tab3.join(conversation).await;

    tab1.send(ClientFrame::Leave).await;
    assert!(p1.presence.is_viewing(alice.id, conversation).await.unwrap());

    tab2.close().await;
    assert!(p2.presence.is_viewing(alice.id, conversation).await.unwrap());

    tab3.send(ClientFrame::Leave).await;
    assert!(!p2.presence.is_viewing(alice.id, conversation).await.unwrap());
}
