//! # Messaging Integration Tests
//!
//! Several engine instances share one `InMemoryStore`, standing in for nodes
//! sharing a database.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{counting_listener, node, node_with_config, test_config, wait_until, SETTLE};
use docbus::constants::{keys, STATUS_INFO_TOPIC};
use docbus::messaging::Rejection;
use docbus::{
    listener_fn, Disposition, InMemoryStore, MessageStore, MessagingError, MessagingRegistry, Msg,
};

#[tokio::test]
async fn test_exclusive_message_is_processed_by_exactly_one_node() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for id in ["node-b", "node-c", "node-d"] {
        let worker = node(&store, id);
        worker.add_listener_for_topic("ping", counting_listener(&calls));
        worker.start().await.unwrap();
        workers.push(worker);
    }

    let sender = node(&store, "node-a");
    sender.start().await.unwrap();
    let msg = Msg::builder("ping").exclusive(true).ttl(5_000).build();
    let id = sender.send_message(msg).await.unwrap();

    assert!(
        wait_until(SETTLE, || {
            store
                .message("msg", id)
                .map(|m| !m.processed_by.is_empty())
                .unwrap_or(false)
        })
        .await
    );
    // Give the losing nodes time to (not) process it
    tokio::time::sleep(Duration::from_millis(200)).await;

    let processed_by = store.message("msg", id).unwrap().processed_by;
    assert_eq!(processed_by.len(), 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.lock_count("msg"), 0);

    for worker in workers {
        worker.terminate().await.unwrap();
    }
    sender.terminate().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reaches_every_interested_node() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let mut workers = Vec::new();
    for id in ["node-b", "node-c", "node-d"] {
        let worker = node(&store, id);
        worker.add_listener_for_topic("sync", counting_listener(&calls));
        worker.start().await.unwrap();
        workers.push(worker);
    }
    // Not interested in the topic
    let bystander = node(&store, "node-e");
    bystander.start().await.unwrap();

    let sender = node(&store, "node-a");
    let id = sender.send_message(Msg::new("sync", "refresh", "")).await.unwrap();

    assert!(
        wait_until(SETTLE, || {
            store
                .message("msg", id)
                .map(|m| m.processed_by.len() == 3)
                .unwrap_or(false)
        })
        .await
    );
    let msg = store.message("msg", id).unwrap();
    for id in ["node-b", "node-c", "node-d"] {
        assert!(msg.is_processed_by(id), "{id} missing from processedBy");
    }
    assert!(!msg.is_processed_by("node-e"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    for worker in workers {
        worker.terminate().await.unwrap();
    }
    bystander.terminate().await.unwrap();
}

#[tokio::test]
async fn test_answer_round_trip() {
    let store = Arc::new(InMemoryStore::new());

    let responder = node(&store, "node-b");
    responder.add_listener_for_topic(
        "ping",
        listener_fn("pong", |msg| async move {
            let reply = Msg::builder(msg.topic.clone())
                .msg("pong")
                .value(msg.value.clone().unwrap_or_default())
                .build();
            Ok(Disposition::answer(reply))
        }),
    );
    responder.start().await.unwrap();

    let requester = node(&store, "node-a");
    requester.start().await.unwrap();

    let request = Msg::builder("ping").value("42").build();
    let request_id = request.msg_id;
    let answer = requester
        .send_and_await_first_answer(request, SETTLE, true)
        .await
        .unwrap()
        .expect("answer within timeout");

    assert_eq!(answer.in_answer_to, Some(request_id));
    assert_eq!(answer.recipients, vec!["node-a".to_string()]);
    assert_eq!(answer.sender.as_deref(), Some("node-b"));
    assert_eq!(answer.msg.as_deref(), Some("pong"));
    assert_eq!(answer.value.as_deref(), Some("42"));

    // The answer was consumed by the correlator, not by listeners
    assert!(wait_until(SETTLE, || requester.stats().answers_routed == 1).await);

    requester.terminate().await.unwrap();
    responder.terminate().await.unwrap();
}

#[tokio::test]
async fn test_await_answers_collects_several() {
    let store = Arc::new(InMemoryStore::new());
    let mut responders = Vec::new();
    for id in ["node-b", "node-c"] {
        let responder = node(&store, id);
        responder.add_listener_for_topic(
            "census",
            listener_fn("census", |_msg| async {
                Ok(Disposition::answer(Msg::builder("census").msg("here").build()))
            }),
        );
        responder.start().await.unwrap();
        responders.push(responder);
    }

    let requester = node(&store, "node-a");
    requester.start().await.unwrap();
    let answers = requester
        .send_and_await_answers(Msg::new("census", "who", ""), 2, SETTLE, true)
        .await
        .unwrap();

    let mut senders: Vec<String> = answers.iter().filter_map(|a| a.sender.clone()).collect();
    senders.sort();
    assert_eq!(senders, vec!["node-b".to_string(), "node-c".to_string()]);

    requester.terminate().await.unwrap();
    for responder in responders {
        responder.terminate().await.unwrap();
    }
}

#[tokio::test]
async fn test_await_timeout_behavior() {
    let store = Arc::new(InMemoryStore::new());
    let requester = node(&store, "node-a");
    requester.start().await.unwrap();

    let none = requester
        .send_and_await_first_answer(Msg::new("void", "anyone?", ""), Duration::from_millis(100), false)
        .await
        .unwrap();
    assert!(none.is_none());

    let err = requester
        .send_and_await_first_answer(Msg::new("void", "anyone?", ""), Duration::from_millis(100), true)
        .await
        .unwrap_err();
    assert!(matches!(err, MessagingError::Timeout { .. }));

    requester.terminate().await.unwrap();
}

#[tokio::test]
async fn test_async_callback_receives_answer() {
    let store = Arc::new(InMemoryStore::new());
    let responder = node(&store, "node-b");
    responder.add_listener_for_topic(
        "ping",
        listener_fn("pong", |_msg| async {
            Ok(Disposition::answer(Msg::builder("ping").msg("pong").build()))
        }),
    );
    responder.start().await.unwrap();

    let requester = node(&store, "node-a");
    requester.start().await.unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let request_id = requester
        .send_and_await_async(Msg::new("ping", "m", ""), SETTLE, move |answer| {
            let _ = tx.send(answer);
        })
        .await
        .unwrap();

    let answer = tokio::time::timeout(SETTLE, rx).await.unwrap().unwrap();
    assert_eq!(answer.in_answer_to, Some(request_id));

    requester.terminate().await.unwrap();
    responder.terminate().await.unwrap();
}

#[tokio::test]
async fn test_rejected_message_stays_available_for_other_nodes() {
    let store = Arc::new(InMemoryStore::new());
    let rejections = Arc::new(AtomicUsize::new(0));

    let busy = node(&store, "node-b");
    let counter = Arc::clone(&rejections);
    busy.add_listener_for_topic(
        "job",
        listener_fn("busy", move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Disposition::Rejected(Rejection::new("too busy")))
            }
        }),
    );
    busy.start().await.unwrap();

    let sender = node(&store, "node-a");
    let id = sender
        .send_message(Msg::builder("job").exclusive(true).build())
        .await
        .unwrap();

    assert!(wait_until(SETTLE, || rejections.load(Ordering::SeqCst) >= 1).await);
    let msg = store.message("msg", id).unwrap();
    assert!(msg.processed_by.is_empty());

    let calls = Arc::new(AtomicUsize::new(0));
    let idle = node(&store, "node-c");
    idle.add_listener_for_topic("job", counting_listener(&calls));
    idle.start().await.unwrap();

    assert!(
        wait_until(SETTLE, || {
            store
                .message("msg", id)
                .map(|m| m.processed_by == vec!["node-c".to_string()])
                .unwrap_or(false)
        })
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    busy.terminate().await.unwrap();
    idle.terminate().await.unwrap();
}

#[tokio::test]
async fn test_rejection_answer_reaches_sender() {
    let store = Arc::new(InMemoryStore::new());
    let refusing = node(&store, "node-b");
    refusing.add_listener_for_topic(
        "job",
        listener_fn("refusing", |_msg| async {
            Ok(Disposition::Rejected(
                Rejection::new("unsupported")
                    .send_answer(true)
                    .continue_processing(false),
            ))
        }),
    );
    refusing.start().await.unwrap();

    let requester = node(&store, "node-a");
    requester.start().await.unwrap();
    let request = Msg::new("job", "do it", "");
    let request_id = request.msg_id;
    let answer = requester
        .send_and_await_first_answer(request, SETTLE, true)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(answer.map_value[keys::REJECTED], serde_json::json!(true));
    assert_eq!(answer.map_value[keys::REASON], serde_json::json!("unsupported"));
    assert!(store.message("msg", request_id).unwrap().is_processed_by("node-b"));

    requester.terminate().await.unwrap();
    refusing.terminate().await.unwrap();
}

#[tokio::test]
async fn test_pause_suppresses_dispatch_until_unpaused() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = node(&store, "node-b");
    worker.add_listener_for_topic("report", counting_listener(&calls));
    assert!(worker.pause_topic_processing("report"));
    assert!(!worker.pause_topic_processing("report"));
    worker.start().await.unwrap();

    let sender = node(&store, "node-a");
    let id = sender
        .send_message(Msg::builder("report").never_expires().build())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(store.message("msg", id).unwrap().processed_by.is_empty());

    let paused_for = worker.unpause_topic_processing("report");
    assert!(paused_for.unwrap_or(0) >= 250);
    assert_eq!(worker.unpause_topic_processing("report"), None);

    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) == 1).await);
    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_expired_message_is_deleted_without_dispatch() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = node(&store, "node-b");
    worker.add_listener_for_topic("flash", counting_listener(&calls));
    worker.pause_topic_processing("flash");
    worker.start().await.unwrap();

    let sender = node(&store, "node-a");
    let expiring = sender
        .send_message(Msg::builder("flash").ttl(50).build())
        .await
        .unwrap();
    let unheard = sender
        .send_message(Msg::builder("nobody-listens").ttl(50).build())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(120)).await;
    worker.unpause_topic_processing("flash");

    assert!(
        wait_until(SETTLE, || {
            store.message("msg", expiring).is_none() && store.message("msg", unheard).is_none()
        })
        .await
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_delete_after_processing_removes_message() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = node(&store, "node-b");
    worker.add_listener_for_topic("sync", counting_listener(&calls));
    worker.start().await.unwrap();

    let sender = node(&store, "node-a");
    let id = sender
        .send_message(Msg::builder("sync").delete_after_processing(0).build())
        .await
        .unwrap();

    assert!(wait_until(SETTLE, || store.message("msg", id).is_none()).await);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sender.get_number_of_messages().await.unwrap(), 0);

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_message_to_self_stays_local() {
    let store = Arc::new(InMemoryStore::new());
    let own_calls = Arc::new(AtomicUsize::new(0));
    let peer_calls = Arc::new(AtomicUsize::new(0));

    let me = node(&store, "node-a");
    me.add_listener_for_topic("reminder", counting_listener(&own_calls));
    me.start().await.unwrap();

    let peer = node(&store, "node-b");
    peer.add_listener_for_topic("reminder", counting_listener(&peer_calls));
    peer.start().await.unwrap();

    me.send_message_to_self(Msg::new("reminder", "later", ""))
        .await
        .unwrap();

    assert!(wait_until(SETTLE, || own_calls.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(peer_calls.load(Ordering::SeqCst), 0);

    me.terminate().await.unwrap();
    peer.terminate().await.unwrap();
}

#[tokio::test]
async fn test_polling_only_store() {
    let store = Arc::new(InMemoryStore::without_watch());
    assert!(!store.supports_watch());
    let calls = Arc::new(AtomicUsize::new(0));

    let worker = node(&store, "node-b");
    worker.add_listener_for_topic("ping", counting_listener(&calls));
    worker.start().await.unwrap();

    let sender = node(&store, "node-a");
    for _ in 0..5 {
        sender.send_message(Msg::new("ping", "m", "")).await.unwrap();
    }

    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) == 5).await);
    assert_eq!(worker.stats().feed_candidates, 0);
    assert!(worker.stats().polled_candidates >= 5);

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_multithreaded_worker_pool_drains_backlog() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));

    let config = docbus::MessagingConfig {
        multithreaded: true,
        worker_threads: 4,
        window_size: 8,
        ..test_config()
    };
    let worker = node_with_config(&store, "node-b", config);
    let counter = Arc::clone(&calls);
    worker.add_listener_for_topic(
        "batch",
        listener_fn("slow", move |_msg| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Disposition::NoAnswer)
            }
        }),
    );

    let sender = node(&store, "node-a");
    for i in 0..30 {
        sender
            .send_message(Msg::builder("batch").priority(i % 3).build())
            .await
            .unwrap();
    }

    worker.start().await.unwrap();
    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) == 30).await);
    assert!(wait_until(SETTLE, || worker.get_pending_messages_count() == 0).await);

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_queue_message_persists_in_background() {
    let store = Arc::new(InMemoryStore::new());
    let sender = node(&store, "node-a");

    let id = sender.queue_message(Msg::new("later", "m", "")).unwrap();
    assert!(wait_until(SETTLE, || store.message("msg", id).is_some()).await);
    assert_eq!(
        store.message("msg", id).unwrap().sender.as_deref(),
        Some("node-a")
    );

    let err = sender.queue_message(Msg::builder(" ").build()).unwrap_err();
    assert!(matches!(err, MessagingError::InvalidMessage { .. }));
}

#[tokio::test]
async fn test_invalid_message_is_never_stored() {
    let store = Arc::new(InMemoryStore::new());
    let sender = node(&store, "node-a");

    let err = sender.send_message(Msg::builder("").build()).await.unwrap_err();
    assert!(matches!(err, MessagingError::InvalidMessage { .. }));
    assert_eq!(sender.get_number_of_messages().await.unwrap(), 0);
}

#[tokio::test]
async fn test_status_info_request_collects_peers() {
    let store = Arc::new(InMemoryStore::new());
    let peer = node(&store, "node-b");
    peer.add_listener_for_topic("ping", counting_listener(&Arc::new(AtomicUsize::new(0))));
    peer.start().await.unwrap();

    let asker = node(&store, "node-a");
    asker.start().await.unwrap();

    let answers = asker
        .request_status_info(Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(answers.len(), 1);
    let info = &answers[0].map_value;
    assert_eq!(info[keys::NODE_ID], serde_json::json!("node-b"));
    assert_eq!(
        info[keys::LISTENER_TOPICS],
        serde_json::json!([STATUS_INFO_TOPIC, "ping"])
    );

    asker.terminate().await.unwrap();
    peer.terminate().await.unwrap();
}

#[tokio::test]
async fn test_registry_tracks_running_instances() {
    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(MessagingRegistry::new());

    let shared: Arc<dyn MessageStore> = store.clone();
    let first = docbus::Messaging::builder(Arc::clone(&shared))
        .config(test_config())
        .node_id("node-a")
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();
    let second = docbus::Messaging::builder(shared)
        .config(test_config())
        .node_id("node-b")
        .registry(Arc::clone(&registry))
        .build()
        .unwrap();

    assert!(registry.is_empty());
    first.start().await.unwrap();
    second.start().await.unwrap();
    assert_eq!(registry.running_instances().len(), 2);

    let found = registry.find_by_node_id("node-b").unwrap();
    assert!(found.is_running());

    second.terminate().await.unwrap();
    assert!(registry.find_by_node_id("node-b").is_none());
    assert_eq!(registry.len(), 1);

    first.terminate().await.unwrap();
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_terminate_is_idempotent_and_restartable() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = node(&store, "node-b");
    worker.add_listener_for_topic("ping", counting_listener(&calls));

    worker.terminate().await.unwrap();
    worker.start().await.unwrap();
    worker.terminate().await.unwrap();
    worker.terminate().await.unwrap();
    assert!(!worker.is_running());

    let sender = node(&store, "node-a");
    sender.send_message(Msg::new("ping", "m", "")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    worker.start().await.unwrap();
    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) == 1).await);
    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_global_listener_sees_every_topic() {
    let store = Arc::new(InMemoryStore::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let worker = node(&store, "node-b");
    let global = counting_listener(&calls);
    worker.add_global_listener(Arc::clone(&global));
    worker.start().await.unwrap();

    let sender = node(&store, "node-a");
    sender.send_message(Msg::new("alpha", "m", "")).await.unwrap();
    sender.send_message(Msg::new("beta", "m", "")).await.unwrap();

    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) == 2).await);
    assert!(worker.remove_global_listener(&global));
    worker.terminate().await.unwrap();
}

/// Store an answer from `from` to `to` whose request no node is waiting on
async fn insert_stray_answer(store: &InMemoryStore, topic: &str, from: &str, to: &str) -> docbus::MsgId {
    let mut answer = Msg::builder(topic)
        .msg("late")
        .in_answer_to(docbus::MsgId::new())
        .recipient(to)
        .build();
    answer.sender = Some(from.to_string());
    answer.delete_at = answer.compute_delete_at();
    store.insert_message("msg", &answer).await.unwrap();
    answer.msg_id
}

#[tokio::test]
async fn test_late_status_answer_is_absorbed() {
    let store = Arc::new(InMemoryStore::new());
    let a = node(&store, "node-a");
    let b = node(&store, "node-b");
    a.start().await.unwrap();
    b.start().await.unwrap();

    let id = insert_stray_answer(&store, STATUS_INFO_TOPIC, "node-a", "node-b").await;

    assert!(
        wait_until(SETTLE, || {
            store
                .message("msg", id)
                .map(|m| m.is_processed_by("node-b"))
                .unwrap_or(false)
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.get_number_of_messages().await.unwrap(), 1);

    a.terminate().await.unwrap();
    b.terminate().await.unwrap();
}

#[tokio::test]
async fn test_unmatched_answers_do_not_starve_polling() {
    let store = Arc::new(InMemoryStore::without_watch());
    let calls = Arc::new(AtomicUsize::new(0));
    let config = docbus::MessagingConfig {
        window_size: 2,
        ..test_config()
    };
    let worker = node_with_config(&store, "node-a", config);
    worker.add_listener_for_topic("job", counting_listener(&calls));
    worker.start().await.unwrap();

    let first = insert_stray_answer(&store, "ping", "node-x", "node-a").await;
    let second = insert_stray_answer(&store, "ping", "node-x", "node-a").await;
    let sender = node(&store, "node-x");
    sender.send_message(Msg::new("job", "work", "")).await.unwrap();

    assert!(wait_until(SETTLE, || calls.load(Ordering::SeqCst) == 1).await);
    for id in [first, second] {
        assert!(store.message("msg", id).unwrap().is_processed_by("node-a"));
    }

    worker.terminate().await.unwrap();
}

#[tokio::test]
async fn test_answer_after_timeout_is_absorbed() {
    let store = Arc::new(InMemoryStore::new());
    let responder = node(&store, "node-b");
    responder.add_listener_for_topic(
        "slow",
        listener_fn("slow", |_msg| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(Disposition::answer(Msg::builder("slow").msg("done").build()))
        }),
    );
    responder.start().await.unwrap();

    let requester = node(&store, "node-a");
    requester.start().await.unwrap();
    let request = Msg::new("slow", "work", "");
    let request_id = request.msg_id;
    let none = requester
        .send_and_await_first_answer(request, Duration::from_millis(50), false)
        .await
        .unwrap();
    assert!(none.is_none());

    // The late answer reaches the requester, which records it and moves on
    assert!(
        wait_until(SETTLE, || {
            store
                .message("msg", request_id)
                .map(|m| m.is_processed_by("node-b"))
                .unwrap_or(false)
                && requester.stats().skipped >= 1
        })
        .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(requester.get_number_of_messages().await.unwrap(), 2);
    assert_eq!(requester.stats().answers_routed, 0);
    assert_eq!(requester.get_pending_messages_count(), 0);

    requester.terminate().await.unwrap();
    responder.terminate().await.unwrap();
}

#[tokio::test]
async fn test_reply_to_an_answer_is_not_sent() {
    let store = Arc::new(InMemoryStore::new());
    let echo_calls = Arc::new(AtomicUsize::new(0));

    let mut nodes = Vec::new();
    for id in ["node-a", "node-b"] {
        let echo = node(&store, id);
        let counter = Arc::clone(&echo_calls);
        echo.add_listener_for_topic(
            "chat",
            listener_fn("echo", move |msg| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Disposition::answer(
                        Msg::builder(msg.topic.clone()).msg("echo").build(),
                    ))
                }
            }),
        );
        echo.start().await.unwrap();
        nodes.push(echo);
    }

    nodes[0]
        .send_message(Msg::new("chat", "hello", ""))
        .await
        .unwrap();

    // node-b answers the message, node-a's listener sees the answer and its reply is dropped
    assert!(wait_until(SETTLE, || echo_calls.load(Ordering::SeqCst) == 2).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(echo_calls.load(Ordering::SeqCst), 2);
    assert_eq!(nodes[0].get_number_of_messages().await.unwrap(), 2);

    for echo in nodes {
        echo.terminate().await.unwrap();
    }
}
