// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end conversation specs: blocking request/reply, queued sends,
//! wake semantics, and termination. Skipped without a spec database.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parley::{Error, HandlerKind};
use parley_specs::{try_connect, Duo};
use serde_json::json;

#[tokio::test]
async fn fast_path_reply_round_trip() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async {
        Ok(Some(json!({"answer": 42})))
    });

    let started = Instant::now();
    let reply = parley
        .conversation()
        .send_and_wait(
            &duo.alice,
            &duo.bob,
            json!({"q": "life"}),
            Duration::from_secs(5),
            None,
        )
        .await?;
    assert_eq!(reply, json!({"answer": 42}));
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "fast path took {:?}",
        started.elapsed()
    );

    // Request and reply persisted; reply marked read; session unlocked.
    let sessions = parley.conversation().active_sessions(&duo.alice).await?;
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].locked_by, None);
    let history = parley
        .conversation()
        .session_history(sessions[0].session_id)
        .await?;
    assert_eq!(history.len(), 2);
    assert!(history[1].read_at.is_some(), "reply should be marked read");
    assert!(
        parley
            .conversation()
            .get_unread_messages(&duo.alice)
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn blocking_send_times_out_and_unlocks() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(Some(json!({"too": "late"})))
    });

    let started = Instant::now();
    let err = parley
        .conversation()
        .send_and_wait(
            &duo.alice,
            &duo.bob,
            json!({"q": "anyone?"}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "got {err}");
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_secs(1) && elapsed < Duration::from_secs(4),
        "timeout fired at {elapsed:?}"
    );

    let sessions = parley.conversation().active_sessions(&duo.alice).await?;
    assert_eq!(sessions[0].locked_by, None, "session must unlock on timeout");
    Ok(())
}

#[tokio::test]
async fn queued_send_wakes_blocking_caller() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let parley = Arc::new(parley);
    let duo = Duo::register(&parley).await?;

    // No fast-path reply; the counterpart answers out-of-band.
    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async { Ok(None) });

    let waiter = Arc::clone(&parley);
    let (alice, bob) = (duo.alice.clone(), duo.bob.clone());
    let blocked = tokio::spawn(async move {
        waiter
            .conversation()
            .send_and_wait(
                &alice,
                &bob,
                json!({"q": "ping"}),
                Duration::from_secs(5),
                None,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    parley
        .conversation()
        .send_no_wait(&duo.bob, &duo.alice, json!({"text": "hi"}), None)
        .await?;

    let reply = blocked.await??;
    assert_eq!(reply, json!({"text": "hi"}));

    // The delivered reply was marked read on the way out.
    assert!(
        parley
            .conversation()
            .get_unread_messages(&duo.alice)
            .await?
            .is_empty()
    );
    Ok(())
}

#[tokio::test]
async fn concurrent_blocking_send_is_rejected() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let parley = Arc::new(parley);
    let duo = Duo::register(&parley).await?;

    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(None)
    });

    let holder = Arc::clone(&parley);
    let (alice, bob) = (duo.alice.clone(), duo.bob.clone());
    let blocked = tokio::spawn(async move {
        holder
            .conversation()
            .send_and_wait(
                &alice,
                &bob,
                json!({"q": "first"}),
                Duration::from_secs(5),
                None,
            )
            .await
    });

    tokio::time::sleep(Duration::from_millis(500)).await;
    let err = parley
        .conversation()
        .send_and_wait(
            &duo.bob,
            &duo.alice,
            json!({"q": "second"}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LockUnavailable(_)), "got {err}");

    // Unblock the holder so the test does not ride out the full timeout.
    parley
        .conversation()
        .send_no_wait(&duo.bob, &duo.alice, json!({"ok": true}), None)
        .await?;
    let reply = blocked.await??;
    assert_eq!(reply, json!({"ok": true}));
    Ok(())
}

#[tokio::test]
async fn get_or_wait_drains_queue_first() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"n": 1}), None)
        .await?;

    let got = parley
        .conversation()
        .get_or_wait_for_response(&duo.bob, &duo.alice, Some(Duration::from_secs(1)))
        .await?;
    assert_eq!(got, Some(json!({"n": 1})));

    // Queue drained; the next read waits and then times out empty.
    let got = parley
        .conversation()
        .get_or_wait_for_response(&duo.bob, &duo.alice, Some(Duration::from_millis(300)))
        .await?;
    assert_eq!(got, None);
    Ok(())
}

#[tokio::test]
async fn get_or_wait_parks_until_send() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let parley = Arc::new(parley);
    let duo = Duo::register(&parley).await?;

    let reader = Arc::clone(&parley);
    let (alice, bob) = (duo.alice.clone(), duo.bob.clone());
    let parked = tokio::spawn(async move {
        reader
            .conversation()
            .get_or_wait_for_response(&bob, &alice, Some(Duration::from_secs(5)))
            .await
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"late": true}), None)
        .await?;

    assert_eq!(parked.await??, Some(json!({"late": true})));
    Ok(())
}

#[tokio::test]
async fn unread_messages_are_returned_once() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"text": "queued"}), None)
        .await?;

    let first = parley.conversation().get_unread_messages(&duo.bob).await?;
    assert_eq!(first, vec![json!({"text": "queued"})]);
    let second = parley.conversation().get_unread_messages(&duo.bob).await?;
    assert!(second.is_empty());
    Ok(())
}

#[tokio::test]
async fn message_bodies_round_trip_exactly() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    let body = json!({"nested": {"list": [1, 2, {"deep": true}], "text": "päivää"}});
    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, body.clone(), None)
        .await?;
    let got = parley.conversation().get_unread_messages(&duo.bob).await?;
    assert_eq!(got, vec![body]);
    Ok(())
}

#[tokio::test]
async fn end_conversation_is_idempotent() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;
    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async { Ok(None) });

    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"hello": 1}), None)
        .await?;
    parley
        .conversation()
        .end_conversation(&duo.alice, &duo.bob)
        .await?;

    let err = parley
        .conversation()
        .end_conversation(&duo.alice, &duo.bob)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionState(_)), "got {err}");

    // Both sides received the system ending notice.
    let alice_queue = parley.conversation().get_unread_messages(&duo.alice).await?;
    assert!(alice_queue.contains(&json!({"type": "conversation_ended", "reason": "explicit_end"})));
    Ok(())
}

#[tokio::test]
async fn send_and_wait_validates_inputs() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;
    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async { Ok(None) });

    // Out-of-range timeouts.
    for timeout in [Duration::ZERO, Duration::from_secs(301)] {
        let err = parley
            .conversation()
            .send_and_wait(&duo.alice, &duo.bob, json!({}), timeout, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "got {err}");
    }

    // Self-send and unknown endpoints.
    let err = parley
        .conversation()
        .send_and_wait(
            &duo.alice,
            &duo.alice,
            json!({}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = parley
        .conversation()
        .send_and_wait(
            &duo.alice,
            "nobody-here",
            json!({}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentNotFound(_)));
    Ok(())
}

#[tokio::test]
async fn send_and_wait_requires_conversation_handler() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    let err = parley
        .conversation()
        .send_and_wait(
            &duo.alice,
            &duo.bob,
            json!({}),
            Duration::from_secs(1),
            None,
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::NoHandlerRegistered(HandlerKind::Conversation)),
        "got {err}"
    );
    Ok(())
}
