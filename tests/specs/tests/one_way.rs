// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end one-way messaging specs, including the notification push and
//! its lock-suppression rule. Skipped without a spec database.

use std::sync::Arc;
use std::time::Duration;

use parley::{Error, HandlerKind};
use parley_specs::{try_connect, unique, Duo};
use serde_json::json;
use tokio::sync::mpsc;

#[tokio::test]
async fn send_requires_a_one_way_handler() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    let err = parley
        .one_way()
        .send(&duo.alice, &[&duo.bob], json!({"text": "hi"}), None)
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::NoHandlerRegistered(HandlerKind::OneWay)),
        "got {err}"
    );

    // The failure precedes persistence; nothing landed for bob.
    assert!(parley.one_way().unread_for(&duo.bob).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn send_fans_out_to_each_recipient() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;
    let carol = unique("carol");
    parley.register_agent(&carol, &duo.org, "Carol").await?;

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    parley.register_handler(HandlerKind::OneWay, move |_msg, ctx| {
        let tx = tx.clone();
        async move {
            tx.send(ctx.receiver_id)?;
            Ok(None)
        }
    });

    let ids = parley
        .one_way()
        .send(&duo.alice, &[&duo.bob, &carol], json!({"text": "fan out"}), None)
        .await?;
    assert_eq!(ids.len(), 2);

    let mut receivers = Vec::new();
    for _ in 0..2 {
        let got = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
        receivers.push(got.expect("handler ran"));
    }
    receivers.sort();
    let mut expected = vec![duo.bob.clone(), carol.clone()];
    expected.sort();
    assert_eq!(receivers, expected);

    // Both recipients can drain their copy exactly once.
    assert_eq!(
        parley.one_way().unread_for(&duo.bob).await?,
        vec![json!({"text": "fan out"})]
    );
    assert!(parley.one_way().unread_for(&duo.bob).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn notification_fires_for_idle_recipients() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley.register_handler(HandlerKind::OneWay, |_msg, _ctx| async { Ok(None) });
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    parley.register_handler(HandlerKind::Notification, move |_msg, ctx| {
        let tx = tx.clone();
        async move {
            tx.send(ctx.receiver_id)?;
            Ok(None)
        }
    });

    parley
        .one_way()
        .send(&duo.alice, &[&duo.bob], json!({"text": "ping"}), None)
        .await?;

    let notified = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
    assert_eq!(notified.as_deref(), Some(duo.bob.as_str()));
    Ok(())
}

#[tokio::test]
async fn notification_is_silent_while_recipient_holds_a_lock() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let parley = Arc::new(parley);
    let duo = Duo::register(&parley).await?;
    let carol = unique("carol");
    parley.register_agent(&carol, &duo.org, "Carol").await?;

    parley.register_handler(HandlerKind::OneWay, |_msg, _ctx| async { Ok(None) });
    parley.register_handler(HandlerKind::Conversation, |_msg, _ctx| async {
        tokio::time::sleep(Duration::from_secs(10)).await;
        Ok(None)
    });
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    parley.register_handler(HandlerKind::Notification, move |_msg, ctx| {
        let tx = tx.clone();
        async move {
            tx.send(ctx.receiver_id)?;
            Ok(None)
        }
    });

    // Bob blocks inside his own send_and_wait, becoming the locked party
    // of the bob<->carol session.
    let blocker = Arc::clone(&parley);
    let (bob, carol_clone) = (duo.bob.clone(), carol.clone());
    let blocked = tokio::spawn(async move {
        blocker
            .conversation()
            .send_and_wait(
                &bob,
                &carol_clone,
                json!({"q": "busy"}),
                Duration::from_secs(3),
                None,
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(500)).await;

    // A one-way send to the locked bob must not double-signal him.
    parley
        .one_way()
        .send(&duo.alice, &[&duo.bob], json!({"text": "while busy"}), None)
        .await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(
        rx.try_recv().is_err(),
        "notification must stay silent for a locked recipient"
    );

    // Once unblocked and unlocked, notifications flow again.
    let _ = blocked.await?;
    parley
        .one_way()
        .send(&duo.alice, &[&duo.bob], json!({"text": "after"}), None)
        .await?;
    let notified = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await?;
    assert_eq!(notified.as_deref(), Some(duo.bob.as_str()));
    Ok(())
}

#[tokio::test]
async fn send_validates_endpoints() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;
    parley.register_handler(HandlerKind::OneWay, |_msg, _ctx| async { Ok(None) });

    let err = parley
        .one_way()
        .send(&duo.alice, &[], json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = parley
        .one_way()
        .send(&duo.alice, &[&duo.alice], json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = parley
        .one_way()
        .send(&duo.alice, &["   "], json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = parley
        .one_way()
        .send(&duo.alice, &["nobody-here"], json!({}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AgentNotFound(_)));
    Ok(())
}
