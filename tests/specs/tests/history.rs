// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! History query specs: metadata predicates, date-range and type filters,
//! and limit/offset pagination. Skipped without a spec database.

use parley::{MessageFilter, MessageType, MetadataMatch, MetadataQuery};
use parley_specs::{try_connect, Assembly, Duo};
use serde_json::json;

#[tokio::test]
async fn metadata_exact_match_scoped_to_session() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley
        .conversation()
        .send_no_wait(
            &duo.alice,
            &duo.bob,
            json!({"text": "urgent one"}),
            Some(json!({"priority": "high", "request_id": "req-1"})),
        )
        .await?;
    parley
        .conversation()
        .send_no_wait(
            &duo.alice,
            &duo.bob,
            json!({"text": "routine"}),
            Some(json!({"priority": "low"})),
        )
        .await?;

    let sessions = parley.conversation().active_sessions(&duo.alice).await?;
    let session_id = sessions[0].session_id;

    let found = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::equals("priority", json!("high"))],
            session_id: Some(session_id),
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].content, json!({"text": "urgent one"}));

    // Numbers compare in their text form, like the wire representation.
    let none = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::equals("priority", json!("medium"))],
            session_id: Some(session_id),
            ..MetadataQuery::default()
        })
        .await?;
    assert!(none.is_empty());
    Ok(())
}

#[tokio::test]
async fn metadata_contains_and_exists_predicates() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    parley
        .conversation()
        .send_no_wait(
            &duo.alice,
            &duo.bob,
            json!({"text": "tagged"}),
            Some(json!({"tags": ["urgent", "billing"], "request_id": "req-9"})),
        )
        .await?;
    parley
        .conversation()
        .send_no_wait(
            &duo.alice,
            &duo.bob,
            json!({"text": "untagged"}),
            Some(json!({"tags": ["banter"]})),
        )
        .await?;

    let sessions = parley.conversation().active_sessions(&duo.alice).await?;
    let session_id = sessions[0].session_id;

    let tagged = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::contains("tags", json!("urgent"))],
            session_id: Some(session_id),
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(tagged.len(), 1);
    assert_eq!(tagged[0].content, json!({"text": "tagged"}));

    let with_request = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::exists("request_id", true)],
            session_id: Some(session_id),
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(with_request.len(), 1);
    assert_eq!(with_request[0].content, json!({"text": "tagged"}));

    let without_request = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::exists("request_id", false)],
            session_id: Some(session_id),
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(without_request.len(), 1);
    assert_eq!(without_request[0].content, json!({"text": "untagged"}));

    // Predicates compose conjunctively.
    let both = parley
        .find_messages(&MetadataQuery {
            filters: vec![
                MetadataMatch::contains("tags", json!("urgent")),
                MetadataMatch::exists("request_id", true),
            ],
            session_id: Some(session_id),
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(both.len(), 1);
    Ok(())
}

#[tokio::test]
async fn metadata_query_paginates_newest_first() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    for n in 0..5 {
        parley
            .conversation()
            .send_no_wait(
                &duo.alice,
                &duo.bob,
                json!({"n": n}),
                Some(json!({"batch": "page-test"})),
            )
            .await?;
    }
    let sessions = parley.conversation().active_sessions(&duo.alice).await?;
    let session_id = sessions[0].session_id;

    let first_page = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::equals("batch", json!("page-test"))],
            session_id: Some(session_id),
            limit: 2,
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].content, json!({"n": 4}));
    assert_eq!(first_page[1].content, json!({"n": 3}));

    let second_page = parley
        .find_messages(&MetadataQuery {
            filters: vec![MetadataMatch::equals("batch", json!("page-test"))],
            session_id: Some(session_id),
            limit: 2,
            offset: 2,
            ..MetadataQuery::default()
        })
        .await?;
    assert_eq!(second_page.len(), 2);
    assert_eq!(second_page[0].content, json!({"n": 2}));
    assert_eq!(second_page[1].content, json!({"n": 1}));
    Ok(())
}

#[tokio::test]
async fn session_page_filters_dates_types_and_limit() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    for n in 0..4 {
        parley
            .conversation()
            .send_no_wait(&duo.alice, &duo.bob, json!({"n": n}), None)
            .await?;
    }
    let session_id = parley.conversation().active_sessions(&duo.alice).await?[0].session_id;

    // Termination adds two SYSTEM rows to the same session.
    parley
        .conversation()
        .end_conversation(&duo.alice, &duo.bob)
        .await?;

    let history = parley.conversation().session_history(session_id).await?;
    assert_eq!(history.len(), 6);

    // Type filter drops the SYSTEM termination notices.
    let user_only = parley
        .conversation()
        .session_history_filtered(
            session_id,
            &MessageFilter {
                message_types: vec![MessageType::UserDefined],
                ..MessageFilter::default()
            },
        )
        .await?;
    assert_eq!(user_only.len(), 4);
    assert!(user_only
        .iter()
        .all(|m| m.message_type == MessageType::UserDefined));

    // Inclusive date range from the third message onward.
    let from_third = parley
        .conversation()
        .session_history_filtered(
            session_id,
            &MessageFilter {
                date_from: Some(history[2].created_at),
                message_types: vec![MessageType::UserDefined],
                ..MessageFilter::default()
            },
        )
        .await?;
    assert_eq!(from_third.len(), 2);
    assert_eq!(from_third[0].content, json!({"n": 2}));

    // Row limit truncates the page, oldest first.
    let page = parley
        .conversation()
        .session_history_filtered(
            session_id,
            &MessageFilter {
                limit: 3,
                ..MessageFilter::default()
            },
        )
        .await?;
    assert_eq!(page.len(), 3);
    assert_eq!(page[0].content, json!({"n": 0}));
    Ok(())
}

#[tokio::test]
async fn meeting_page_filters_out_the_ending() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let assembly = Assembly::register(&parley, 2).await?;
    let meeting_id = parley
        .meeting()
        .create_meeting(&assembly.host, &assembly.participant_refs(), None)
        .await?;
    for participant in &assembly.participants {
        parley.meeting().attend_meeting(participant, meeting_id).await?;
    }
    parley.meeting().start_meeting(&assembly.host, meeting_id).await?;
    parley
        .meeting()
        .speak(&assembly.participants[0], meeting_id, json!({"text": "one"}), None)
        .await?;
    parley
        .meeting()
        .speak(&assembly.participants[1], meeting_id, json!({"text": "two"}), None)
        .await?;
    parley.meeting().end_meeting(&assembly.host, meeting_id).await?;

    let full = parley.meeting().meeting_history(meeting_id).await?;
    assert_eq!(full.len(), 3, "two spoken plus the ending");

    let spoken = parley
        .meeting()
        .meeting_history_filtered(
            meeting_id,
            &MessageFilter {
                message_types: vec![MessageType::UserDefined],
                ..MessageFilter::default()
            },
        )
        .await?;
    assert_eq!(spoken.len(), 2);
    assert_eq!(spoken[0].content, json!({"text": "one"}));
    assert_eq!(spoken[1].content, json!({"text": "two"}));
    Ok(())
}
