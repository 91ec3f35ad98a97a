// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Organization/agent registration and cascade-delete specs. Skipped
//! without a spec database.

use parley::Error;
use parley_specs::{try_connect, unique, Duo};
use serde_json::json;

#[tokio::test]
async fn organizations_and_agents_round_trip() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let org_ext = unique("org");
    let org_id = parley.register_organization(&org_ext, "Acme").await?;
    let org = parley.organization(&org_ext).await?;
    assert_eq!(org.id, org_id);
    assert_eq!(org.name, "Acme");

    let agent_ext = unique("agent");
    let agent_id = parley.register_agent(&agent_ext, &org_ext, "Agent One").await?;
    let agent = parley.agent(&agent_ext).await?;
    assert_eq!(agent.id, agent_id);
    assert_eq!(agent.organization_id, org_id);

    let roster = parley.agents_in_organization(&org_ext).await?;
    assert_eq!(roster.len(), 1);
    assert_eq!(roster[0].external_id, agent_ext);
    Ok(())
}

#[tokio::test]
async fn duplicate_external_ids_are_rejected() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let org_ext = unique("org");
    parley.register_organization(&org_ext, "Acme").await?;
    let err = parley
        .register_organization(&org_ext, "Acme Again")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)), "got {err}");

    let agent_ext = unique("agent");
    parley.register_agent(&agent_ext, &org_ext, "One").await?;
    let err = parley
        .register_agent(&agent_ext, &org_ext, "Two")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn agent_registration_needs_an_organization() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let err = parley
        .register_agent(&unique("agent"), "no-such-org", "Orphan")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::OrganizationNotFound(_)), "got {err}");
    Ok(())
}

#[tokio::test]
async fn removing_an_organization_cascades() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;

    // Leave some owned state behind: a session with a queued message.
    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"text": "doomed"}), None)
        .await?;

    assert!(parley.remove_organization(&duo.org).await?);
    let err = parley.agent(&duo.alice).await.unwrap_err();
    assert!(matches!(err, Error::AgentNotFound(_)));
    let err = parley.organization(&duo.org).await.unwrap_err();
    assert!(matches!(err, Error::OrganizationNotFound(_)));

    // Second removal finds nothing.
    assert!(!parley.remove_organization(&duo.org).await?);
    Ok(())
}

#[tokio::test]
async fn removing_an_agent_cascades_its_sessions() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;
    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"text": "bye"}), None)
        .await?;

    assert!(parley.remove_agent(&duo.bob).await?);
    assert!(parley
        .conversation()
        .active_sessions(&duo.alice)
        .await?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn registration_validates_inputs() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let err = parley.register_organization("  ", "Blank").await.unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = parley
        .register_organization(&unique("org"), "   ")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    Ok(())
}

#[tokio::test]
async fn shutdown_is_orderly() -> anyhow::Result<()> {
    let Some(parley) = try_connect().await? else {
        return Ok(());
    };
    let duo = Duo::register(&parley).await?;
    parley
        .conversation()
        .send_no_wait(&duo.alice, &duo.bob, json!({"text": "last"}), None)
        .await?;

    assert!(!parley.is_shutting_down());
    parley.shutdown().await?;
    assert!(parley.is_shutting_down());
    Ok(())
}
