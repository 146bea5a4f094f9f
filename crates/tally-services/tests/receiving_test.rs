mod helpers;

use std::time::Duration;

use tally_core::models::{
    AuditAction, LineDecision, NewDraftLine, SessionStatus, VerificationState,
};
use tally_core::AppError;
use uuid::Uuid;

use helpers::fixtures::sharp_document_png;
use helpers::workflows::{completed_upload, confirmed_session, png_request, stocked_item};
use helpers::{crew, hod, setup_test_engine};

#[tokio::test]
async fn test_commit_deducts_confirmed_lines_once() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "BOLT-M8", 10).await;
    let session = confirmed_session(&engine, &ctx, item.id, &[3, 2], 40).await;

    let first = engine.receiving.commit(&ctx, session.id).await.unwrap();
    assert!(!first.replayed);
    assert_eq!(first.result.deductions.len(), 2);
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 5);

    let replay = engine.receiving.commit(&ctx, session.id).await.unwrap();
    assert!(replay.replayed);
    assert_eq!(replay.result, first.result);
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 5);

    let stored = engine.receiving.get_session(&ctx, session.id).await.unwrap();
    assert_eq!(stored.status, SessionStatus::Committed);
}

#[tokio::test]
async fn test_concurrent_commits_deduct_once() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "FILTER-9", 10).await;
    let session = confirmed_session(&engine, &ctx, item.id, &[4], 41).await;

    let (a, b) = tokio::join!(
        engine.receiving.commit(&ctx, session.id),
        engine.receiving.commit(&ctx, session.id)
    );

    let mut fresh = 0;
    for outcome in [a, b] {
        match outcome {
            Ok(outcome) if !outcome.replayed => fresh += 1,
            Ok(_) => {}
            Err(AppError::CommitConflict { session_id, .. }) => assert_eq!(session_id, session.id),
            Err(other) => panic!("unexpected commit error: {:?}", other),
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 6);

    let later = engine.receiving.commit(&ctx, session.id).await.unwrap();
    assert!(later.replayed);
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 6);
}

#[tokio::test]
async fn test_implausibly_fast_bulk_confirmation_blocks_commit() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "WASHER-2", 100).await;
    let upload = completed_upload(&engine, &ctx, 42).await;
    let session = engine.receiving.start_session(&ctx).await.unwrap();

    let lines = engine
        .receiving
        .attach_lines(
            &ctx,
            session.id,
            upload.id,
            (0..30)
                .map(|i| NewDraftLine {
                    part_reference: format!("WASHER-2 #{}", i),
                    quantity: 1,
                    item_id: Some(item.id),
                })
                .collect(),
        )
        .await
        .unwrap();
    let decisions = lines
        .iter()
        .map(|l| LineDecision {
            line_id: l.id,
            state: VerificationState::Confirmed,
        })
        .collect();

    let outcome = engine
        .receiving
        .verify_lines(&ctx, session.id, decisions, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(outcome.requires_secondary_confirmation);
    assert_eq!(outcome.confirmed_count, 30);
    assert!(outcome.per_item_seconds.unwrap() < 0.2);

    let err = engine.receiving.commit(&ctx, session.id).await.unwrap_err();
    assert!(matches!(err, AppError::ConfirmationRequired { session_id, .. } if session_id == session.id));
    let reopened = engine.receiving.get_session(&ctx, session.id).await.unwrap();
    assert_eq!(reopened.status, SessionStatus::Open);
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 100);

    let acknowledged = engine
        .receiving
        .acknowledge_bulk_confirmation(&ctx, session.id)
        .await
        .unwrap();
    assert!(!acknowledged.requires_secondary_confirmation);

    let committed = engine.receiving.commit(&ctx, session.id).await.unwrap();
    assert_eq!(committed.result.deductions.len(), 30);
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 70);
}

#[tokio::test]
async fn test_unresolved_confirmed_lines_block_commit() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "PUMP-1", 3).await;
    let upload = completed_upload(&engine, &ctx, 43).await;
    let session = engine.receiving.start_session(&ctx).await.unwrap();

    let lines = engine
        .receiving
        .attach_lines(
            &ctx,
            session.id,
            upload.id,
            vec![
                NewDraftLine {
                    part_reference: "PUMP-1".to_string(),
                    quantity: 1,
                    item_id: Some(item.id),
                },
                NewDraftLine {
                    part_reference: "pmp 1 (smudged)".to_string(),
                    quantity: 1,
                    item_id: None,
                },
            ],
        )
        .await
        .unwrap();
    let unresolved = lines[1].id;
    engine
        .receiving
        .verify_lines(
            &ctx,
            session.id,
            lines
                .iter()
                .map(|l| LineDecision {
                    line_id: l.id,
                    state: VerificationState::Confirmed,
                })
                .collect(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();

    match engine.receiving.commit(&ctx, session.id).await.unwrap_err() {
        AppError::UnresolvedParts { line_ids } => assert_eq!(line_ids, vec![unresolved]),
        other => panic!("expected unresolved parts, got {:?}", other),
    }
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 3);

    engine
        .receiving
        .resolve_part(&ctx, session.id, unresolved, item.id)
        .await
        .unwrap();
    engine.receiving.commit(&ctx, session.id).await.unwrap();
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 1);
}

#[tokio::test]
async fn test_insufficient_stock_rolls_back_whole_commit() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "GASKET-7", 5).await;
    let session = confirmed_session(&engine, &ctx, item.id, &[3, 4], 44).await;

    match engine.receiving.commit(&ctx, session.id).await.unwrap_err() {
        AppError::InsufficientStock { item_id, shortfall, .. } => {
            assert_eq!(item_id, item.id);
            assert_eq!(shortfall, 2);
        }
        other => panic!("expected insufficient stock, got {:?}", other),
    }
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 5);

    let session = engine.receiving.get_session(&ctx, session.id).await.unwrap();
    assert_eq!(session.status, SessionStatus::Open);

    let entries = engine.audit.list(&hod(tenant), 500).await.unwrap();
    assert!(entries.iter().any(|e| e.action == AuditAction::DeductionFailed));
    assert!(entries.iter().any(|e| e.action == AuditAction::SessionRolledBack));
    assert!(!entries.iter().any(|e| e.action == AuditAction::DeductionSucceeded));

    // After restocking the same session commits.
    engine.stock.restock(&hod(tenant), item.id, 2).await.unwrap();
    engine.receiving.commit(&ctx, session.id).await.unwrap();
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 0);
}

#[tokio::test]
async fn test_cancelled_session_is_frozen() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "HOSE-3", 8).await;
    let session = confirmed_session(&engine, &ctx, item.id, &[2], 45).await;

    let denied = engine.receiving.cancel_session(&ctx, session.id).await.unwrap_err();
    assert!(matches!(denied, AppError::Forbidden(_)));

    let cancelled = engine.receiving.cancel_session(&hod(tenant), session.id).await.unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert!(engine.receiving.list_lines(&ctx, session.id).await.unwrap().is_empty());

    let commit = engine.receiving.commit(&ctx, session.id).await.unwrap_err();
    assert!(matches!(commit, AppError::InvalidState(_)));
    let again = engine.receiving.cancel_session(&hod(tenant), session.id).await.unwrap_err();
    assert!(matches!(again, AppError::InvalidState(_)));

    let upload = completed_upload(&engine, &ctx, 46).await;
    let attach = engine
        .receiving
        .attach_lines(
            &ctx,
            session.id,
            upload.id,
            vec![NewDraftLine {
                part_reference: "HOSE-3".to_string(),
                quantity: 1,
                item_id: Some(item.id),
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(attach, AppError::InvalidState(_)));
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 8);

    // Each rejected call leaves exactly one failure entry.
    let entries = engine.audit.list(&hod(tenant), 500).await.unwrap();
    let failures: Vec<(AuditAction, String)> = entries
        .iter()
        .filter(|e| matches!(e.action, AuditAction::CommitFailed | AuditAction::SessionUpdateFailed))
        .map(|e| {
            let kind = e.after.as_ref().unwrap()["error"]["kind"].as_str().unwrap().to_string();
            (e.action, kind)
        })
        .collect();
    assert_eq!(
        failures,
        vec![
            (AuditAction::CommitFailed, "INVALID_STATE".to_string()),
            (AuditAction::SessionUpdateFailed, "INVALID_STATE".to_string()),
            (AuditAction::SessionUpdateFailed, "INVALID_STATE".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_lines_require_completed_upload() {
    let engine = setup_test_engine().await;
    let ctx = crew(Uuid::new_v4());
    let queued = engine
        .intake
        .submit(&ctx, png_request(sharp_document_png(47)))
        .await
        .unwrap();
    let session = engine.receiving.start_session(&ctx).await.unwrap();

    let err = engine
        .receiving
        .attach_lines(
            &ctx,
            session.id,
            queued.upload.id,
            vec![NewDraftLine {
                part_reference: "ANY".to_string(),
                quantity: 1,
                item_id: None,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidState(_)));

    let entries = engine.audit.list(&hod(ctx.tenant_id), 100).await.unwrap();
    let last = entries.last().unwrap();
    assert_eq!(last.action, AuditAction::SessionUpdateFailed);
    assert_eq!(last.entity_ref, format!("session:{}", session.id));
}

#[tokio::test]
async fn test_invalid_line_input_is_audited() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let upload = completed_upload(&engine, &ctx, 49).await;
    let session = engine.receiving.start_session(&ctx).await.unwrap();

    let before = engine.audit.list(&hod(tenant), 100).await.unwrap().len();
    let err = engine
        .receiving
        .attach_lines(
            &ctx,
            session.id,
            upload.id,
            vec![NewDraftLine {
                part_reference: "PUMP-1".to_string(),
                quantity: 0,
                item_id: None,
            }],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let err = engine
        .receiving
        .resolve_part(&ctx, session.id, Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let entries = engine.audit.list(&hod(tenant), 100).await.unwrap();
    assert_eq!(entries.len(), before + 2);
    let kinds: Vec<_> = entries[before..]
        .iter()
        .map(|e| {
            assert_eq!(e.action, AuditAction::SessionUpdateFailed);
            e.after.as_ref().unwrap()["error"]["kind"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(kinds, vec!["INVALID_INPUT", "NOT_FOUND"]);
}

#[tokio::test]
async fn test_sessions_are_tenant_scoped() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "CABLE-5", 4).await;
    let session = confirmed_session(&engine, &ctx, item.id, &[1], 48).await;

    let intruder = hod(Uuid::new_v4());
    assert!(matches!(
        engine.receiving.get_session(&intruder, session.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        engine.receiving.commit(&intruder, session.id).await,
        Err(AppError::NotFound(_))
    ));
    assert!(matches!(
        engine.ledger.deduct(&intruder, item.id, 1).await,
        Err(AppError::NotFound(_))
    ));
    assert_eq!(engine.stock.get_item(&ctx, item.id).await.unwrap().quantity_on_hand, 4);
}

#[tokio::test]
async fn test_audit_trail_verifies_after_full_flow() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let ctx = crew(tenant);
    let item = stocked_item(&engine, &hod(tenant), "VALVE-4", 6).await;
    let session = confirmed_session(&engine, &ctx, item.id, &[1, 1], 49).await;
    engine.receiving.commit(&ctx, session.id).await.unwrap();

    let report = engine.audit.verify_tenant(tenant, 1000).await.unwrap();
    assert!(report.is_intact());
    assert!(report.checked >= 8, "checked {}", report.checked);

    let entries = engine.audit.list(&hod(tenant), 1000).await.unwrap();
    let actions: Vec<AuditAction> = entries.iter().map(|e| e.action).collect();
    for expected in [
        AuditAction::ItemCreated,
        AuditAction::UploadAdmitted,
        AuditAction::UploadCompleted,
        AuditAction::SessionStarted,
        AuditAction::LinesAttached,
        AuditAction::LinesVerified,
        AuditAction::DeductionSucceeded,
        AuditAction::SessionCommitted,
    ] {
        assert!(actions.contains(&expected), "missing {}", expected);
    }
    assert!(entries.iter().all(|e| engine.audit.verify(e)));
}

#[tokio::test]
async fn test_rejected_stock_changes_are_audited() {
    let engine = setup_test_engine().await;
    let tenant = Uuid::new_v4();
    let admin = hod(tenant);
    let item = stocked_item(&engine, &admin, "NUT-M8", 5).await;

    let err = engine
        .stock
        .create_item(
            &admin,
            tally_core::models::NewInventoryItem {
                sku: "   ".to_string(),
                name: "Blank".to_string(),
                quantity_on_hand: 1,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
    let err = engine.stock.restock(&admin, item.id, 0).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));

    let failures: Vec<_> = engine
        .audit
        .list(&admin, 500)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.action == AuditAction::StockUpdateFailed)
        .collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].entity_ref, format!("tenant:{}", tenant));
    assert_eq!(failures[1].entity_ref, item.entity_ref());
    for failure in &failures {
        assert_eq!(failure.after.as_ref().unwrap()["error"]["kind"], "INVALID_INPUT");
    }
    let unchanged = engine.stock.get_item(&admin, item.id).await.unwrap();
    assert_eq!(unchanged.quantity_on_hand, 5);
}
