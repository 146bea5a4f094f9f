use tally_core::models::{
    InventoryItem, LineDecision, NewDraftLine, NewInventoryItem, ReceivingSession, Upload,
    VerificationState,
};
use tally_core::RequestContext;
use tally_services::{OcrDisposition, UploadRequest};
use uuid::Uuid;

use super::fixtures::{ocr_text, sharp_document_png};
use super::TestEngine;

pub fn png_request(data: Vec<u8>) -> UploadRequest {
    UploadRequest {
        data,
        media_type: "image/png".to_string(),
    }
}

/// Admit an upload and run it through OCR so it can feed a receiving session.
pub async fn completed_upload(engine: &TestEngine, ctx: &RequestContext, seed: u32) -> Upload {
    let receipt = engine
        .intake
        .submit(ctx, png_request(sharp_document_png(seed)))
        .await
        .expect("upload should be admitted");
    let claimed = engine
        .processing
        .claim(receipt.upload.id)
        .await
        .unwrap()
        .expect("queued upload should be claimable");
    match engine
        .processing
        .finish(&claimed, &ocr_text("PART-001 x4\nPART-002 x2\nDelivery note 7781"))
        .await
        .unwrap()
    {
        OcrDisposition::Completed(upload) => upload,
        other => panic!("expected completed upload, got {:?}", other),
    }
}

pub async fn stocked_item(engine: &TestEngine, admin: &RequestContext, sku: &str, quantity: i64) -> InventoryItem {
    engine
        .stock
        .create_item(
            admin,
            NewInventoryItem {
                sku: sku.to_string(),
                name: format!("Item {}", sku),
                quantity_on_hand: quantity,
            },
        )
        .await
        .unwrap()
}

/// Open a session with `quantities.len()` lines against `item`, all confirmed at a
/// plausible pace.
pub async fn confirmed_session(
    engine: &TestEngine,
    ctx: &RequestContext,
    item: Uuid,
    quantities: &[i64],
    seed: u32,
) -> ReceivingSession {
    let upload = completed_upload(engine, ctx, seed).await;
    let session = engine.receiving.start_session(ctx).await.unwrap();
    let lines = engine
        .receiving
        .attach_lines(
            ctx,
            session.id,
            upload.id,
            quantities
                .iter()
                .map(|q| NewDraftLine {
                    part_reference: "PART-001".to_string(),
                    quantity: *q,
                    item_id: Some(item),
                })
                .collect(),
        )
        .await
        .unwrap();
    let decisions: Vec<LineDecision> = lines
        .iter()
        .map(|l| LineDecision {
            line_id: l.id,
            state: VerificationState::Confirmed,
        })
        .collect();
    let elapsed = std::time::Duration::from_secs(5 * decisions.len() as u64);
    engine
        .receiving
        .verify_lines(ctx, session.id, decisions, elapsed)
        .await
        .unwrap();
    session
}
