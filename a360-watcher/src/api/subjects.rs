//! Subject status and export endpoints
//!
//! Reconnecting observers re-derive current slot state from these instead of
//! an event backlog; the export endpoint re-runs manifest assembly on
//! demand (it is idempotent, so this is always safe).

use crate::error::{ApiError, ApiResult};
use crate::slots::SlotView;
use crate::AppState;
use a360_common::subject::SubjectId;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectSummary {
    pub subject_id: SubjectId,
    pub sex: String,
    pub ethnicity_group: String,
    pub fitzpatrick_tone: String,
    pub status: String,
    pub base_path: String,
    pub stored_count: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectStatus {
    pub subject_id: SubjectId,
    pub base_path: String,
    pub timeline_complete: bool,
    pub slots: Vec<SlotView>,
}

/// GET /subjects - registry subjects with stored-slot counts
pub async fn list_subjects(State(state): State<AppState>) -> ApiResult<Json<Vec<SubjectSummary>>> {
    let subjects = state.registry.list_subjects().await?;

    let mut out = Vec::with_capacity(subjects.len());
    for record in subjects {
        let Some(subject_id) = record.subject_id else {
            continue;
        };
        let stored_count = state.slots.stored_count(&subject_id).await;
        out.push(SubjectSummary {
            subject_id,
            sex: record.sex,
            ethnicity_group: record.ethnicity_group,
            fitzpatrick_tone: record.fitzpatrick_tone,
            status: record.status,
            base_path: record.base_path,
            stored_count,
        });
    }
    Ok(Json(out))
}

/// GET /subjects/:id - full slot snapshot for one subject
pub async fn get_subject(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<SubjectStatus>> {
    let subject_id =
        SubjectId::parse(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let record = state
        .registry
        .read_subject(&subject_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subject {subject_id}")))?;

    let slots = state.slots.subject_snapshot(&subject_id).await;
    // Disk truth, consistent with the completion trigger
    let timeline_dir = state.config.timeline_dir(&record.base_path);
    let timeline_complete = crate::manifest::timeline_complete(&timeline_dir, &subject_id);

    Ok(Json(SubjectStatus {
        subject_id,
        base_path: record.base_path,
        timeline_complete,
        slots,
    }))
}

/// POST /subjects/:id/export - rebuild the manifest and export bundle
pub async fn export_subject(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let subject_id =
        SubjectId::parse(&id).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let record = state
        .registry
        .read_subject(&subject_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("subject {subject_id}")))?;

    let timeline_dir = state.config.timeline_dir(&record.base_path);
    if !timeline_dir.exists() {
        return Err(ApiError::NotFound(format!(
            "timeline folder for {subject_id} does not exist yet"
        )));
    }

    let result = state
        .assembler
        .export_zip(&subject_id, &timeline_dir, Some(&record))
        .map_err(|e| ApiError::Internal(format!("export failed: {e}")))?;

    Ok(Json(json!({
        "ok": true,
        "result": result,
    })))
}
