use axum::Json;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

use crate::error::ApiError;
use types::{Placement, ScheduleInput};

#[derive(Deserialize, ToSchema)]
pub struct ExplainIn {
    pub input: ScheduleInput,
    pub placements: Vec<Placement>,
}

#[derive(Serialize, ToSchema)]
pub struct ExplainOut {
    pub fitness: i64,
    pub feasible: bool,
    pub rule_passed: BTreeMap<String, u32>,
    pub rule_failed: BTreeMap<String, u32>,
    pub grid: String,
}

#[utoipa::path(
    post,
    path = "/v1/explain",
    request_body = ExplainIn,
    responses(
    (status = 200, description = "Rule-level score breakdown for a given timetable", body = ExplainOut)
    )
)]
pub async fn explain(Json(body): Json<ExplainIn>) -> Result<Json<ExplainOut>, ApiError> {
    let ex = ttable_core::explain(&body.input, &body.placements)
        .map_err(|e| ApiError(e.to_string()))?;
    let grid = types::render_week(&body.input.grid, &body.placements);
    Ok(Json(ExplainOut {
        fitness: ex.fitness,
        feasible: ex.feasible,
        rule_passed: ex.rule_passed,
        rule_failed: ex.rule_failed,
        grid,
    }))
}
