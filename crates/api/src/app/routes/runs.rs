use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};

use crate::app::dto::{self, ListRunsQuery, RunView, StartRunRequest};
use crate::app::errors;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(start_run).get(list_runs))
        .route("/:id", get(get_run))
        .route("/:id/cancel", post(cancel_run))
}

/// Record the run, then drive it in the background; the caller polls `GET /runs/:id`.
pub async fn start_run(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<StartRunRequest>,
) -> axum::response::Response {
    let parameter = match dto::parse_parameter(&body.parameter) {
        Ok(p) => p,
        Err(resp) => return resp,
    };

    let run = match services.orchestrator.create_run(parameter).await {
        Ok(run) => run,
        Err(e) => return errors::orchestrator_error_to_response(e),
    };
    let view = RunView::from(&run);

    let orchestrator = services.orchestrator.clone();
    tokio::spawn(async move {
        let run_id = run.run_id;
        if let Err(e) = orchestrator.drive(run).await {
            tracing::error!(run_id = %run_id, error = %e, "run could not be driven");
        }
    });

    (StatusCode::ACCEPTED, Json(view)).into_response()
}

pub async fn get_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match dto::parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.run(run_id).await {
        Ok(run) => Json(RunView::from(&run)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn list_runs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListRunsQuery>,
) -> axum::response::Response {
    let parameter = match query.parameter.as_deref() {
        Some(raw) => match dto::parse_parameter(raw) {
            Ok(p) => Some(p),
            Err(resp) => return resp,
        },
        None => None,
    };

    match services.orchestrator.runs_for(parameter.as_ref(), query.limit()).await {
        Ok(runs) => {
            let views: Vec<RunView> = runs.iter().map(RunView::from).collect();
            Json(views).into_response()
        }
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}

pub async fn cancel_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match dto::parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.orchestrator.cancel(run_id).await {
        Ok(run) => Json(RunView::from(&run)).into_response(),
        Err(e) => errors::orchestrator_error_to_response(e),
    }
}
