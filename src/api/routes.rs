//! Engine API Routes
//! Mission: Bind the Engine Facade to HTTP under /api/engine, gated by role

use crate::auth::middleware::extract_claims;
use crate::auth::models::UserRole;
use crate::domain::{PositionStatus, PriceTick, TradeSignal};
use crate::engine::Engine;
use crate::error::EngineError;
use axum::{
    extract::{Path, Request, State},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;

fn require_role(req: &Request, allowed: &[UserRole]) -> Result<(), RouteError> {
    let claims = extract_claims(req).ok_or(RouteError::Unauthorized)?;
    if allowed.contains(&claims.role) {
        Ok(())
    } else {
        Err(RouteError::Forbidden)
    }
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/positions", post(create_position))
        .route("/positions/:id", get(get_position))
        .route("/positions/:id/fills/partial", post(process_partial_fill))
        .route("/positions/:id/fills/full", post(process_full_fill))
        .route("/positions/:id/pnl", post(update_position_pnl))
        .route("/positions/:id/metrics", get(get_position_metrics))
        .route("/positions/status/:status", get(get_positions_by_status))
        .route("/positions/account/:account_id", get(get_positions_by_account))
        .route("/positions/watched", get(get_open_positions_with_sltp))
        .route("/market/price", post(update_market_price))
        .route("/accounts/:account_id/margin", get(check_margin_requirements))
        .route("/accounts/:account_id/liquidate", post(trigger_liquidation))
        .route("/system/state", get(get_system_state))
        .route("/system/statistics", get(get_engine_statistics))
        .route("/system/checkpoint", post(create_system_checkpoint))
        .route("/system/integrity", post(perform_integrity_check))
        .route("/system/recover", post(recover_system_state))
        .route("/operations/:id", get(get_operation_progress))
        .route("/operations/:id/cancel", post(cancel_operation))
        .route("/operations/timeouts", get(get_timeout_statistics))
        .with_state(engine)
}

async fn create_position(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Admin])?;
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|_| RouteError::BadRequest("could not read request body".into()))?;
    let signal: TradeSignal =
        serde_json::from_slice(&bytes).map_err(|e| RouteError::BadRequest(e.to_string()))?;

    let position = engine.create_position(signal).await?;
    Ok(Json(position).into_response())
}

async fn get_position(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Viewer, UserRole::Admin])?;
    let position = engine.get_position(&id).await?;
    Ok(Json(position).into_response())
}

#[derive(Debug, Deserialize)]
struct FillRequest {
    order_id: String,
    price: Decimal,
    size: Decimal,
    is_entry: bool,
}

async fn process_partial_fill(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Admin])?;
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|_| RouteError::BadRequest("could not read request body".into()))?;
    let body: FillRequest =
        serde_json::from_slice(&bytes).map_err(|e| RouteError::BadRequest(e.to_string()))?;

    let fill = crate::domain::FillData {
        order_id: body.order_id,
        price: body.price,
        size: body.size,
        executed_at: chrono::Utc::now(),
    };
    let position = engine.process_partial_fill(&id, fill, body.is_entry).await?;
    Ok(Json(position).into_response())
}

async fn process_full_fill(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Admin])?;
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|_| RouteError::BadRequest("could not read request body".into()))?;
    let body: FillRequest =
        serde_json::from_slice(&bytes).map_err(|e| RouteError::BadRequest(e.to_string()))?;

    let fill = crate::domain::FillData {
        order_id: body.order_id,
        price: body.price,
        size: body.size,
        executed_at: chrono::Utc::now(),
    };
    let position = engine.process_full_fill(&id, fill, body.is_entry).await?;
    Ok(Json(position).into_response())
}

#[derive(Debug, Deserialize)]
struct MarketPriceUpdate {
    price: Decimal,
}

async fn update_position_pnl(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Admin])?;
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|_| RouteError::BadRequest("could not read request body".into()))?;
    let body: MarketPriceUpdate =
        serde_json::from_slice(&bytes).map_err(|e| RouteError::BadRequest(e.to_string()))?;
    let position = engine.update_position_pnl(&id, body.price).await?;
    Ok(Json(position).into_response())
}

async fn get_position_metrics(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Viewer, UserRole::Admin])?;
    let metrics = engine.get_position_metrics(&id).await?;
    Ok(Json(metrics).into_response())
}

async fn get_positions_by_status(
    State(engine): State<Arc<Engine>>,
    Path(status): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Viewer, UserRole::Admin])?;
    let status = PositionStatus::from_str(&status)
        .ok_or_else(|| RouteError::BadRequest(format!("unknown status: {status}")))?;
    let positions = engine.get_positions_by_status(status).await?;
    Ok(Json(positions).into_response())
}

async fn get_positions_by_account(
    State(engine): State<Arc<Engine>>,
    Path(account_id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Viewer, UserRole::Admin])?;
    let positions = engine.get_positions_by_account(&account_id).await?;
    Ok(Json(positions).into_response())
}

async fn get_open_positions_with_sltp(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Viewer, UserRole::Admin])?;
    let positions = engine.get_open_positions_with_sltp().await?;
    Ok(Json(positions).into_response())
}

async fn update_market_price(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Admin])?;
    let bytes = axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|_| RouteError::BadRequest("could not read request body".into()))?;
    let tick: PriceTick =
        serde_json::from_slice(&bytes).map_err(|e| RouteError::BadRequest(e.to_string()))?;
    let touched = engine.update_market_price(tick).await?;
    Ok(Json(touched).into_response())
}

async fn check_margin_requirements(
    State(engine): State<Arc<Engine>>,
    Path(account_id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Trader, UserRole::Viewer, UserRole::Admin])?;
    let status = engine.check_margin_requirements(&account_id).await?;
    Ok(Json(serde_json::json!({
        "equity": status.equity,
        "marginUsed": status.margin_used,
        "marginLevel": status.margin_level,
        "marginCallTriggered": status.margin_call_triggered,
        "liquidationTriggered": status.liquidation_triggered,
    }))
    .into_response())
}

async fn trigger_liquidation(
    State(engine): State<Arc<Engine>>,
    Path(account_id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Admin])?;
    let report = engine.trigger_liquidation(&account_id).await?;
    Ok(Json(serde_json::json!({
        "accountId": report.account_id,
        "closedPositionIds": report.closed_position_ids,
        "failedPositionIds": report.failed_position_ids,
    }))
    .into_response())
}

async fn get_system_state(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Viewer, UserRole::Admin])?;
    let state = engine.get_system_state().await?;
    Ok(Json(state).into_response())
}

async fn get_engine_statistics(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Viewer, UserRole::Admin])?;
    let stats = engine.get_engine_statistics().await?;
    Ok(Json(stats).into_response())
}

async fn create_system_checkpoint(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Admin])?;
    let checkpoint = engine.create_system_checkpoint().await?;
    Ok(Json(checkpoint).into_response())
}

async fn perform_integrity_check(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Admin])?;
    let report = engine.perform_integrity_check().await?;
    Ok(Json(report).into_response())
}

async fn recover_system_state(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Admin])?;
    let report = engine.recover_system_state().await?;
    Ok(Json(report).into_response())
}

async fn get_operation_progress(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Viewer, UserRole::Admin])?;
    match engine.get_operation_progress(&id).await {
        Some(progress) => Ok(Json(progress).into_response()),
        None => Err(RouteError::NotFound),
    }
}

async fn cancel_operation(
    State(engine): State<Arc<Engine>>,
    Path(id): Path<String>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Admin])?;
    let cancelled = engine.cancel_operation(&id).await;
    Ok(Json(serde_json::json!({ "cancelled": cancelled })).into_response())
}

async fn get_timeout_statistics(
    State(engine): State<Arc<Engine>>,
    req: Request,
) -> Result<Response, RouteError> {
    require_role(&req, &[UserRole::Viewer, UserRole::Admin])?;
    let count = engine.get_timeout_statistics().await;
    Ok(Json(serde_json::json!({ "timeoutsObserved": count })).into_response())
}

#[derive(Debug)]
enum RouteError {
    Unauthorized,
    Forbidden,
    NotFound,
    BadRequest(String),
    Engine(EngineError),
}

impl From<EngineError> for RouteError {
    fn from(e: EngineError) -> Self {
        RouteError::Engine(e)
    }
}

impl IntoResponse for RouteError {
    fn into_response(self) -> Response {
        match self {
            RouteError::Unauthorized => {
                (axum::http::StatusCode::UNAUTHORIZED, "authentication required").into_response()
            }
            RouteError::Forbidden => {
                (axum::http::StatusCode::FORBIDDEN, "insufficient permissions").into_response()
            }
            RouteError::NotFound => (axum::http::StatusCode::NOT_FOUND, "not found").into_response(),
            RouteError::BadRequest(msg) => (axum::http::StatusCode::BAD_REQUEST, msg).into_response(),
            RouteError::Engine(e) => e.into_response(),
        }
    }
}
