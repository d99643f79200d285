//! REST endpoints for operators

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::Utc;
use tracing::info;

use crate::{
    identity::DeviceIdentity,
    protocol::{Command, WireMessage},
    registry::{
        error::{ApiError, ApiResult},
        state::RegistryState,
        types::{
            CommandAccepted, CommandRequest, HealthResponse, PhaseRequest, SiteDetail, SiteInfo,
            SitesResponse,
        },
    },
};

/// GET /api/v1/health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: Utc::now().to_rfc3339(),
    })
}

/// GET /api/v1/sites
pub async fn list_sites(State(state): State<RegistryState>) -> Json<SitesResponse> {
    let sites: Vec<SiteInfo> = state.sites().await.iter().map(SiteInfo::from).collect();
    Json(SitesResponse {
        count: sites.len(),
        sites,
    })
}

/// GET /api/v1/sites/:id
pub async fn get_site(
    State(state): State<RegistryState>,
    Path(site_id): Path<String>,
) -> ApiResult<Json<SiteDetail>> {
    let view = state
        .site(&site_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("unknown site: {site_id}")))?;

    Ok(Json(SiteDetail {
        site: SiteInfo::from(&view),
        last_job: view.last_job,
        recent_results: view.recent_results.into_iter().map(Into::into).collect(),
    }))
}

/// POST /api/v1/sites/:id/commands
///
/// Forwards a command to the connected device. Validation happens on the device; an
/// unknown action comes back as a rejected `command_result`.
pub async fn send_command(
    State(state): State<RegistryState>,
    Path(site_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> ApiResult<(StatusCode, Json<CommandAccepted>)> {
    if request.action.trim().is_empty() {
        return Err(ApiError::InvalidRequest("action must not be empty".into()));
    }
    let mut command = Command::new(request.action);
    if let Some(id) = request.id {
        command.id = id;
    }
    command.parameters = request.parameters;
    command.requested_by = request.requested_by;
    let command_id = command.id.clone();

    ensure_known(&state, &site_id).await?;
    if !state.dispatch(&site_id, WireMessage::Command(command)).await {
        return Err(ApiError::NotConnected(format!("{site_id} is not connected")));
    }

    info!("dispatched command {command_id} to {site_id}");
    Ok((StatusCode::ACCEPTED, Json(CommandAccepted { command_id })))
}

/// POST /api/v1/sites/:id/phase
pub async fn set_phase(
    State(state): State<RegistryState>,
    Path(site_id): Path<String>,
    Json(request): Json<PhaseRequest>,
) -> ApiResult<StatusCode> {
    ensure_known(&state, &site_id).await?;
    if !state
        .dispatch(&site_id, WireMessage::SetPhase { phase: request.phase })
        .await
    {
        return Err(ApiError::NotConnected(format!("{site_id} is not connected")));
    }

    info!("requested phase {} on {site_id}", request.phase);
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/v1/sites/:id/credentials
///
/// Issues a new api key for the site. Provisioning a new site works the same way.
pub async fn issue_credentials(
    State(state): State<RegistryState>,
    Path(site_id): Path<String>,
) -> ApiResult<(StatusCode, Json<DeviceIdentity>)> {
    if site_id.trim().is_empty() {
        return Err(ApiError::InvalidRequest("site id must not be empty".into()));
    }
    let identity = state.issue(&site_id).await?;
    Ok((StatusCode::CREATED, Json(identity)))
}

async fn ensure_known(state: &RegistryState, site_id: &str) -> ApiResult<()> {
    if state.is_known(site_id).await {
        Ok(())
    } else {
        Err(ApiError::NotFound(format!("unknown site: {site_id}")))
    }
}
