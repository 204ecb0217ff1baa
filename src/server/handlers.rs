// src/server/handlers.rs

//! Request handlers for the package and build-action endpoints

use crate::actions::{ActionManager, BuildAction, BuildActionId};
use crate::database::SearchMode;
use crate::packages::Package;
use crate::setup::ServiceSetup;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct PackagesQuery {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub details: Option<u8>,
}

/// GET /api/v0/packages?mode=<m>&name=<q>[&details=1]
pub async fn search_packages(
    State(setup): State<Arc<ServiceSetup>>,
    Query(query): Query<PackagesQuery>,
) -> Response {
    let mode = match query.mode.as_deref() {
        None => SearchMode::NameContains,
        Some(mode_str) => match SearchMode::from_str(mode_str) {
            Some(mode) => mode,
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    format!("invalid search mode \"{mode_str}\""),
                )
                    .into_response()
            }
        },
    };

    let config = setup.config.read().expect("config lock poisoned");
    let results = config.find_packages(mode, &query.name);
    if query.details == Some(1) {
        let packages: Vec<Package> = results.into_iter().map(|result| result.pkg).collect();
        return Json(packages).into_response();
    }
    Json(results).into_response()
}

/// GET /api/v0/build-actions
pub async fn list_build_actions(State(setup): State<Arc<ServiceSetup>>) -> Response {
    Json(ActionManager::list(&setup)).into_response()
}

/// Request body for creating a build action
#[derive(Debug, Deserialize)]
pub struct NewBuildActionRequest {
    /// Type slug, e.g. "prepare-build"
    #[serde(rename = "type")]
    pub type_slug: String,
    #[serde(default)]
    pub task_name: String,
    #[serde(default)]
    pub directory: String,
    #[serde(default)]
    pub source_dbs: Vec<String>,
    #[serde(default)]
    pub destination_dbs: Vec<String>,
    #[serde(default)]
    pub package_names: Vec<String>,
    /// Flag parameter names, e.g. ["clean-src-dir"]
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub settings: HashMap<String, String>,
    #[serde(default)]
    pub start_after: Vec<BuildActionId>,
    /// Enqueue immediately; otherwise the action stays in `Created`
    #[serde(default = "default_true")]
    pub start_immediately: bool,
}

fn default_true() -> bool {
    true
}

/// POST /api/v0/build-actions
pub async fn create_build_action(
    State(setup): State<Arc<ServiceSetup>>,
    Json(request): Json<NewBuildActionRequest>,
) -> Response {
    let (action_type, flags) = {
        let building = setup.building.read().expect("building lock poisoned");
        let type_info = building.meta.type_info_for_name(&request.type_slug);
        if !type_info.is_valid() {
            return (
                StatusCode::BAD_REQUEST,
                format!("invalid build action type \"{}\"", request.type_slug),
            )
                .into_response();
        }
        let action_type = type_info.id;
        (
            action_type,
            building.meta.flags_from_params(action_type, &request.flags),
        )
    };

    let mut draft = BuildAction::new(0, action_type);
    draft.task_name = request.task_name;
    draft.directory = request.directory;
    draft.source_dbs = request.source_dbs;
    draft.destination_dbs = request.destination_dbs;
    draft.package_names = request.package_names;
    draft.flags = flags;
    draft.settings = request.settings;
    draft.start_after = request.start_after;

    let action = ActionManager::create(&setup, draft);
    let id = action.read().expect("action lock poisoned").id;
    if request.start_immediately {
        if let Err(e) = ActionManager::enqueue(&setup, id) {
            return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
        }
    }
    let snapshot = action.read().expect("action lock poisoned").clone();
    (StatusCode::CREATED, Json(snapshot)).into_response()
}

/// GET /api/v0/build-actions/{id}
pub async fn get_build_action(
    State(setup): State<Arc<ServiceSetup>>,
    Path(id): Path<BuildActionId>,
) -> Response {
    match ActionManager::get(&setup, id) {
        Some(action) => {
            let snapshot = action.read().expect("action lock poisoned").clone();
            Json(snapshot).into_response()
        }
        None => (StatusCode::NOT_FOUND, "no such build action").into_response(),
    }
}

/// POST /api/v0/build-actions/{id}/abort
pub async fn abort_build_action(
    State(setup): State<Arc<ServiceSetup>>,
    Path(id): Path<BuildActionId>,
) -> Response {
    match ActionManager::abort(&setup, id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{BuildActionMetaInfo, BuildActionType};

    #[test]
    fn test_request_deserialization_defaults() {
        let request: NewBuildActionRequest =
            serde_json::from_str(r#"{"type": "clean-repository"}"#).unwrap();
        assert!(request.start_immediately);
        assert!(request.package_names.is_empty());
        let meta = BuildActionMetaInfo::new();
        assert_eq!(
            meta.type_info_for_name(&request.type_slug).id,
            BuildActionType::CleanRepository
        );
    }
}
