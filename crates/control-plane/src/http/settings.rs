use super::*;

use common::api::Settings;

pub(super) async fn show(State(state): State<AppState>) -> ApiResult<Json<SettingsView>> {
    Ok(Json(SettingsView {
        settings: state.db.settings().await,
        http_port: state.http_port,
    }))
}

pub(super) async fn update(
    State(state): State<AppState>,
    Json(request): Json<Settings>,
) -> ApiResult<Json<SettingsView>> {
    let settings = state.db.update_settings(request).await?;
    spawn_sync(&state);
    Ok(Json(SettingsView {
        settings,
        http_port: state.http_port,
    }))
}
