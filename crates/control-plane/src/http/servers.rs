use super::*;

pub(super) async fn index(State(state): State<AppState>) -> ApiResult<Json<Vec<ServerView>>> {
    let metrics = state.coordinator.metrics();
    let ratio = state.db.settings().await.traffic_ratio;

    let used_for = |server: &Server| {
        metrics
            .servers
            .get(&server.id)
            .map(|m| used_megabytes(m.total, ratio))
            .unwrap_or(0)
    };

    let local = state.coordinator.current_server().await;
    let mut views = vec![ServerView {
        used: used_for(&local),
        server: local,
    }];
    for server in state.db.servers().await {
        views.push(ServerView {
            used: used_for(&server),
            server,
        });
    }

    Ok(Json(views))
}

pub(super) async fn store(
    State(state): State<AppState>,
    Json(request): Json<StoreServerRequest>,
) -> ApiResult<(StatusCode, Json<ServerView>)> {
    let server = state
        .db
        .store_server(NewServer {
            http_host: request.http_host,
            http_port: request.http_port,
            api_token: request.api_token,
        })
        .await?;

    spawn_sync(&state);
    Ok((StatusCode::CREATED, Json(ServerView { server, used: 0 })))
}

pub(super) async fn update(
    State(state): State<AppState>,
    Json(request): Json<UpdateServerRequest>,
) -> ApiResult<Json<ServerView>> {
    // The engine fields, status, and sync stamp are owned by the pull/push
    // protocols; only the management endpoint and token are settable here.
    let Some(existing) = state.db.find_server(&request.id).await else {
        return Err(AppError::not_found("server not found"));
    };

    let candidate = Server {
        http_host: request.fields.http_host,
        http_port: request.fields.http_port,
        api_token: request.fields.api_token,
        ..existing
    };

    let Some(server) = state.db.update_server(candidate).await? else {
        return Err(AppError::not_found("server not found"));
    };

    spawn_sync(&state);

    let ratio = state.db.settings().await.traffic_ratio;
    let used = state
        .coordinator
        .metrics()
        .servers
        .get(&server.id)
        .map(|m| used_megabytes(m.total, ratio))
        .unwrap_or(0);

    Ok(Json(ServerView { server, used }))
}

pub(super) async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.db.delete_server(&id).await?;
    spawn_sync(&state);
    Ok(StatusCode::NO_CONTENT)
}
