use super::*;

pub(super) async fn index(State(state): State<AppState>) -> ApiResult<Json<Vec<KeyView>>> {
    let settings = state.db.settings().await;
    let metrics = state.coordinator.metrics();

    let views = state
        .db
        .keys()
        .await
        .into_iter()
        .map(|key| {
            let used = metrics
                .keys
                .get(&key.id)
                .map(|m| used_megabytes(m.total, settings.traffic_ratio))
                .unwrap_or(0);
            KeyView { key, used }
        })
        .collect();

    Ok(Json(views))
}

pub(super) async fn store(
    State(state): State<AppState>,
    Json(request): Json<StoreKeyRequest>,
) -> ApiResult<(StatusCode, Json<KeyView>)> {
    let key = state
        .db
        .store_key(NewKey {
            cipher: request.cipher,
            secret: request.secret,
            name: request.name,
            quota: request.quota,
            enabled: request.enabled,
        })
        .await?;

    spawn_sync(&state);
    Ok((StatusCode::CREATED, Json(KeyView { key, used: 0 })))
}

pub(super) async fn update(
    State(state): State<AppState>,
    Json(request): Json<UpdateKeyRequest>,
) -> ApiResult<Json<KeyView>> {
    let candidate = Key {
        id: request.id,
        code: String::new(),
        cipher: request.fields.cipher,
        secret: request.fields.secret,
        name: request.fields.name,
        quota: request.fields.quota,
        enabled: request.fields.enabled,
    };

    let Some(key) = state.db.update_key(candidate).await? else {
        return Err(AppError::not_found("key not found"));
    };

    spawn_sync(&state);

    let settings = state.db.settings().await;
    let used = state
        .coordinator
        .metrics()
        .keys
        .get(&key.id)
        .map(|m| used_megabytes(m.total, settings.traffic_ratio))
        .unwrap_or(0);

    Ok(Json(KeyView { key, used }))
}

pub(super) async fn destroy(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.db.delete_key(&id).await?;
    spawn_sync(&state);
    Ok(StatusCode::NO_CONTENT)
}

/// Full key-set replacement pushed by the fleet coordinator.
pub(super) async fn refill(
    State(state): State<AppState>,
    Json(keys): Json<Vec<Key>>,
) -> ApiResult<StatusCode> {
    state.db.fill_keys(keys).await?;
    spawn_sync(&state);
    Ok(StatusCode::NO_CONTENT)
}
