use super::*;

pub(super) async fn health() -> StatusCode {
    StatusCode::NO_CONTENT
}

/// Relay the local engine's prometheus exporter so the collector scrapes
/// every node through its management address.
pub(super) async fn metrics(State(state): State<AppState>) -> Response {
    let url = format!(
        "http://127.0.0.1:{}/metrics",
        state.coordinator.metrics_port()
    );

    let response = match reqwest::get(&url).await {
        Ok(response) => response,
        Err(_) => {
            return (StatusCode::BAD_GATEWAY, "engine metrics unavailable").into_response();
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("text/plain; charset=utf-8")
        .to_string();

    match response.bytes().await {
        Ok(body) => (
            status,
            [(header::CONTENT_TYPE, content_type)],
            body.to_vec(),
        )
            .into_response(),
        Err(_) => (StatusCode::BAD_GATEWAY, "engine metrics unavailable").into_response(),
    }
}
