use std::convert::Infallible;
use std::sync::Arc;

use log::{debug, error, warn};
use serde::Serialize;
use uuid::Uuid;
use warp::{http::StatusCode, reply, reply::Response, Filter, Rejection, Reply};

use crate::code_execution::command_runner::CommandRunner;
use crate::error_handling::types::SessionError;
use crate::session_management::project_files::ProjectFiles;
use crate::session_management::session_manager::SessionManager;
use crate::terminal_relay::relay::{TerminalRelay, TerminalSize};
use crate::web_interface::terminal_socket::run_terminal_socket;
use crate::web_interface::types::*;

/// Everything the HTTP handlers need, cloned into each filter.
#[derive(Clone)]
pub struct ApiState {
    pub sessions: Arc<SessionManager>,
    pub files: Arc<ProjectFiles>,
    pub relay: Arc<TerminalRelay>,
    pub runner: Arc<CommandRunner>,
    /// Used when a terminal client does not send its size.
    pub default_size: TerminalSize,
}

fn with_state(state: ApiState) -> impl Filter<Extract = (ApiState,), Error = Infallible> + Clone {
    warp::any().map(move || state.clone())
}

/// Stable HTTP status for each failure class.
pub fn status_for(err: &SessionError) -> StatusCode {
    match err {
        SessionError::NotFound(_) => StatusCode::NOT_FOUND,
        SessionError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SessionError::StaleHandle(_) | SessionError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        SessionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        SessionError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
    }
}

fn error_response(status: StatusCode, message: String) -> Response {
    reply::with_status(reply::json(&ApiError { error: message }), status).into_response()
}

fn json_result<T: Serialize>(result: Result<T, SessionError>) -> Response {
    match result {
        Ok(body) => reply::with_status(reply::json(&body), StatusCode::OK).into_response(),
        Err(e) => {
            let status = status_for(&e);
            if status.is_server_error() {
                warn!("Request failed with {}: {}", status, e);
            } else {
                debug!("Request rejected with {}: {}", status, e);
            }
            error_response(status, e.to_string())
        }
    }
}

fn parse_session_id(raw: &str) -> Result<Uuid, Response> {
    Uuid::parse_str(raw).map_err(|_| {
        error_response(StatusCode::BAD_REQUEST, String::from("Invalid session id"))
    })
}

/// POST /sandbox/create
pub fn create_sandbox_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "create")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(|req: SessionRequest, state: ApiState| async move {
            let result = state.sessions.create_session_sandbox(req.session_id).await;
            Ok::<_, Rejection>(json_result(result))
        })
}

/// GET /sandbox/files: the listing, or one file when `path` is given.
pub fn read_files_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "files")
        .and(warp::get())
        .and(warp::query::<FilesQuery>())
        .and(with_state(state))
        .and_then(|query: FilesQuery, state: ApiState| async move {
            let response = match query.path {
                Some(path) => json_result(
                    state
                        .files
                        .read(query.session_id, &path)
                        .await
                        .map(|content| FileContentResponse { path, content }),
                ),
                None => json_result(
                    state
                        .files
                        .list(query.session_id)
                        .await
                        .map(|files| FileListResponse { files }),
                ),
            };
            Ok::<_, Rejection>(response)
        })
}

/// PUT /sandbox/files
pub fn write_file_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "files")
        .and(warp::put())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(|req: WriteFileRequest, state: ApiState| async move {
            let result = state
                .files
                .write(req.session_id, &req.path, &req.content)
                .await
                .map(|path| WriteFileResponse {
                    success: true,
                    path,
                });
            Ok::<_, Rejection>(json_result(result))
        })
}

/// POST /sandbox/input
pub fn terminal_input_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "input")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(|req: InputRequest, state: ApiState| async move {
            let result = state
                .relay
                .send_input(req.session_id, req.data.as_bytes())
                .await
                .map(|()| SuccessResponse { success: true });
            Ok::<_, Rejection>(json_result(result))
        })
}

/// POST /sandbox/resize
pub fn terminal_resize_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "resize")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(|req: ResizeRequest, state: ApiState| async move {
            let size = TerminalSize {
                cols: req.cols,
                rows: req.rows,
            };
            let result = state
                .relay
                .resize(req.session_id, size)
                .await
                .map(|()| SuccessResponse { success: true });
            Ok::<_, Rejection>(json_result(result))
        })
}

/// POST /sandbox/run
pub fn run_route(state: ApiState) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "run")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(|req: RunRequest, state: ApiState| async move {
            let result = state.runner.run(req.session_id, req.command).await;
            Ok::<_, Rejection>(json_result(result))
        })
}

/// POST /sandbox/submit
pub fn submit_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sandbox" / "submit")
        .and(warp::post())
        .and(warp::body::json())
        .and(with_state(state))
        .and_then(|req: SessionRequest, state: ApiState| async move {
            let result = state.runner.submit(req.session_id).await;
            Ok::<_, Rejection>(json_result(result))
        })
}

/// POST /sessions/:id/end
pub fn end_session_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / String / "end")
        .and(warp::post())
        .and(with_state(state))
        .and_then(|id_str: String, state: ApiState| async move {
            let session_id = match parse_session_id(&id_str) {
                Ok(id) => id,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            let result = state
                .sessions
                .end_session(session_id)
                .await
                .map(|status| StatusResponse { status });
            Ok::<_, Rejection>(json_result(result))
        })
}

/// GET /sessions/:id/events
pub fn session_events_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / String / "events")
        .and(warp::get())
        .and(with_state(state))
        .and_then(|id_str: String, state: ApiState| async move {
            let session_id = match parse_session_id(&id_str) {
                Ok(id) => id,
                Err(res) => return Ok::<_, Rejection>(res),
            };
            Ok::<_, Rejection>(json_result(state.sessions.events(session_id).await))
        })
}

/// GET /sessions/:id/terminal, upgraded to a WebSocket.
pub fn terminal_socket_route(
    state: ApiState,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("sessions" / String / "terminal")
        .and(warp::get())
        .and(warp::ws())
        .and(warp::query::<TerminalQuery>())
        .and(with_state(state))
        .and_then(
            |id_str: String, ws: warp::ws::Ws, query: TerminalQuery, state: ApiState| async move {
                let session_id = match parse_session_id(&id_str) {
                    Ok(id) => id,
                    Err(res) => return Ok::<_, Rejection>(res),
                };
                let size = TerminalSize {
                    cols: query.cols.unwrap_or(state.default_size.cols),
                    rows: query.rows.unwrap_or(state.default_size.rows),
                };
                let relay = state.relay.clone();
                let upgrade = ws.on_upgrade(move |socket| {
                    run_terminal_socket(socket, session_id, size, relay)
                });
                Ok::<_, Rejection>(upgrade.into_response())
            },
        )
}

/// GET /health
pub fn health_route() -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    warp::path!("health").and(warp::get()).map(|| "ok")
}

/// Turns warp's own rejections into the same `{"error": ...}` shape as handler failures.
pub async fn handle_rejection(err: Rejection) -> Result<Response, Infallible> {
    let (status, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, String::from("Not found"))
    } else if let Some(e) = err.find::<warp::filters::body::BodyDeserializeError>() {
        (StatusCode::BAD_REQUEST, format!("Invalid request body: {}", e))
    } else if let Some(e) = err.find::<warp::reject::InvalidQuery>() {
        (StatusCode::BAD_REQUEST, format!("Invalid query: {}", e))
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            String::from("Method not allowed"),
        )
    } else {
        error!("Unhandled rejection: {:?}", err);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            String::from("Internal server error"),
        )
    };
    Ok(error_response(status, message))
}
