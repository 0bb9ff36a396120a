use std::future::Future;
use std::net::SocketAddr;

use log::info;
use warp::Filter;

use crate::web_interface::routes::*;

/// HTTP and WebSocket front end of the session core.
pub struct WebServer {
    state: ApiState,
}

impl WebServer {
    pub fn new(state: ApiState) -> Self {
        Self { state }
    }

    /// Serves until `shutdown` resolves.
    pub async fn start<F>(&self, addr: SocketAddr, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let state = self.state.clone();

        let sandbox = create_sandbox_route(state.clone())
            .or(read_files_route(state.clone()))
            .or(write_file_route(state.clone()))
            .or(terminal_input_route(state.clone()))
            .or(terminal_resize_route(state.clone()))
            .or(run_route(state.clone()))
            .or(submit_route(state.clone()));

        let sessions = end_session_route(state.clone())
            .or(session_events_route(state.clone()))
            .or(terminal_socket_route(state));

        let routes = health_route()
            .or(sandbox)
            .or(sessions)
            .recover(handle_rejection)
            .with(warp::log("atrium::http"));

        info!("Web interface listening on {}", addr);
        tokio::select! {
            _ = warp::serve(routes).run(addr) => {}
            _ = shutdown => info!("Web interface shutting down"),
        }
    }
}
