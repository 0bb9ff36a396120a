// Web Interface module root
pub mod routes;
pub mod terminal_socket;
pub mod types;
pub mod web_server;

pub use routes::ApiState;
pub use web_server::WebServer;
