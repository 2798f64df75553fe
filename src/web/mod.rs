mod handlers;
mod routes;
mod ws;

pub use handlers::signal_handler;
pub use routes::create_router;
pub use ws::ws_handler;
