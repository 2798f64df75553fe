//! Socket and logging helpers shared by the web server and RTP ingest

pub mod net;
pub mod throttle;

pub use net::{bind_tcp_listener, bind_udp_socket};
pub use throttle::LogThrottler;
