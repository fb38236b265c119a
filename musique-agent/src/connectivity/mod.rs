//! Backend connectivity: REST login/stream resolution and the Socket.IO
//! push channel

pub mod http;
pub mod socketio;

pub use http::{extract_stream_url, HttpBackend};
pub use socketio::SocketIoConnector;
