mod error;
mod models;
mod repacketize;
mod server;
mod translate;

pub use error::{ProxyError, StreamError};
pub use models::{ModelMap, ModelMapping};
pub use repacketize::{DELIMITER, FrameBuffer, Pacing, repacketize};
pub use server::{AppState, ProxyServer, create_router};
pub use translate::{
    API_KEY_HEADER, Backend, Endpoint, OutboundTarget, ProxyRequest, Route, normalize_path,
    translate,
};
