pub mod http;
pub mod rpc;

pub use http::{AppState, create_router};
pub use rpc::{RpcServer, RpcServerConfig};
