mod http;
mod interface;
mod types;

pub use http::VyosClient;
pub use interface::VyosApi;
pub use types::{NetSet, VyosCommandResponse, VyosConfigCommand, VyosConfigOperation};
