pub mod codec;
pub mod origin;
mod pipeline;

pub use pipeline::{handle_http, send_response, shutdown_stream};
