#![allow(dead_code)]

mod dirs;
mod harness;
mod http_utils;
mod net;
mod origin;

pub use dirs::TestDirs;
pub use harness::{ProxyHarness, ProxyHarnessBuilder};
pub use http_utils::{read_http_response, read_http_response_bytes};
pub use net::{find_free_port, wait_for_listener};
pub use origin::MockOrigin;
