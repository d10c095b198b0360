//! JSON-RPC control surface over HTTP.
//!
//! Speaks the Transmission RPC dialect: a session-id header against CSRF,
//! optional basic auth with a brute-force lockout, address and host
//! whitelists, static web-client assets, and a single `POST <prefix>rpc`
//! endpoint whose JSON body names the method to run.

mod server;

pub use server::{RpcConfig, RpcHandler, RpcServer, SESSION_ID_HEADER};
