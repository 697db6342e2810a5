//! Client-facing side of the balancer.
//!
//! Accepts connections on the listen socket and hands each one to the
//! dispatcher as an unconnected client.

mod listener;

pub use listener::FrontendListener;
