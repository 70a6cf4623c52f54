//! Local development mode: a loopback HTTP server that stands in for the
//! platform control plane.

mod pool;
mod server;

pub(crate) use server::run_local;
