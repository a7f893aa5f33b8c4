pub mod forwarder;
pub mod middleware;
pub mod routes;
pub mod state;
