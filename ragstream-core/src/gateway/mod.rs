//! # HTTP Gateway
//!
//! Exposes the RAG pipeline over HTTP: a plain-text generation endpoint, a
//! Server-Sent-Events streaming endpoint, and a health check.

mod server;

pub use server::{
    GatewayState, SharedGateway, StreamParams, router as gateway_router, run as run_gateway,
    shutdown_signal,
};
