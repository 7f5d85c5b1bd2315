//! Admission, quota and routing engine for an OpenAI-compatible LLM gateway.

mod error;
pub mod gateway;

pub use error::{Result, TollgateError};
pub use gateway::{
    Gateway, GatewayConfig, GatewayError, GatewayRequest, GatewayResponse, Identity, Scope,
    ScopeKind,
};
