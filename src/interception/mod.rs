// src/interception/mod.rs
//! Network interception layer
//!
//! - **HTTP Interceptor**: reporting adapter around the host's request primitive
//! - **Ignore List**: host patterns that are never reported
//!
//! # Architecture
//!
//! ```text
//! host code
//!     │
//!     └─ fetch() → InterceptingPrimitive → host NetworkPrimitive
//!                        │ on completion
//!                        ↓
//!                 Agent (context stamp) → DeliveryQueue ("network")
//! ```

pub mod http_interceptor;
pub mod ignore_list;

pub use http_interceptor::{
    InterceptingPrimitive, InterceptorConfig, NetworkPrimitive, NetworkRequest, NetworkResponse,
};
pub use ignore_list::IgnoreList;
