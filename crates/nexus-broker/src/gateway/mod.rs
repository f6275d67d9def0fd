//! HTTP front end for the broker.

mod http;

pub use http::{
    DiscoverRequestBody, ExecuteRequestBody, GatewayState, RegisterRequestBody, router, run_http,
    validate_register_request,
};
