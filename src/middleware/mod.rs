pub mod api_key_auth;
pub mod logging;
pub mod rate_limit;
