mod schema;

pub use schema::{
    Config, GatewayConfig, PermissionsConfig, RateLimitSettings, SessionConfig,
};
