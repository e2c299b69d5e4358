mod gateway;

pub use gateway::{build_router, ApiError, Gateway, GatewayState};

// Response shapes, for integration tests and API clients
pub use gateway::{HealthResponse, InstanceView, InstancesResponse, SessionView, SessionsResponse};
