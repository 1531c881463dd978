//! Protocol buffer definitions for the mantle serving proxy.
//!
//! This crate provides the gRPC service and message definitions shared by the
//! proxy and cache roles and by the downstream serving backend:
//!
//! - [`PredictionService`](serving::v1::prediction_service_server::PredictionService) /
//!   [`SessionService`](serving::v1::session_service_server::SessionService) — the
//!   inference surface. The proxy implements these services and forwards every
//!   call, unchanged, to the replica that owns the requested model.
//! - [`ModelService`](serving::v1::model_service_server::ModelService) — the
//!   backend's management surface: config reload and per-model status. Only the
//!   client side is used by mantle; the backend serves it.
//! - `grpc.health.v1.Health` — the standard health service, served natively on
//!   both gRPC listeners.
//!
//! The same proto package is used on both sides of the proxy, which is what
//! makes pass-through forwarding possible: a request decoded from a client
//! re-encodes byte-identically towards the backend.

// Generated protobuf code doesn't have docs
#![allow(missing_docs)]

/// Generated types for the serving surface
pub mod serving {
    /// Version 1 of the serving protocol
    pub mod v1 {
        tonic::include_proto!("mantle.serving.v1");
    }
}

/// Generated types for the standard gRPC health protocol
pub mod health {
    /// grpc.health.v1
    pub mod v1 {
        tonic::include_proto!("grpc.health.v1");
    }
}

pub use serving::v1::*;

#[cfg(test)]
mod tests {
    use super::serving::v1::model_version_status::State;

    #[test]
    fn state_values_match_backend_wire_values() {
        assert_eq!(State::Unknown as i32, 0);
        assert_eq!(State::Start as i32, 10);
        assert_eq!(State::Loading as i32, 20);
        assert_eq!(State::Available as i32, 30);
        assert_eq!(State::Unloading as i32, 40);
        assert_eq!(State::End as i32, 50);
    }

    #[test]
    fn state_names_render_for_logging() {
        assert_eq!(State::Available.as_str_name(), "AVAILABLE");
        assert_eq!(State::Unloading.as_str_name(), "UNLOADING");
    }
}
