//! Vitals gRPC API
//!
//! This crate defines the gRPC mirror of the metrics update/lookup surface.
//! The protobuf definitions are in `proto/vitals.proto` and code-generated
//! via `tonic-build`.

// Include the generated code
pub mod vitals {
    pub mod v1 {
        tonic::include_proto!("vitals.v1");
    }
}
