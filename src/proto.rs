//! Generated gRPC stub (§1, §10.5).
//!
//! The wire protocol itself is out of scope for this crate's design — this
//! module only re-exports what `tonic-prost-build` generates from
//! `proto/mt5.proto` at build time via [`build.rs`](../../build.rs) so the
//! rest of the crate has a stable import path (`crate::proto::mt5::*`)
//! regardless of how the generated module is named internally.

pub mod mt5 {
    tonic::include_proto!("mt5");
}
