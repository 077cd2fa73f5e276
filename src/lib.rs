//! hambone manages a fleet of Kustomize overlays ("Instances") on behalf of
//! downstream clients: a gRPC API to apply, get, and delete Instances, a
//! pluggable state store that persists them, and a `kustomize build | kubectl`
//! pipeline that reconciles them into a real cluster.

pub mod exec;
pub mod helpers;
pub mod instances;
pub mod state;

/// Generated protobuf/gRPC types for the `hambone` package.
pub mod pb {
    tonic::include_proto!("hambone");
}
