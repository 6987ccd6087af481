//! Nimbus IAM: accounts, roles and business groups, linked by relation
//! edges, and the reconciler that keeps each account's permission
//! projection in line with them.

#![forbid(unsafe_code)]

pub mod graph;
pub mod handler;
pub mod kinds;
mod projection;

use std::sync::Arc;

use nimbus_bridge::Handler;
use nimbus_core::{CoderRegistry, RelationSpec};
use tokio::sync::Mutex;

pub use graph::{EdgeDiff, PermissionGraph};
pub use handler::{GraphHandler, GraphKind};
pub use kinds::{AccountSpec, BusinessGroupSpec, MenuSpec, OperationSpec, PermissionSpec, ResourceSpec, RoleSpec, RoleTree};

/// Register every IAM kind, the relation edges and the derived workspace.
pub fn register_kinds(coders: &CoderRegistry) {
    coders
        .register::<AccountSpec>()
        .register::<RoleSpec>()
        .register::<BusinessGroupSpec>()
        .register::<MenuSpec>()
        .register::<ResourceSpec>()
        .register::<OperationSpec>()
        .register::<PermissionSpec>()
        .register::<RelationSpec>();
    nimbus_tenancy::register_kinds(coders);
}

/// The account, business-group and role handlers for tenant `db`.
pub fn handlers(db: &str) -> Vec<Box<dyn Handler>> {
    let projections = Arc::new(Mutex::new(()));
    GraphKind::ALL
        .into_iter()
        .map(|kind| Box::new(GraphHandler::new(kind, db, projections.clone())) as Box<dyn Handler>)
        .collect()
}
