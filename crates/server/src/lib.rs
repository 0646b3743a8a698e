//! ARServer: the websocket hub UI clients talk to.
//!
//! Single source of truth for a live editing session: RPC dispatch over
//! the scene/project/object-type catalog, per-object edit locks, object
//! aiming, event fan-out, and verbatim proxying of execution RPCs to
//! the execution manager.

pub mod aiming;
pub mod clients;
pub mod locks;
pub mod manager_link;
pub mod object_types;
pub mod rpc;
pub mod session;
pub mod state;
pub mod ws;
