//! Wire contracts of the runtime control plane.
//!
//! Three surfaces share the same JSON framing: UI ↔ server, server ↔
//! execution manager (both websocket text frames, one JSON object per
//! frame) and script ↔ manager (one JSON object per newline-terminated
//! stdout line, two control bytes on stdin). Execution RPCs use a shared
//! discriminator set so the server can proxy them to the manager verbatim.

pub mod events;
pub mod execution;
pub mod frames;
pub mod outbox;
pub mod script;

pub use execution::PackageState;
pub use frames::{ChangeType, EventFrame, Frame, RpcRequest, RpcResponse};
pub use script::ScriptEvent;
