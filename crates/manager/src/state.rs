use std::sync::Arc;

use crate::clients::ClientHub;
use crate::packages::PackageStore;
use crate::run::RunSupervisor;

/// Shared application state handed to the websocket handler.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ClientHub>,
    pub store: Arc<PackageStore>,
    pub supervisor: Arc<RunSupervisor>,
}
