use tokio::sync::mpsc::UnboundedSender;

use crate::registry::Registry;

// Registries backing the web console front-end.
//
// The console itself lives outside of this crate; it registers its WebSocket
// clients and per-route access tokens here so that diagnostics (and the
// console's own broadcast path) can observe them alongside the other
// registries.
pub(crate) struct WebConsole {
    // Connected console clients, keyed by their remote address.
    pub(crate) clients: Registry<String, UnboundedSender<Vec<u8>>>,
    // Access tokens granted per routable endpoint.
    pub(crate) route_tokens: Registry<String, String>,
}

impl WebConsole {
    pub(crate) fn new() -> Self {
        WebConsole {
            clients: Registry::new(),
            route_tokens: Registry::new(),
        }
    }
}
