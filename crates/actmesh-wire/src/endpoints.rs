//! Start every listener and client named in the loaded configuration.

use crate::client::Client;
use crate::context::TransportContext;
use crate::dispatch::LocalDispatch;
use crate::error::WireError;
use crate::listener::Listener;
use actmesh_types::{CloseError, Pattern};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

/// The configured endpoints of one process.
pub struct Endpoints {
    listeners: Vec<Listener>,
    clients: Vec<Arc<Client>>,
}

impl Endpoints {
    pub fn listeners(&self) -> &[Listener] {
        &self.listeners
    }

    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    /// Bound addresses of the started listeners.
    pub fn listen_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().filter_map(Listener::local_addr).collect()
    }

    /// The client responsible for `pattern`. Clients with explicit pins take
    /// precedence over catch-all clients; ties go to configuration order.
    pub fn client_for(&self, pattern: &Pattern) -> Option<&Arc<Client>> {
        self.clients
            .iter()
            .filter(|c| !c.pins().is_catch_all())
            .find(|c| c.handles(pattern))
            .or_else(|| self.clients.iter().find(|c| c.pins().is_catch_all()))
    }

    /// Close clients first so no new outbound work starts, then listeners.
    pub async fn close(&self) -> Result<(), CloseError> {
        let mut failures = Vec::new();
        for client in &self.clients {
            if let Err(e) = client.close().await {
                failures.extend(e.failures);
            }
        }
        for listener in &self.listeners {
            if let Err(e) = listener.close().await {
                failures.extend(e.failures);
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CloseError { failures })
        }
    }
}

/// Start the `[[client]]` and `[[listen]]` entries of the context's settings.
///
/// If any endpoint fails to start, the ones already started are closed
/// before the error is returned.
pub async fn start_endpoints(
    context: &TransportContext,
    dispatch: Arc<dyn LocalDispatch>,
) -> Result<Endpoints, WireError> {
    let settings = context.settings();
    let mut endpoints = Endpoints {
        listeners: Vec::with_capacity(settings.listen.len()),
        clients: Vec::with_capacity(settings.client.len()),
    };

    for config in &settings.client {
        match Client::connect(config.clone(), context).await {
            Ok(client) => endpoints.clients.push(Arc::new(client)),
            Err(e) => {
                abandon(&endpoints).await;
                return Err(e);
            }
        }
    }

    for config in &settings.listen {
        let listener = Listener::new(config.clone(), context, Arc::clone(&dispatch))?;
        if let Err(e) = listener.start().await {
            abandon(&endpoints).await;
            return Err(e);
        }
        endpoints.listeners.push(listener);
    }

    info!(
        listeners = endpoints.listeners.len(),
        clients = endpoints.clients.len(),
        "Endpoints started"
    );
    Ok(endpoints)
}

async fn abandon(endpoints: &Endpoints) {
    if let Err(e) = endpoints.close().await {
        warn!(error = %e, "Failed to close partially started endpoints");
    }
}
