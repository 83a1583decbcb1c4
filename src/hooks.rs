// src/hooks.rs
//
// Narrow interfaces to the engine's external collaborators. The engine
// consumes exactly these; the agent wires in its real implementations.

use std::sync::Arc;

use crate::client::WebClient;

/// Boolean capability queries resolved by the agent's access control.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Dashboard,
    Registry,
    Badges,
    Mgmt,
    Stream,
    NetdataConf,
}

pub trait AccessPolicy: Send + Sync {
    fn allows(&self, cap: Capability) -> bool;
}

/// Metrics-database host lookups for the `/host/...` and `/node/...` switch.
/// Each returns the canonical hostname on a hit.
pub trait HostRegistry: Send + Sync {
    fn find_node(&self, node_id: &str) -> Option<String>;
    fn find_hostname(&self, name: &str) -> Option<String>;
    fn find_guid(&self, guid: &str) -> Option<String>;
}

/// The versioned JSON API. The engine hands over the slot with its decoded
/// path remainder (after `/api`) and query already in place; the dispatcher
/// fills the response body and returns the status code.
pub trait ApiDispatcher: Send + Sync {
    fn dispatch(&self, w: &mut WebClient, path: &str) -> u16;
}

/// Streaming-ingest handoff for STREAM requests. Spawning the receiver
/// worker is the collaborator's business; it returns the response status.
pub trait StreamIngest: Send + Sync {
    fn begin(&self, w: &mut WebClient) -> u16;
}

#[derive(Clone)]
pub struct Hooks {
    pub access: Arc<dyn AccessPolicy>,
    pub hosts: Arc<dyn HostRegistry>,
    pub api: Arc<dyn ApiDispatcher>,
    pub ingest: Arc<dyn StreamIngest>,
}

impl Hooks {
    /// Permissive single-host defaults: everything allowed, no API, no
    /// ingest. Enough for a static dashboard and for tests.
    pub fn defaults() -> Self {
        Self {
            access: Arc::new(AllowAll),
            hosts: Arc::new(SingleHost::new("localhost")),
            api: Arc::new(NoApi),
            ingest: Arc::new(NoIngest),
        }
    }
}

pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn allows(&self, _cap: Capability) -> bool {
        true
    }
}

/// Registry that only knows the local host.
pub struct SingleHost {
    hostname: String,
    guid: String,
}

impl SingleHost {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            guid: String::new(),
        }
    }

    pub fn with_guid(hostname: &str, guid: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            guid: guid.to_lowercase(),
        }
    }
}

impl HostRegistry for SingleHost {
    fn find_node(&self, _node_id: &str) -> Option<String> {
        None
    }

    fn find_hostname(&self, name: &str) -> Option<String> {
        (name == self.hostname).then(|| self.hostname.clone())
    }

    fn find_guid(&self, guid: &str) -> Option<String> {
        (!self.guid.is_empty() && guid == self.guid).then(|| self.hostname.clone())
    }
}

pub struct NoApi;

impl ApiDispatcher for NoApi {
    fn dispatch(&self, w: &mut WebClient, _path: &str) -> u16 {
        w.response.data.reset();
        w.response.data.push_str("Unsupported API call.");
        404
    }
}

pub struct NoIngest;

impl StreamIngest for NoIngest {
    fn begin(&self, w: &mut WebClient) -> u16 {
        w.response.data.reset();
        w.response.data.push_str("stream receiver is not enabled");
        503
    }
}
