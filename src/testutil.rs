// src/testutil.rs
//
// Shared scaffolding for the unit tests: a scriptable in-memory transport
// and slot/hook builders.

use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::client::WebClient;
use crate::config::Config;
use crate::hooks::{AccessPolicy, Capability, Hooks};
use crate::metrics;
use crate::transport::{Transport, TransportFamily, TransportStatus};

pub(crate) enum ScriptedRead {
    Data(Vec<u8>),
    Block,
}

/// In-memory transport: reads follow the script, writes land in a shared
/// buffer the test inspects afterwards.
pub(crate) struct MockTransport {
    pub reads: VecDeque<ScriptedRead>,
    pub written: Arc<Mutex<Vec<u8>>>,
    /// Chop writes to at most this many bytes per call.
    pub write_limit: Option<usize>,
    pub encrypted: bool,
    pub family: TransportFamily,
}

impl MockTransport {
    pub fn new(reads: Vec<ScriptedRead>) -> (Self, Arc<Mutex<Vec<u8>>>) {
        let written = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                reads: reads.into(),
                written: written.clone(),
                write_limit: None,
                encrypted: false,
                family: TransportFamily::Tcp,
            },
            written,
        )
    }
}

impl Transport for MockTransport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<TransportStatus> {
        match self.reads.pop_front() {
            Some(ScriptedRead::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    data.drain(..n);
                    self.reads.push_front(ScriptedRead::Data(data));
                }
                Ok(TransportStatus::Done(n))
            }
            Some(ScriptedRead::Block) | None => Ok(TransportStatus::WantRead),
        }
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<TransportStatus> {
        let n = self.write_limit.unwrap_or(buf.len()).min(buf.len());
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(TransportStatus::Done(n))
    }

    fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    fn family(&self) -> TransportFamily {
        self.family
    }
}

pub(crate) fn make_client(
    cfg: &Config,
    reads: Vec<ScriptedRead>,
) -> (WebClient, Arc<Mutex<Vec<u8>>>) {
    let (transport, written) = MockTransport::new(reads);
    let client = WebClient::new(
        Box::new(transport),
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), 40000),
        cfg,
        metrics::client_memory(),
    );
    (client, written)
}

/// An API that answers every call with a fixed JSON body.
pub(crate) struct FixedJsonApi(pub Vec<u8>);

impl crate::hooks::ApiDispatcher for FixedJsonApi {
    fn dispatch(&self, w: &mut WebClient, _path: &str) -> u16 {
        w.response.data.reset();
        w.response.data.content_type = "application/json; charset=utf-8";
        w.response.data.push_bytes(&self.0);
        200
    }
}

pub(crate) fn hooks_with_api(body: &[u8]) -> Hooks {
    Hooks {
        api: Arc::new(FixedJsonApi(body.to_vec())),
        ..Hooks::defaults()
    }
}

/// Denies exactly one capability.
pub(crate) struct DenyOne(pub Capability);

impl AccessPolicy for DenyOne {
    fn allows(&self, cap: Capability) -> bool {
        cap != self.0
    }
}

/// Split a written response stream at the first blank line.
pub(crate) fn split_response(raw: &[u8]) -> (String, Vec<u8>) {
    let pos = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("no header terminator in response");
    (
        String::from_utf8(raw[..pos + 4].to_vec()).expect("header not utf-8"),
        raw[pos + 4..].to_vec(),
    )
}
