// Per-broker client pool and topic routing.
//
// One client per broker address. `for_topic` asks any reachable broker who
// owns the topic, follows Redirect responses (carrying the authoritative
// bit forward), and returns the client connected to the owner, creating it
// on first use. Closed clients are evicted so the next request re-dials.
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use pulsar_wire::proto::LookupType;

use crate::client::Client;
use crate::config::{ClientConfig, DEFAULT_MAX_LOOKUP_REDIRECTS};
use crate::connection::strip_scheme;
use crate::errors::{ClientError, Result};

#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientPool {
    pub fn new() -> Arc<ClientPool> {
        Arc::new(ClientPool::default())
    }

    /// The pooled client for `addr`, dialing it if absent or closed.
    pub async fn get(self: &Arc<Self>, cfg: &ClientConfig, addr: &str) -> Result<Client> {
        let key = strip_scheme(addr).to_string();
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key)
            && !client.is_closed()
        {
            return Ok(client.clone());
        }

        let mut cfg = cfg.clone();
        cfg.addr = addr.to_string();
        let client = Client::connect(&cfg).await?;
        clients.insert(key.clone(), client.clone());
        drop(clients);

        // evict once the connection dies so the next caller re-dials
        {
            let pool = Arc::clone(self);
            let mut closed = client.closed_signal();
            tokio::spawn(async move {
                closed.wait().await;
                let mut clients = pool.clients.lock().await;
                if clients.get(&key).is_some_and(Client::is_closed) {
                    debug!(addr = %key, "evicting closed client");
                    clients.remove(&key);
                }
            });
        }
        Ok(client)
    }

    /// The client connected to the broker that owns `topic`. Starts from
    /// the discovery address in `cfg`, follows redirects up to the hop
    /// limit, and fails with `LookupRedirectLoop` beyond it.
    pub async fn for_topic(self: &Arc<Self>, cfg: &ClientConfig, topic: &str) -> Result<Client> {
        let mut addr = cfg.addr.clone();
        let mut authoritative = false;
        for _ in 0..DEFAULT_MAX_LOOKUP_REDIRECTS {
            let client = self.get(cfg, &addr).await?;
            let resp = client.lookup_topic(topic, authoritative).await?;
            let broker = if cfg.tls.is_some() {
                resp.broker_service_url_tls.clone()
            } else {
                resp.broker_service_url.clone()
            }
            .unwrap_or_default();

            match resp.response.and_then(|raw| LookupType::try_from(raw).ok()) {
                Some(LookupType::Connect) => {
                    // an empty broker URL means the answering broker owns
                    // the topic itself
                    if broker.is_empty() || strip_scheme(&broker) == strip_scheme(&addr) {
                        return Ok(client);
                    }
                    return self.get(cfg, &broker).await;
                }
                Some(LookupType::Redirect) => {
                    debug!(topic, broker = %broker, "lookup redirect");
                    addr = broker;
                    authoritative = resp.authoritative.unwrap_or(false);
                }
                // Failed already surfaced inside lookup_topic
                other => {
                    return Err(ClientError::UnexpectedResponse {
                        received: other.map(|_| pulsar_wire::CommandType::LookupResponse),
                        context: "resolving topic owner",
                    });
                }
            }
        }
        Err(ClientError::LookupRedirectLoop(DEFAULT_MAX_LOOKUP_REDIRECTS))
    }
}
