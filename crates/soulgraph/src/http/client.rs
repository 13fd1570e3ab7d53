use crate::error::{Error, Result};
use crate::http::sse::SseParser;
use crate::storage::{ChangeFeed, GraphAdapter};
use crate::types::{ChangeSetEntry, GetOpts, GraphData, Node};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Header naming the node a request comes from. Servers answer such reads
/// from local storage without pulling from their own peers.
pub const PEER_HEADER: &str = "x-soulgraph-peer";

/// [`GraphAdapter`] backed by a remote node's HTTP surface.
#[derive(Clone)]
pub struct HttpAdapter {
    base: Url,
    http: Client,
    /// Change streams stay open indefinitely, so they get no overall timeout.
    stream_http: Client,
    peer_name: Option<String>,
}

impl HttpAdapter {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base = Url::parse(base_url).map_err(|e| Error::Protocol(format!("invalid peer URL {}: {}", base_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Protocol(format!("invalid peer URL {}", base_url)));
        }
        Ok(Self {
            base,
            http: Client::builder().timeout(timeout).build()?,
            stream_http: Client::builder().connect_timeout(timeout).build()?,
            peer_name: None,
        })
    }

    /// Identify reads as coming from the peer node `name`.
    pub fn as_peer(mut self, name: impl Into<String>) -> Self {
        self.peer_name = Some(name.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn node_url(&self, soul: &str, opts: Option<&GetOpts>) -> Url {
        let Some(opts) = opts else {
            return self.url(&["nodes", soul]);
        };
        if let Some(key) = opts.key.as_deref() {
            return self.url(&["key", key, "from_node", soul]);
        }
        // Every key sorts after "", so an empty lower bound is an open one.
        let from = opts.from.as_deref().filter(|f| !f.is_empty());
        match (from, opts.to.as_deref()) {
            (Some(from), Some(to)) => self.url(&["keys", "from", from, "to", to, "from_node", soul]),
            (Some(from), None) => self.url(&["keys", "from", from, "from_node", soul]),
            (None, Some(to)) => self.url(&["keys", "to", to, "from_node", soul]),
            (None, None) => self.url(&["nodes", soul]),
        }
    }

    fn check(url: &Url, status: StatusCode) -> Result<()> {
        if status.is_success() {
            return Ok(());
        }
        Err(Error::Remote {
            status: status.as_u16(),
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl GraphAdapter for HttpAdapter {
    async fn get(&self, soul: &str, opts: Option<&GetOpts>) -> Result<Option<Node>> {
        let url = self.node_url(soul, opts);
        trace!(url = %url, "GET node");
        let mut request = self.http.get(url.clone());
        if let Some(name) = self.peer_name.as_deref() {
            request = request.header(PEER_HEADER, name);
        }
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::check(&url, response.status())?;
        Ok(response.json::<Option<Node>>().await?)
    }

    async fn put(&self, graph: &GraphData) -> Result<Option<GraphData>> {
        let url = self.url(&["nodes"]);
        let response = self.http.put(url.clone()).json(graph).send().await?;
        Self::check(&url, response.status())?;
        let diff: GraphData = response.json().await?;
        Ok(Some(diff).filter(|d| !d.is_empty()))
    }

    /// Follows `GET /changelog`, reconnecting from the last event seen.
    fn on_change(&self, from: Option<&str>) -> Result<ChangeFeed> {
        let (tx, rx) = mpsc::unbounded_channel();
        let http = self.stream_http.clone();
        let url = self.url(&["changelog"]);
        let mut last = from.map(str::to_string);

        let task = tokio::spawn(async move {
            loop {
                match stream_changes(&http, &url, &mut last, &tx).await {
                    Ok(()) => return,
                    Err(e) => warn!(url = %url, "Change stream interrupted: {}", e),
                }
                if tx.is_closed() {
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(ChangeFeed::new(rx, Some(task)))
    }

    fn supports_change_feed(&self) -> bool {
        true
    }
}

/// Read one change stream connection. `Ok` means the receiver went away.
async fn stream_changes(
    http: &Client,
    url: &Url,
    last: &mut Option<String>,
    tx: &mpsc::UnboundedSender<ChangeSetEntry>,
) -> Result<()> {
    let mut request = http.get(url.clone()).header(ACCEPT, "text/event-stream");
    if let Some(last) = last.as_deref() {
        request = request.query(&[("lastId", last)]);
    }
    let response = request.send().await?;
    HttpAdapter::check(url, response.status())?;
    debug!(url = %url, from = ?last, "Change stream open");

    let mut body = response.bytes_stream();
    let mut parser = SseParser::default();
    while let Some(chunk) = body.next().await {
        for event in parser.feed(&chunk?) {
            match event.into_entry() {
                Ok(Some(entry)) => {
                    *last = Some(entry.key.clone());
                    if tx.send(entry).is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("Dropping malformed change event: {}", e),
            }
        }
    }
    Err(Error::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> HttpAdapter {
        HttpAdapter::new("http://peer.example:8765/", Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_node_urls() {
        let a = adapter();
        assert_eq!(a.node_url("A", None).as_str(), "http://peer.example:8765/nodes/A");
        assert_eq!(
            a.node_url("peers/x", None).as_str(),
            "http://peer.example:8765/nodes/peers%2Fx"
        );
        assert_eq!(
            a.node_url("A", Some(&GetOpts::single("k"))).as_str(),
            "http://peer.example:8765/key/k/from_node/A"
        );
        assert_eq!(
            a.node_url("A", Some(&GetOpts::range(Some("a".into()), Some("b".into())))).as_str(),
            "http://peer.example:8765/keys/from/a/to/b/from_node/A"
        );
        assert_eq!(
            a.node_url("A", Some(&GetOpts::range(Some("a".into()), None))).as_str(),
            "http://peer.example:8765/keys/from/a/from_node/A"
        );
        assert_eq!(
            a.node_url("A", Some(&GetOpts::range(None, Some("b".into())))).as_str(),
            "http://peer.example:8765/keys/to/b/from_node/A"
        );
        assert_eq!(
            a.node_url("changelog", Some(&GetOpts::range(Some(String::new()), None))).as_str(),
            "http://peer.example:8765/nodes/changelog"
        );
    }

    #[test]
    fn test_rejects_bad_urls() {
        assert!(HttpAdapter::new("not a url", Duration::from_secs(1)).is_err());
        assert!(HttpAdapter::new("mailto:x@y", Duration::from_secs(1)).is_err());
    }
}
