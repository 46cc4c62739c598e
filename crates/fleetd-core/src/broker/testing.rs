//! Test support: an in-process fake broker peer.
//!
//! Drives the real client over a real Unix stream pair, recording every
//! decoded request and replaying scripted events, so client and worker
//! tests exercise the actual framing and dispatch paths.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::mpsc;

use super::client::BrokerClient;
use super::protocol::{BrokerEvent, BrokerRequest, read_frame, write_frame};

pub(crate) struct FakeBroker {
    requests: Arc<Mutex<Vec<BrokerRequest>>>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl FakeBroker {
    /// Snapshot of every request decoded so far, in arrival order.
    pub(crate) fn requests(&self) -> Vec<BrokerRequest> {
        self.requests.lock().expect("request log poisoned").clone()
    }

    /// Inject an event as if the broker had produced it.
    pub(crate) fn send(&self, event: BrokerEvent) {
        self.events.send(event).expect("fake broker writer gone");
    }

    /// Poll the request log until `extract` yields a value.
    ///
    /// Panics after a bounded number of polls so a missing request fails
    /// the test instead of hanging it.
    pub(crate) async fn wait_for<T>(
        &self,
        extract: impl Fn(&[BrokerRequest]) -> Option<T>,
    ) -> T {
        for _ in 0..500 {
            if let Some(value) = extract(&self.requests()) {
                return value;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!(
            "expected request never arrived; saw {:?}",
            self.requests()
        );
    }
}

/// Build a connected (client, fake broker) pair.
pub(crate) fn pair(exec_timeout: Option<Duration>) -> (BrokerClient, FakeBroker) {
    let (client_stream, broker_stream) =
        UnixStream::pair().expect("failed to create stream pair");
    let client = BrokerClient::from_stream(client_stream, exec_timeout);

    let (mut read_half, mut write_half) = broker_stream.into_split();
    let requests: Arc<Mutex<Vec<BrokerRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let (events_tx, mut events_rx) = mpsc::unbounded_channel::<BrokerEvent>();

    let log = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok(Some(bytes)) = read_frame(&mut read_half).await {
            if let Ok(request) = serde_json::from_slice::<BrokerRequest>(&bytes) {
                log.lock().expect("request log poisoned").push(request);
            }
        }
    });

    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            let payload = serde_json::to_vec(&event).expect("event encodes");
            if write_frame(&mut write_half, &payload).await.is_err() {
                break;
            }
        }
    });

    (
        client,
        FakeBroker {
            requests,
            events: events_tx,
        },
    )
}
