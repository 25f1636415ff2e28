//! Shared helpers for the connection resilience tests
#![allow(dead_code)]

use hublink::connection::{ConnectionStatus, ConnectionStatusChangeReason, DeviceClient};
use hublink::retry::RetryPolicy;
use hublink::testing::ScriptedTransportControl;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type StatusLog = Arc<Mutex<Vec<(ConnectionStatus, ConnectionStatusChangeReason)>>>;

/// Client over a scripted transport, with every status transition recorded
pub fn scripted_client(policy: RetryPolicy) -> (DeviceClient, ScriptedTransportControl, StatusLog) {
    let control = ScriptedTransportControl::new();
    let mut client = DeviceClient::with_transport(control.factory(), policy);

    let log: StatusLog = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    client.on_status_change(move |status, reason| {
        sink.lock().unwrap().push((status, reason));
    });

    (client, control, log)
}

/// Fast exponential backoff so reconnect tests finish quickly
pub fn fast_backoff() -> RetryPolicy {
    RetryPolicy::ExponentialBackoffWithJitter {
        min_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(10),
        max_elapsed: Duration::from_secs(30),
    }
}

pub fn statuses(log: &StatusLog) -> Vec<ConnectionStatus> {
    log.lock().unwrap().iter().map(|(s, _)| *s).collect()
}

pub fn reasons(log: &StatusLog) -> Vec<ConnectionStatusChangeReason> {
    log.lock().unwrap().iter().map(|(_, r)| *r).collect()
}

/// Wait until the recorded log satisfies a predicate, with a deadline so a
/// broken supervisor fails the test instead of hanging it.
pub async fn wait_for_log<F>(log: &StatusLog, predicate: F)
where
    F: Fn(&[(ConnectionStatus, ConnectionStatusChangeReason)]) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if predicate(&log.lock().unwrap()) {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached; log: {:?}", log.lock().unwrap());
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
