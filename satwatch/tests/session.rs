//! Session loop tests: `App::run` over an in-memory transport, with commands
//! fed through a channel and snapshots captured from the NDJSON sink.

use std::time::Duration;

use futures_util::{stream, StreamExt};
use satwatch::app::{App, Command};
use satwatch::config::DashboardConfig;
use satwatch::connection::{Connector, Frame, FrameStream};
use satwatch::error::TransportError;
use serde_json::Value;
use tokio::sync::mpsc;

type FrameTx = mpsc::UnboundedSender<Result<Frame, TransportError>>;

/// Hands out one open stream; every later handshake is refused.
struct Feed(Option<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>);

impl Feed {
    fn open() -> (FrameTx, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Feed(Some(rx)))
    }
}

impl Connector for Feed {
    async fn connect(&mut self) -> Result<FrameStream, TransportError> {
        match self.0.take() {
            Some(mut rx) => Ok(stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed()),
            None => Err(TransportError::Handshake("refused".into())),
        }
    }
}

fn text(s: &str) -> Result<Frame, TransportError> {
    Ok(Frame::Text(s.to_string()))
}

/// Send `lines` as commands once the session has gone idle.
fn commands_after_idle(lines: &'static [&'static str]) -> mpsc::Receiver<Command> {
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        for line in lines {
            tx.send(line.parse().unwrap()).await.unwrap();
        }
    });
    rx
}

fn snapshots(out: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(out)
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect()
}

const A1: &str = r#"{"type":"anomaly","event":{"id":"a1","satellite":"SAT-1","severity":"Critical","metric":"temp","value":"95C","timestamp":"2024-05-01T12:00:00Z"}}"#;

fn config() -> DashboardConfig {
    DashboardConfig {
        anomaly_retention: Duration::from_secs(100 * 365 * 24 * 3600),
        ..DashboardConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn dropped_frames_show_up_in_the_next_snapshot() {
    let (tx, feed) = Feed::open();
    tx.send(text("{not json")).unwrap();

    let mut out = Vec::new();
    let mut app = App::new(config(), &mut out);
    app.run(feed, commands_after_idle(&["tab logs", "quit"]))
        .await
        .unwrap();
    assert_eq!(app.view().snapshot().decode_errors, 1);
    drop(app);

    let snaps = snapshots(&out);
    // published before any command arrived
    let first = snaps
        .iter()
        .find(|s| s["decode_errors"] == 1)
        .expect("no snapshot carries the decode error");
    assert_eq!(first["tab"], "mission");
    let last = snaps.last().unwrap();
    assert_eq!(last["tab"], "logs");
    assert_eq!(last["decode_errors"], 1);
}

#[tokio::test(start_paused = true)]
async fn queued_events_fold_into_one_snapshot() {
    let (tx, feed) = Feed::open();
    tx.send(text(A1)).unwrap();
    for i in 0..20 {
        let frame = format!(
            r#"{{"type":"metric","satellite":"SAT-1","metric":"cpu","value":{i}.0,"timestamp":"2024-05-01T12:00:{i:02}Z"}}"#
        );
        tx.send(text(&frame)).unwrap();
    }

    let mut out = Vec::new();
    let mut app = App::new(config(), &mut out);
    app.run(feed, commands_after_idle(&["quit"])).await.unwrap();
    assert_eq!(app.view().telemetry().series("SAT-1", "cpu").len(), 20);
    drop(app);

    let snaps = snapshots(&out);
    // far fewer snapshots than the 22 events that were applied
    assert!(snaps.len() < 10, "{} snapshots written", snaps.len());
    let last = snaps.last().unwrap();
    assert_eq!(last["connection"], "live");
    assert_eq!(last["anomalies"][0]["id"], "a1");
}
