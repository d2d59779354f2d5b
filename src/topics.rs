//! Built-in demo topics.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_core::HandlerError;
use switchboard_server::{Request, TopicRegistry};
use tracing::debug;

/// Payload for `delayed`.
#[derive(Debug, Deserialize)]
struct DelayedEcho {
    text: String,
    delay_ms: u64,
}

/// Reply for `stats`.
#[derive(Debug, Serialize)]
struct ConnectionStats {
    connection_id: String,
    messages: u64,
    age_ms: u128,
}

const MESSAGE_COUNT: &str = "messages";

/// Largest delay `delayed` accepts.
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Register the demo topics: `echo`, `ping`, `stats`, `delayed`.
pub fn register_demo_topics(registry: &mut TopicRegistry) {
    let _ = registry
        .register_with_payload("echo", |req: Request, text: String| async move {
            count_message(&req);
            req.respond(&text).await?;
            Ok(())
        })
        .register("ping", |req: Request| async move {
            count_message(&req);
            req.respond("pong").await?;
            Ok(())
        })
        .register("stats", |req: Request| async move {
            count_message(&req);
            let conn = req.connection();
            let stats = ConnectionStats {
                connection_id: conn.id().to_owned(),
                messages: conn.values().get(MESSAGE_COUNT).unwrap_or(0),
                age_ms: conn.age().as_millis(),
            };
            req.respond(&stats).await?;
            Ok(())
        })
        .register_with_payload("delayed", |req: Request, p: DelayedEcho| async move {
            count_message(&req);
            let delay = Duration::from_millis(p.delay_ms);
            if delay > MAX_DELAY {
                return Err(HandlerError::msg(format!(
                    "delay {}ms exceeds {}ms",
                    p.delay_ms,
                    MAX_DELAY.as_millis()
                )));
            }
            let conn = std::sync::Arc::clone(req.connection());
            let (id, topic) = (req.id(), req.topic().to_owned());
            let _ = tokio::spawn(async move {
                tokio::select! {
                    () = conn.cancellation().cancelled() => {
                        debug!(connection_id = conn.id(), "delayed reply cancelled");
                    }
                    () = tokio::time::sleep(delay) => {
                        let _ = conn.send(id, &topic, &p.text).await;
                    }
                }
            });
            Ok(())
        });
}

fn count_message(req: &Request) {
    let _ = req
        .connection()
        .values()
        .update(MESSAGE_COUNT, |n: &mut u64| *n += 1);
}

/// Pre-hook body: start the per-connection message counter.
pub fn init_counter(values: &switchboard_core::Values) {
    let _ = values.insert(MESSAGE_COUNT, 0_u64);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchboard_server::transport::memory::duplex;
    use switchboard_server::{Dispatcher, RequestMetadata, SessionEnd};
    use tokio_util::sync::CancellationToken;

    fn dispatcher() -> Arc<Dispatcher> {
        let mut registry = TopicRegistry::new();
        register_demo_topics(&mut registry);
        Arc::new(
            Dispatcher::builder(registry)
                .add_pre_hook(|c| init_counter(c.values()))
                .build(),
        )
    }

    #[test]
    fn all_topics_registered() {
        let mut registry = TopicRegistry::new();
        register_demo_topics(&mut registry);
        assert_eq!(registry.topics(), vec!["delayed", "echo", "ping", "stats"]);
    }

    #[tokio::test]
    async fn echo_ping_and_delayed() {
        let d = dispatcher();
        let (reader, writer, mut peer) = duplex(16);
        let handle = tokio::spawn(async move {
            d.serve(reader, writer, RequestMetadata::default(), &CancellationToken::new())
                .await
        });

        assert!(peer.send_text(r#"{"ID":1,"Topic":"ping"}"#).await);
        assert_eq!(peer.recv_json().await.unwrap()["Data"], "pong");

        assert!(peer
            .send_text(r#"{"ID":2,"Topic":"delayed","Data":{"text":"later","delay_ms":10}}"#)
            .await);
        assert!(peer.send_text(r#"{"ID":3,"Topic":"echo","Data":"now"}"#).await);
        assert_eq!(peer.recv_json().await.unwrap()["Data"], "now");
        let late = peer.recv_json().await.unwrap();
        assert_eq!(late["ID"], 2);
        assert_eq!(late["Topic"], "delayed");
        assert_eq!(late["Data"], "later");

        assert!(peer.send_text(r#"{"ID":4,"Topic":"stats"}"#).await);
        let stats = peer.recv_json().await.unwrap();
        assert_eq!(stats["Data"]["messages"], 4);
        assert!(stats["Data"]["connection_id"].as_str().unwrap().starts_with("conn_"));

        assert!(peer.close().await);
        assert_eq!(handle.await.unwrap(), SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn excessive_delay_ends_session() {
        let d = dispatcher();
        let (reader, writer, peer) = duplex(16);
        let handle = tokio::spawn(async move {
            d.serve(reader, writer, RequestMetadata::default(), &CancellationToken::new())
                .await
        });
        assert!(peer
            .send_text(r#"{"ID":1,"Topic":"delayed","Data":{"text":"x","delay_ms":600000}}"#)
            .await);
        assert_eq!(handle.await.unwrap(), SessionEnd::HandlerFailed);
    }
}
