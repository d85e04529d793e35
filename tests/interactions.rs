mod common;

use common::{http_server, resources};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use templar::config::EngineOptions;
use templar::interactsh::{Interaction, InteractshClient, InteractshOptions, QueueSource};
use templar::output::MemoryWriter;
use templar::protocols::MetaInput;
use templar::templates::Template;
use tokio_util::sync::CancellationToken;

const BLIND: &str = r#"
id: blind-callback
info:
  name: Blind callback
  severity: high
http:
  - path: ['{{BaseURL}}/fetch?u={{interactsh-url}}']
    matchers:
      - type: word
        part: interactsh_protocol
        name: dns-callback
        words: ['dns']
"#;

struct Harness {
    client: Arc<InteractshClient>,
    source: Arc<QueueSource>,
    writer: Arc<MemoryWriter>,
    correlation_id: String,
}

/// Run the blind template once against a local server and return the
/// correlation id it sent.
async fn scan(eviction: Duration) -> Harness {
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let recorder = Arc::clone(&seen);
    let base = http_server(move |path| {
        recorder.lock().unwrap().push(path.to_string());
        "queued".to_string()
    })
    .await;

    let options = InteractshOptions {
        eviction,
        cooldown: Duration::from_millis(50),
        poll_interval: Duration::from_millis(20),
        ..InteractshOptions::default()
    };
    let source = Arc::new(QueueSource::new("oast.test"));
    let writer = Arc::new(MemoryWriter::new());
    let client = Arc::new(InteractshClient::with_source(options, source.clone(), writer.clone()).await.unwrap());
    client.start_polling();

    let resources = resources(EngineOptions::for_tests()).with_interactsh(Arc::clone(&client));
    let template = Template::parse(BLIND, None, &resources).unwrap();
    let matched = template
        .executer
        .execute(&MetaInput::new(base), &CancellationToken::new(), writer.as_ref())
        .await
        .unwrap();
    assert!(!matched);
    assert!(writer.is_empty());

    let path = seen.lock().unwrap().first().cloned().unwrap();
    let url = path.split("u=").nth(1).unwrap();
    let correlation_id = url.split('.').next().unwrap().to_string();
    Harness { client, source, writer, correlation_id }
}

#[tokio::test]
async fn test_callback_within_window_yields_one_result() {
    let h = scan(Duration::from_secs(60)).await;
    assert_eq!(h.client.pending(), 1);
    h.source.push(Interaction::new("dns", &h.correlation_id));
    h.source.push(Interaction::new("dns", &h.correlation_id));
    h.client.close().await;

    let events = h.writer.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].template_id, "blind-callback");
    assert_eq!(events[0].matcher_name.as_deref(), Some("dns-callback"));
    assert!(events[0].interaction.is_some());
    assert_eq!(h.client.matched(), 1);
}

#[tokio::test]
async fn test_callback_after_eviction_yields_nothing() {
    let h = scan(Duration::from_millis(50)).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    h.source.push(Interaction::new("dns", &h.correlation_id));
    h.client.close().await;

    assert!(h.writer.is_empty());
    assert_eq!(h.client.matched(), 0);
}
