use anyhow::Result;
use bunsen_core::{CorrelationId, Direction, EventType, RecordedEvent, Sanitizer};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Cheap-to-clone handle; events are appended by a single background writer.
#[derive(Clone)]
pub struct RecordingLogger {
    sender: mpsc::UnboundedSender<RecordedEvent>,
}

impl RecordingLogger {
    /// Must be called inside a tokio runtime.
    pub fn new(log_file_path: PathBuf) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            if let Err(e) = Self::writer_task(log_file_path, &mut receiver).await {
                error!("Recording logger failed: {}", e);
            }
        });

        Ok(Self { sender })
    }

    pub fn record(&self, event: RecordedEvent) {
        if self.sender.send(event).is_err() {
            error!("Failed to send event to recording logger: receiver dropped");
        }
    }

    /// Record an inbound webhook delivery with its headers sanitized.
    pub fn record_webhook(
        &self,
        correlation_id: &CorrelationId,
        headers: &HashMap<String, String>,
        body: &[u8],
        metadata: HashMap<String, String>,
    ) {
        let body = serde_json::from_slice::<serde_json::Value>(body)
            .map(|v| Sanitizer::sanitize_json(&v))
            .unwrap_or_else(|_| serde_json::Value::String(format!("[UNPARSABLE_BODY_{}b]", body.len())));

        self.record(RecordedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            correlation_id: correlation_id.0.clone(),
            event_type: EventType::WebhookReceived,
            direction: Direction::Request,
            operation: "webhook".to_string(),
            data: serde_json::json!({
                "headers": Sanitizer::sanitize_headers(headers),
                "body": body,
            }),
            metadata,
        });
    }

    async fn writer_task(
        log_file_path: PathBuf,
        receiver: &mut mpsc::UnboundedReceiver<RecordedEvent>,
    ) -> Result<()> {
        match log_file_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => tokio::fs::create_dir_all(dir).await?,
            _ => {}
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file_path)
            .await?;
        info!("Recording to {}", log_file_path.display());

        while let Some(event) = receiver.recv().await {
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => {
                    error!("Dropping unserializable {} event: {}", event.operation, e);
                    continue;
                }
            };
            line.push(b'\n');

            if let Err(e) = file.write_all(&line).await.and(file.flush().await) {
                error!("Failed to append to {}: {}", log_file_path.display(), e);
            }
        }

        info!("Recording writer stopped");
        Ok(())
    }
}
