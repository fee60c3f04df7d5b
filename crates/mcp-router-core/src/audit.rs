//! Fire-and-forget audit events
//!
//! `AuditSink::emit` never blocks and never fails. `ChannelAuditSink` hands events
//! to a background task that writes them in batches through an `AuditWriter`.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mcp_router_common::ShutdownSignal;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationAction {
    Register,
    Deregister,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    Routing {
        service: String,
        group: String,
        policy: String,
        /// `host:port` of the chosen instance
        selected: Option<String>,
        outcome: String,
        duration_ms: u64,
        timestamp: i64,
    },
    HealthCheck {
        service: String,
        group: String,
        host: String,
        port: u16,
        success: bool,
        status: String,
        consecutive_successes: u32,
        consecutive_failures: u32,
        total_checks: u64,
        response_time_ms: u64,
        message: Option<String>,
        timestamp: i64,
    },
    Registration {
        service: String,
        group: String,
        host: String,
        port: u16,
        action: RegistrationAction,
        success: bool,
        message: Option<String>,
        timestamp: i64,
    },
}

impl AuditEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            AuditEvent::Routing { .. } => "routing",
            AuditEvent::HealthCheck { .. } => "health_check",
            AuditEvent::Registration { .. } => "registration",
        }
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Receives audit events without blocking the caller.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Discards every event.
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Persists batches of events.
#[async_trait]
pub trait AuditWriter: Send {
    async fn write_batch(&mut self, events: &[AuditEvent]) -> anyhow::Result<()>;

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Logs each event through `tracing`.
pub struct TracingAuditWriter;

#[async_trait]
impl AuditWriter for TracingAuditWriter {
    async fn write_batch(&mut self, events: &[AuditEvent]) -> anyhow::Result<()> {
        for event in events {
            let json = serde_json::to_string(event)?;
            info!(target: "mcp_router_core::audit", "{}", json);
        }
        Ok(())
    }
}

/// Appends one JSON document per line to a file.
pub struct JsonLinesAuditWriter {
    path: PathBuf,
    file: Option<tokio::fs::File>,
}

impl JsonLinesAuditWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    async fn file(&mut self) -> anyhow::Result<&mut tokio::fs::File> {
        if self.file.is_none() {
            if let Some(parent) = self.path.parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            self.file = Some(file);
        }
        self.file
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("audit file not open"))
    }
}

#[async_trait]
impl AuditWriter for JsonLinesAuditWriter {
    async fn write_batch(&mut self, events: &[AuditEvent]) -> anyhow::Result<()> {
        let mut buffer = Vec::with_capacity(events.len() * 256);
        for event in events {
            serde_json::to_writer(&mut buffer, event)?;
            buffer.push(b'\n');
        }

        let result = async {
            let file = self.file().await?;
            file.write_all(&buffer).await?;
            file.flush().await?;
            anyhow::Ok(())
        }
        .await;

        if result.is_err() {
            // reopen on the next batch
            self.file = None;
        }
        result
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush().await?;
        }
        Ok(())
    }
}

/// Bounded channel sink; drops and counts events when the writer falls behind.
pub struct ChannelAuditSink {
    sender: mpsc::Sender<AuditEvent>,
    receiver: Mutex<Option<mpsc::Receiver<AuditEvent>>>,
    dropped: AtomicU64,
}

impl ChannelAuditSink {
    pub fn new(buffer: usize) -> Self {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        Self {
            sender,
            receiver: Mutex::new(Some(receiver)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain events into `writer` until shutdown, flushing every `batch_size`
    /// events or `flush_interval`, whichever comes first.
    pub async fn run(
        self: Arc<Self>,
        mut writer: Box<dyn AuditWriter>,
        batch_size: usize,
        flush_interval: Duration,
        shutdown: ShutdownSignal,
    ) {
        let receiver = self.receiver.lock().take();
        let Some(mut receiver) = receiver else {
            warn!("Audit writer is already running");
            return;
        };

        let batch_size = batch_size.max(1);
        let mut batch: Vec<AuditEvent> = Vec::with_capacity(batch_size);
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!("Audit writer started: batch_size={}, flush_interval={:?}", batch_size, flush_interval);
        loop {
            tokio::select! {
                event = receiver.recv() => match event {
                    Some(event) => {
                        batch.push(event);
                        if batch.len() >= batch_size {
                            write_batch(writer.as_mut(), &mut batch).await;
                        }
                    }
                    None => break,
                },
                _ = ticker.tick() => {
                    write_batch(writer.as_mut(), &mut batch).await;
                }
                _ = shutdown.cancelled() => break,
            }
        }

        // drain what is already queued
        while let Ok(event) = receiver.try_recv() {
            batch.push(event);
        }
        write_batch(writer.as_mut(), &mut batch).await;
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush audit writer: {}", e);
        }
        info!("Audit writer stopped");
    }
}

async fn write_batch(writer: &mut dyn AuditWriter, batch: &mut Vec<AuditEvent>) {
    if batch.is_empty() {
        return;
    }
    match writer.write_batch(&batch[..]).await {
        Ok(()) => debug!("Wrote {} audit events", batch.len()),
        Err(e) => warn!("Dropping {} audit events, write failed: {}", batch.len(), e),
    }
    batch.clear();
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        if self.sender.try_send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("mcp_router_audit_dropped_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing_event(service: &str) -> AuditEvent {
        AuditEvent::Routing {
            service: service.to_string(),
            group: "grp".to_string(),
            policy: "first".to_string(),
            selected: Some("10.0.0.1:8080".to_string()),
            outcome: "selected".to_string(),
            duration_ms: 1,
            timestamp: now_millis(),
        }
    }

    #[derive(Clone, Default)]
    struct RecordingWriter {
        batches: Arc<Mutex<Vec<usize>>>,
        events: Arc<Mutex<Vec<AuditEvent>>>,
        fail: bool,
    }

    #[async_trait]
    impl AuditWriter for RecordingWriter {
        async fn write_batch(&mut self, events: &[AuditEvent]) -> anyhow::Result<()> {
            self.batches.lock().push(events.len());
            if self.fail {
                anyhow::bail!("store unavailable");
            }
            self.events.lock().extend_from_slice(events);
            Ok(())
        }
    }

    #[test]
    fn test_full_channel_drops_and_counts() {
        let sink = ChannelAuditSink::new(2);
        for i in 0..5 {
            sink.emit(routing_event(&format!("svc-{}", i)));
        }
        assert_eq!(sink.dropped(), 3);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(routing_event("svc")).unwrap();
        assert_eq!(json["type"], "routing");
        assert_eq!(json["service"], "svc");
        assert_eq!(routing_event("svc").kind(), "routing");
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_flushes_on_batch_size() {
        let sink = Arc::new(ChannelAuditSink::new(64));
        let writer = RecordingWriter::default();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(sink.clone().run(
            Box::new(writer.clone()),
            3,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        for i in 0..3 {
            sink.emit(routing_event(&format!("svc-{}", i)));
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(writer.events.lock().len(), 3);

        shutdown.shutdown();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_flushes_on_interval_and_shutdown() {
        let sink = Arc::new(ChannelAuditSink::new(64));
        let writer = RecordingWriter::default();
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(sink.clone().run(
            Box::new(writer.clone()),
            500,
            Duration::from_secs(2),
            shutdown.clone(),
        ));

        sink.emit(routing_event("a"));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(writer.events.lock().len(), 1);

        sink.emit(routing_event("b"));
        shutdown.shutdown();
        task.await.unwrap();
        assert_eq!(writer.events.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_failure_drops_batch_and_continues() {
        let sink = Arc::new(ChannelAuditSink::new(64));
        let writer = RecordingWriter {
            fail: true,
            ..Default::default()
        };
        let shutdown = ShutdownSignal::new();
        let task = tokio::spawn(sink.clone().run(
            Box::new(writer.clone()),
            1,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));

        sink.emit(routing_event("a"));
        sink.emit(routing_event("b"));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        shutdown.shutdown();
        task.await.unwrap();

        assert_eq!(writer.batches.lock().len(), 2);
        assert!(writer.events.lock().is_empty());
    }

    #[tokio::test]
    async fn test_json_lines_writer_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("events.jsonl");
        let mut writer = JsonLinesAuditWriter::new(&path);

        writer
            .write_batch(&[routing_event("a"), routing_event("b")])
            .await
            .unwrap();
        writer.write_batch(&[routing_event("c")]).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let last: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["service"], "c");
    }
}
