//! The five lane processors.
//!
//! Each processor parses its typed payload with serde; a payload that does
//! not decode is an execution failure and consumes a retry like any other.
//! All of them must tolerate re-delivery: a retried or reclaimed job may
//! have partially run before.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use reportsmith_engine::{JobContext, Processor, ProcessorError};
use reportsmith_store::JobStore;

/// Renders a report from a named template.
pub struct ReportProcessor;

#[derive(Debug, Deserialize)]
struct ReportPayload {
    template: String,
    #[serde(default)]
    parameters: Value,
}

impl Processor for ReportProcessor {
    fn execute(&self, payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError> {
        let payload: ReportPayload = serde_json::from_value(payload.clone())?;
        if payload.template.is_empty() {
            return Err(ProcessorError::execution("empty report template name"));
        }

        ctx.append_log(&format!("rendering template {}", payload.template))?;
        ctx.set_progress(50)?;
        let sections = payload
            .parameters
            .as_object()
            .map(|o| o.len())
            .unwrap_or(0);
        ctx.set_progress(100)?;

        Ok(json!({
            "template": payload.template,
            "sections": sections,
        }))
    }
}

/// Delivers a templated email.
pub struct EmailProcessor;

#[derive(Debug, Deserialize)]
struct EmailPayload {
    to: String,
    template: String,
    #[serde(default)]
    context: Value,
}

impl Processor for EmailProcessor {
    fn execute(&self, payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError> {
        let payload: EmailPayload = serde_json::from_value(payload.clone())?;
        if !payload.to.contains('@') {
            return Err(ProcessorError::execution(format!(
                "invalid recipient address: {}",
                payload.to
            )));
        }

        debug!(to = %payload.to, template = %payload.template, "delivering email");
        let context_fields = payload.context.as_object().map(|o| o.len()).unwrap_or(0);
        ctx.append_log(&format!(
            "rendered template {} with {context_fields} context fields",
            payload.template
        ))?;
        ctx.set_progress(100)?;

        Ok(json!({ "delivered_to": payload.to }))
    }
}

/// Pulls pages of records from an external connector.
pub struct SyncProcessor;

#[derive(Debug, Deserialize)]
struct SyncPayload {
    connector: String,
    #[serde(default)]
    pages: u32,
}

impl Processor for SyncProcessor {
    fn execute(&self, payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError> {
        let payload: SyncPayload = serde_json::from_value(payload.clone())?;
        let pages = payload.pages.max(1);

        for page in 1..=pages {
            ctx.append_log(&format!("synced page {page}/{pages} from {}", payload.connector))?;
            ctx.set_progress(((page * 100) / pages).min(100) as u8)?;
        }

        Ok(json!({ "connector": payload.connector, "pages": pages }))
    }
}

/// Validates and transforms an uploaded file.
pub struct FileProcessor;

#[derive(Debug, Deserialize)]
struct FilePayload {
    path: String,
}

impl Processor for FileProcessor {
    fn execute(&self, payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError> {
        let payload: FilePayload = serde_json::from_value(payload.clone())?;
        let metadata = std::fs::metadata(&payload.path)
            .map_err(|e| ProcessorError::execution(format!("stat {}: {e}", payload.path)))?;
        if !metadata.is_file() {
            return Err(ProcessorError::execution(format!(
                "not a regular file: {}",
                payload.path
            )));
        }

        ctx.set_progress(100)?;
        Ok(json!({ "path": payload.path, "bytes": metadata.len() }))
    }
}

/// Housekeeping sweep: drops terminal jobs older than the retention window.
pub struct MaintenanceProcessor {
    store: Arc<dyn JobStore>,
    retention: Duration,
}

impl MaintenanceProcessor {
    pub fn new(store: Arc<dyn JobStore>, retention: Duration) -> Self {
        Self { store, retention }
    }
}

impl Processor for MaintenanceProcessor {
    fn execute(&self, _payload: &Value, ctx: &mut dyn JobContext) -> Result<Value, ProcessorError> {
        let purged = self
            .store
            .purge_expired(self.retention)
            .map_err(|e| ProcessorError::execution(format!("purge: {e}")))?;

        if purged > 0 {
            info!(purged, "purged expired terminal jobs");
        }
        ctx.set_progress(100)?;
        Ok(json!({ "purged": purged }))
    }
}
