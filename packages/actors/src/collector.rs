//! Forwarding of applied run transitions to an external lineage collector.
//!
//! Delivery is best-effort: the worker logs collector failures and moves on.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lineage_core::{LineagePhase, Run};
use serde::Serialize;
use serde_json::{Map, Value, json};

/// Errors from a collector backend.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("collector rejected event with status {0}")]
    Status(u16),
}

/// Future type for async collector calls.
pub type CollectorFuture = Pin<Box<dyn Future<Output = Result<(), CollectorError>> + Send>>;

/// Sink for lineage run events.
pub trait LineageCollector: Send + Sync + 'static {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Deliver one run event.
    fn emit(&self, event: OpenLineageEvent) -> CollectorFuture;
}

/// OpenLineage-shaped run event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenLineageEvent {
    pub event_type: String,
    pub event_time: DateTime<Utc>,
    pub run: Value,
    pub job: Value,
    pub inputs: Vec<Value>,
    pub outputs: Vec<Value>,
    pub producer: String,
}

impl OpenLineageEvent {
    /// Build the event for a run that just entered `phase`.
    ///
    /// `metadata.inputs` and `metadata.outputs` (lists of dataset names or
    /// `{namespace, name}` objects) become datasets.
    pub fn from_run(run: &Run, phase: LineagePhase, namespace: &str, producer: &str) -> Self {
        let mut run_facets = Map::new();
        if run.metadata.as_object().is_some_and(|m| !m.is_empty()) {
            run_facets.insert("metadata".into(), run.metadata.clone());
        }
        if let Some(message) = &run.error_message {
            run_facets.insert(
                "errorMessage".into(),
                json!({
                    "_producer": producer,
                    "message": message,
                    "programmingLanguage": "rust",
                }),
            );
        }

        Self {
            event_type: phase.as_str().to_string(),
            event_time: run.ended_at.unwrap_or(run.updated_at),
            run: json!({
                "runId": run.run_id.to_string(),
                "facets": run_facets,
            }),
            job: json!({
                "namespace": namespace,
                "name": run.job_name,
                "facets": {},
            }),
            inputs: datasets(&run.metadata, "inputs", namespace),
            outputs: datasets(&run.metadata, "outputs", namespace),
            producer: producer.to_string(),
        }
    }
}

fn datasets(metadata: &Value, key: &str, namespace: &str) -> Vec<Value> {
    let Some(entries) = metadata.get(key).and_then(Value::as_array) else {
        return Vec::new();
    };

    entries
        .iter()
        .filter_map(|entry| match entry {
            Value::String(name) => Some(json!({"namespace": namespace, "name": name, "facets": {}})),
            Value::Object(obj) => {
                let name = obj.get("name")?.as_str()?;
                let ns = obj
                    .get("namespace")
                    .and_then(Value::as_str)
                    .unwrap_or(namespace);
                Some(json!({"namespace": ns, "name": name, "facets": {}}))
            }
            _ => None,
        })
        .collect()
}

/// Discards everything.
pub struct NoopCollector;

impl LineageCollector for NoopCollector {
    fn name(&self) -> &str {
        "noop"
    }

    fn emit(&self, _event: OpenLineageEvent) -> CollectorFuture {
        Box::pin(async { Ok(()) })
    }
}

/// Writes events to the log.
pub struct LoggingCollector;

impl LineageCollector for LoggingCollector {
    fn name(&self) -> &str {
        "logging"
    }

    fn emit(&self, event: OpenLineageEvent) -> CollectorFuture {
        Box::pin(async move {
            tracing::info!(
                event_type = %event.event_type,
                job = %event.job["name"],
                run = %event.run["runId"],
                "Lineage event"
            );
            Ok(())
        })
    }
}

/// Posts events to an OpenLineage-compatible HTTP endpoint.
pub struct HttpCollector {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpCollector {
    /// `base_url` is the collector root; events go to `/api/v1/lineage`.
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self, CollectorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/v1/lineage", base_url.trim_end_matches('/')),
            api_key,
        })
    }
}

impl LineageCollector for HttpCollector {
    fn name(&self) -> &str {
        "http"
    }

    fn emit(&self, event: OpenLineageEvent) -> CollectorFuture {
        let mut request = self.client.post(&self.url).json(&event);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        Box::pin(async move {
            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(CollectorError::Status(response.status().as_u16()));
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lineage_core::{RunChange, RunState};

    #[test]
    fn event_carries_run_job_and_datasets() {
        let mut run = Run::new(
            "orders",
            json!({"inputs": ["raw.orders", {"namespace": "s3", "name": "landing/orders"}], "outputs": ["mart.orders"]}),
        );
        run.apply(RunState::Completed, &RunChange::new(), Utc::now())
            .unwrap();

        let event = OpenLineageEvent::from_run(&run, LineagePhase::Complete, "ducklake", "lineage-coordinator");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["eventType"], "COMPLETE");
        assert_eq!(value["run"]["runId"], run.run_id.to_string());
        assert_eq!(value["job"], json!({"namespace": "ducklake", "name": "orders", "facets": {}}));
        assert_eq!(value["inputs"][0]["name"], "raw.orders");
        assert_eq!(value["inputs"][1]["namespace"], "s3");
        assert_eq!(value["outputs"][0]["name"], "mart.orders");
        assert_eq!(value["producer"], "lineage-coordinator");
    }

    #[test]
    fn failed_run_reports_error_facet() {
        let mut run = Run::new("orders", Value::Null);
        run.apply(RunState::Failed, &RunChange::new().with_error("disk full"), Utc::now())
            .unwrap();

        let event = OpenLineageEvent::from_run(&run, LineagePhase::Fail, "ducklake", "p");
        assert_eq!(event.run["facets"]["errorMessage"]["message"], "disk full");
        assert!(event.inputs.is_empty());
    }
}
