//! Command dispatcher
//!
//! Turns one [`Command`] into exactly one [`Response`]. Method names resolve
//! through a [`Registry`] of typed handlers; every failure, panics included,
//! is classified and reported in-band together with the captured log.

use crate::capture::{LogCapture, parse_level};
use crate::operations::Cpi;
use crate::pool::panic_message;
use flowcpi_cloud::{CpiError, ErrorInfo, Result};
use flowcpi_config::CpiConfig;
use futures_util::FutureExt;
use futures_util::future::{self, BoxFuture};
use serde::de::{self, DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::Instrument;
use tracing::instrument::WithSubscriber;
use tracing_subscriber::filter::LevelFilter;

/// One request from the director
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub method: String,

    #[serde(default)]
    pub arguments: Vec<Value>,

    #[serde(default)]
    pub context: Map<String, Value>,
}

impl Command {
    pub fn request_id(&self) -> String {
        match self.context.get("request_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        }
    }
}

/// The single answer to a command; exactly one of `result` and `error` is set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub result: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub log: String,
}

impl Response {
    fn from_outcome(outcome: Result<Value>, log: String) -> Self {
        match outcome {
            // operations with nothing to return still answer with a result
            Ok(Value::Null) => Self {
                result: Some(Value::Bool(true)),
                error: None,
                log,
            },
            Ok(value) => Self {
                result: Some(value),
                error: None,
                log,
            },
            Err(e) => Self {
                result: None,
                error: Some(e.to_info()),
                log,
            },
        }
    }
}

/// Argument list of an operation that takes none
#[derive(Debug, Clone, Copy)]
pub struct NoArguments;

impl<'de> Deserialize<'de> for NoArguments {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let arguments = Vec::<IgnoredAny>::deserialize(deserializer)?;
        if arguments.is_empty() {
            Ok(NoArguments)
        } else {
            Err(de::Error::invalid_length(arguments.len(), &"no arguments"))
        }
    }
}

type Handler = Box<dyn Fn(Arc<Cpi>, Vec<Value>) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// Method name → typed operation
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<&'static str, Handler>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operation taking its positional arguments as a tuple `A`
    pub fn register<A, R, F, Fut>(&mut self, method: &'static str, operation: F) -> &mut Self
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(Arc<Cpi>, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let handler: Handler = Box::new(move |cpi, arguments| {
            match serde_json::from_value::<A>(Value::Array(arguments)) {
                Ok(args) => {
                    let pending = operation(cpi, args);
                    async move {
                        let value: Value = serde_json::to_value(pending.await?)?;
                        Ok::<_, CpiError>(value)
                    }
                    .boxed()
                }
                Err(e) => future::ready(Err(CpiError::InvalidCall(format!(
                    "invalid arguments for {}: {}",
                    method, e
                ))))
                .boxed(),
            }
        });

        self.handlers.insert(method, handler);
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Registered method names, sorted
    pub fn methods(&self) -> Vec<&'static str> {
        let mut methods: Vec<_> = self.handlers.keys().copied().collect();
        methods.sort_unstable();
        methods
    }

    /// Every CPI operation
    pub fn cpi() -> Self {
        let mut registry = Self::new();
        registry
            .register("info", |cpi: Arc<Cpi>, _: NoArguments| {
                future::ready(Ok(cpi.info()))
            })
            .register(
                "create_stemcell",
                |cpi: Arc<Cpi>, (image_path, cloud_properties): (String, Value)| {
                    future::ready(cpi.create_stemcell(&image_path, &cloud_properties))
                },
            )
            .register("delete_stemcell", |cpi: Arc<Cpi>, (stemcell_id,): (String,)| {
                future::ready(cpi.delete_stemcell(&stemcell_id))
            })
            .register(
                "create_vm",
                |cpi: Arc<Cpi>,
                 (agent_id, stemcell_id, cloud_properties, networks, disk_cids, env): (
                    String,
                    String,
                    Value,
                    Value,
                    Option<Vec<String>>,
                    Value,
                )| async move {
                    cpi.create_vm(
                        agent_id,
                        stemcell_id,
                        cloud_properties,
                        networks,
                        disk_cids.unwrap_or_default(),
                        env,
                    )
                    .await
                },
            )
            .register("delete_vm", |cpi: Arc<Cpi>, (vm_id,): (String,)| async move {
                cpi.delete_vm(&vm_id).await
            })
            .register("has_vm", |cpi: Arc<Cpi>, (vm_id,): (String,)| async move {
                cpi.has_vm(&vm_id).await
            })
            .register("reboot_vm", |cpi: Arc<Cpi>, (vm_id,): (String,)| async move {
                cpi.reboot_vm(&vm_id).await
            })
            .register(
                "set_vm_metadata",
                |cpi: Arc<Cpi>, (vm_id, metadata): (String, Map<String, Value>)| async move {
                    cpi.set_vm_metadata(&vm_id, metadata).await
                },
            )
            .register(
                "create_disk",
                |cpi: Arc<Cpi>,
                 (size_mib, cloud_properties, vm_locality): (u64, Value, Option<String>)| async move {
                    cpi.create_disk(size_mib, cloud_properties, vm_locality).await
                },
            )
            .register("delete_disk", |cpi: Arc<Cpi>, (disk_id,): (String,)| async move {
                cpi.delete_disk(&disk_id).await
            })
            .register("has_disk", |cpi: Arc<Cpi>, (disk_id,): (String,)| async move {
                cpi.has_disk(&disk_id).await
            })
            .register(
                "attach_disk",
                |cpi: Arc<Cpi>, (vm_id, disk_id): (String, String)| async move {
                    cpi.attach_disk(&vm_id, &disk_id).await
                },
            )
            .register(
                "detach_disk",
                |cpi: Arc<Cpi>, (vm_id, disk_id): (String, String)| async move {
                    cpi.detach_disk(&vm_id, &disk_id).await
                },
            )
            .register("get_disks", |cpi: Arc<Cpi>, (vm_id,): (String,)| async move {
                cpi.get_disks(&vm_id).await
            })
            .register(
                "snapshot_disk",
                |cpi: Arc<Cpi>, (disk_id, metadata): (String, Option<Map<String, Value>>)| async move {
                    cpi.snapshot_disk(&disk_id, metadata.unwrap_or_default()).await
                },
            )
            .register(
                "delete_snapshot",
                |cpi: Arc<Cpi>, (snapshot_id,): (String,)| async move {
                    cpi.delete_snapshot(&snapshot_id).await
                },
            );
        registry
    }

    fn get(&self, method: &str) -> Option<&Handler> {
        self.handlers.get(method)
    }
}

/// Process-level entry point: one command in, one response out
pub struct Dispatcher {
    registry: Registry,
    cpi: std::result::Result<Arc<Cpi>, CpiError>,
    log_level: LevelFilter,
}

impl Dispatcher {
    pub fn new(cpi: Cpi) -> Self {
        Self {
            registry: Registry::cpi(),
            cpi: Ok(Arc::new(cpi)),
            log_level: LevelFilter::DEBUG,
        }
    }

    pub fn from_config(config: &CpiConfig) -> Self {
        Self::new(Cpi::from_config(config)).with_log_level(parse_level(&config.logging.level))
    }

    /// A dispatcher that answers every command with `error`
    ///
    /// Used when configuration could not be loaded, so the director still
    /// gets a well-formed response instead of a crashed process.
    pub fn unconfigured(error: CpiError) -> Self {
        Self {
            registry: Registry::cpi(),
            cpi: Err(error),
            log_level: LevelFilter::DEBUG,
        }
    }

    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = level;
        self
    }

    /// Handle one raw input line
    /// Handle raw input bytes; input that is not UTF-8 is a malformed command
    pub async fn handle_bytes(&self, input: &[u8]) -> Response {
        match std::str::from_utf8(input) {
            Ok(line) => self.handle_line(line.trim()).await,
            Err(e) => {
                let error = CpiError::InvalidCall(format!("malformed command: {}", e));
                self.respond("", "", future::ready(Err(error))).await
            }
        }
    }

    pub async fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Command>(line) {
            Ok(command) => self.dispatch(command).await,
            Err(e) => {
                let error = CpiError::InvalidCall(format!("malformed command: {}", e));
                self.respond("", "", future::ready(Err(error))).await
            }
        }
    }

    pub async fn dispatch(&self, command: Command) -> Response {
        let request_id = command.request_id();
        let Command {
            method, arguments, ..
        } = command;
        self.respond(&method, &request_id, self.invoke(&method, arguments))
            .await
    }

    async fn invoke(&self, method: &str, arguments: Vec<Value>) -> Result<Value> {
        let cpi = self.cpi.clone()?;
        let handler = self
            .registry
            .get(method)
            .ok_or_else(|| CpiError::InvalidCall(format!("unknown method: {}", method)))?;
        handler(cpi, arguments).await
    }

    /// Run `work` under a fresh log capture and build the response
    async fn respond<F>(&self, method: &str, request_id: &str, work: F) -> Response
    where
        F: Future<Output = Result<Value>>,
    {
        let capture = LogCapture::new(self.log_level);

        let outcome = async {
            let span = tracing::info_span!("cpi_request", method, request_id);
            async {
                tracing::info!("Handling request");

                let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                    Ok(outcome) => outcome,
                    Err(panic) => Err(CpiError::unknown(format!(
                        "operation panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                };

                match &outcome {
                    Ok(_) => tracing::info!("Request finished"),
                    Err(e) => {
                        tracing::error!(
                            error_type = %e.kind(),
                            ok_to_retry = e.ok_to_retry(),
                            "Request failed: {}",
                            e
                        );
                        if let Some(trace) = e.trace() {
                            tracing::error!("Backtrace:\n{}", trace);
                        }
                    }
                }
                outcome
            }
            .instrument(span)
            .await
        }
        .with_subscriber(capture.subscriber())
        .await;

        Response::from_outcome(outcome, capture.contents())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::WorkerPool;
    use flowcpi_cloud::InMemoryBackend;
    use serde_json::json;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Cpi::new(
            Arc::new(InMemoryBackend::new()),
            WorkerPool::default(),
        ))
    }

    fn command(method: &str, arguments: Value) -> Command {
        serde_json::from_value(json!({"method": method, "arguments": arguments})).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = dispatcher().handle_line(r#"{"method":"unknown_method","arguments":[]}"#).await;

        assert!(response.result.is_none());
        assert_eq!(
            serde_json::to_value(response.error.unwrap()).unwrap(),
            json!({"type": "InvalidCall", "message": "unknown method: unknown_method", "ok_to_retry": false})
        );
        assert!(response.log.contains("unknown method: unknown_method"));
    }

    #[tokio::test]
    async fn test_response_keys_in_fixed_order() {
        let response = dispatcher().dispatch(command("info", json!([]))).await;
        let line = serde_json::to_string(&response).unwrap();

        let result_at = line.find("\"result\"").unwrap();
        let error_at = line.find("\"error\"").unwrap();
        let log_at = line.find("\"log\"").unwrap();
        assert!(result_at < error_at && error_at < log_at);
        assert!(line.contains("\"error\":null"));
        assert_eq!(response.result.unwrap()["stemcell_formats"], json!(["flowcpi-light"]));
    }

    #[tokio::test]
    async fn test_arity_mismatch_is_invalid_call() {
        let dispatcher = dispatcher();

        let response = dispatcher.dispatch(command("has_vm", json!([]))).await;
        let error = response.error.unwrap();
        assert_eq!(error.error_type, "InvalidCall");
        assert!(error.message.starts_with("invalid arguments for has_vm"));

        let response = dispatcher.dispatch(command("info", json!(["extra"]))).await;
        assert_eq!(response.error.unwrap().error_type, "InvalidCall");

        let response = dispatcher
            .dispatch(command("create_disk", json!(["big", {}, null])))
            .await;
        assert_eq!(response.error.unwrap().error_type, "InvalidCall");
    }

    #[tokio::test]
    async fn test_unit_operations_answer_true() {
        let dispatcher = dispatcher();
        let response = dispatcher.dispatch(command("delete_vm", json!(["vm-404"]))).await;
        assert_eq!(response.result, Some(json!(true)));
        assert!(response.error.is_none());

        let response = dispatcher.dispatch(command("has_vm", json!(["vm-404"]))).await;
        assert_eq!(response.result, Some(json!(false)));
    }

    #[tokio::test]
    async fn test_malformed_command() {
        let response = dispatcher().handle_line("{ not json").await;
        let error = response.error.unwrap();
        assert_eq!(error.error_type, "InvalidCall");
        assert!(error.message.starts_with("malformed command"));
    }

    #[tokio::test]
    async fn test_non_utf8_input_is_malformed() {
        let response = dispatcher().handle_bytes(&[0xff, 0xfe, b'{', b'}']).await;
        assert!(response.result.is_none());
        let error = response.error.unwrap();
        assert_eq!(error.error_type, "InvalidCall");
        assert!(error.message.starts_with("malformed command"));
        assert!(!error.ok_to_retry);
    }

    #[tokio::test]
    async fn test_bytes_are_trimmed_before_parsing() {
        let response = dispatcher()
            .handle_bytes(b"  {\"method\":\"info\",\"arguments\":[]}\n")
            .await;
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_unconfigured_dispatcher() {
        let dispatcher = Dispatcher::unconfigured(CpiError::InvalidCall(
            "missing configuration key: cloud.properties.zone".into(),
        ));
        let response = dispatcher.dispatch(command("info", json!([]))).await;
        let error = response.error.unwrap();
        assert_eq!(error.error_type, "InvalidCall");
        assert_eq!(error.message, "missing configuration key: cloud.properties.zone");
    }

    fn explode() -> Result<Value> {
        panic!("agent settings corrupted")
    }

    #[tokio::test]
    async fn test_panic_becomes_unknown_with_trace_in_log() {
        let mut registry = Registry::new();
        registry.register("explode", |_: Arc<Cpi>, _: NoArguments| async { explode() });
        let dispatcher = dispatcher().with_registry(registry);

        let response = dispatcher.dispatch(command("explode", json!([]))).await;
        let error = response.error.unwrap();
        assert_eq!(error.error_type, "Unknown");
        assert!(!error.ok_to_retry);
        assert!(error.message.contains("agent settings corrupted"));
        assert!(!error.message.contains("Backtrace"));
        assert!(response.log.contains("Backtrace:"));
    }

    #[tokio::test]
    async fn test_request_id_in_log() {
        let command: Command = serde_json::from_value(json!({
            "method": "info",
            "arguments": [],
            "context": {"director_uuid": "d-1", "request_id": "cpi-42"}
        }))
        .unwrap();
        assert_eq!(command.request_id(), "cpi-42");

        let response = dispatcher().dispatch(command).await;
        assert!(response.log.contains("cpi-42"));
    }

    #[test]
    fn test_registry_has_every_operation() {
        let registry = Registry::cpi();
        assert_eq!(
            registry.methods(),
            vec![
                "attach_disk",
                "create_disk",
                "create_stemcell",
                "create_vm",
                "delete_disk",
                "delete_snapshot",
                "delete_stemcell",
                "delete_vm",
                "detach_disk",
                "get_disks",
                "has_disk",
                "has_vm",
                "info",
                "reboot_vm",
                "set_vm_metadata",
                "snapshot_disk",
            ]
        );
        assert!(!registry.contains("unknown_method"));
    }
}
