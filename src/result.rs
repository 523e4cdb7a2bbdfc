//! The structured outcome of one task execution. Workers build these and
//! publish them as result blobs; the driver only ever reads them.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::common::human_readable_size;
use crate::store::Store;

#[derive(Debug, Copy, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultType {
    Value,
    Exception,
}

impl std::fmt::Display for ResultType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value => write!(f, "value"),
            Self::Exception => write!(f, "exception"),
        }
    }
}

impl std::str::FromStr for ResultType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "value" => Ok(Self::Value),
            "exception" => Ok(Self::Exception),
            other => bail!("unknown result type: {}", other),
        }
    }
}

/// Structured description of a worker-side failure. Error values do not
/// round-trip across process boundaries; a kind tag, a message, and a
/// formatted trace string do.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskError {
    pub kind: String,
    pub message: String,
    pub traceback: Option<String>,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        TaskError {
            kind: kind.into(),
            message: message.into(),
            traceback: None,
        }
    }

    pub fn with_traceback(mut self, traceback: impl Into<String>) -> Self {
        self.traceback = Some(traceback.into());
        self
    }

    pub fn from_error(kind: impl Into<String>, err: &anyhow::Error) -> Self {
        TaskError {
            kind: kind.into(),
            message: err.to_string(),
            traceback: Some(format!("{:?}", err)),
        }
    }

    pub fn into_error(self) -> anyhow::Error {
        match self.traceback {
            Some(traceback) => anyhow!("task failed ({}): {}\n{}", self.kind, self.message, traceback),
            None => anyhow!("task failed ({}): {}", self.kind, self.message),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Worker process details recorded alongside every result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub hostname: String,
    pub invocation_args: Vec<String>,
    pub os: String,
    pub pid: u32,
}

impl ProcessInfo {
    pub fn current() -> Self {
        ProcessInfo {
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            invocation_args: std::env::args().collect(),
            os: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            pid: std::process::id(),
        }
    }
}

/// Source blob details, filled in on deserialization.
#[derive(Debug, Clone)]
pub struct BlobInfo {
    pub name: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub start_time: f64,
    pub end_time: f64,
    pub input_size: Option<u64>,
    pub result_type: ResultType,
    pub return_value: Option<Value>,
    pub error: Option<TaskError>,
    pub process_info: ProcessInfo,
    #[serde(skip)]
    pub source: Option<BlobInfo>,
}

impl ResultEnvelope {
    pub fn value(
        start_time: f64,
        end_time: f64,
        input_size: Option<u64>,
        return_value: Value,
    ) -> Self {
        ResultEnvelope {
            start_time,
            end_time,
            input_size,
            result_type: ResultType::Value,
            return_value: Some(return_value),
            error: None,
            process_info: ProcessInfo::current(),
            source: None,
        }
    }

    pub fn exception(
        start_time: f64,
        end_time: f64,
        input_size: Option<u64>,
        error: TaskError,
    ) -> Self {
        ResultEnvelope {
            start_time,
            end_time,
            input_size,
            result_type: ResultType::Exception,
            return_value: None,
            error: Some(error),
            process_info: ProcessInfo::current(),
            source: None,
        }
    }

    pub async fn from_store(store: &Store, name: &str) -> Result<Self> {
        let bytes = store.get(name).await?;
        let mut envelope: ResultEnvelope = serde_json::from_slice(&bytes)?;
        envelope.source = Some(BlobInfo {
            name: name.to_string(),
            bytes: bytes.len() as u64,
        });
        Ok(envelope)
    }

    pub fn run_seconds(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Re-raise the carried worker failure in the driver; no-op for a
    /// value result.
    pub fn raise_if_error(&self) -> Result<()> {
        match &self.error {
            Some(error) => {
                error!("re-raising task exception");
                Err(error.clone().into_error())
            }
            None => Ok(()),
        }
    }

    pub fn description(&self, indent: &str) -> String {
        let start = chrono::DateTime::from_timestamp(self.start_time as i64, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
            .unwrap_or_else(|| format!("{}", self.start_time));

        let mut fields: Vec<(&str, String)> = vec![
            ("result type", self.result_type.to_string()),
            ("start time", start),
            ("run time", format!("{:.3} sec", self.run_seconds())),
            ("hostname", self.process_info.hostname.clone()),
            ("os", self.process_info.os.clone()),
            (
                "invocation arguments",
                self.process_info.invocation_args.join("\n"),
            ),
        ];
        if let Some(input_size) = self.input_size {
            fields.push(("input size", human_readable_size(input_size)));
        }
        if let Some(source) = &self.source {
            fields.push(("result size", human_readable_size(source.bytes)));
        }
        match (&self.error, &self.return_value) {
            (Some(error), _) => {
                fields.push(("exception", error.to_string()));
                if let Some(traceback) = &error.traceback {
                    fields.push(("traceback", traceback.clone()));
                }
            }
            (None, Some(value)) => {
                fields.push(("return value type", json_type_name(value).to_string()));
            }
            (None, None) => {}
        }

        let width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        let continuation = format!("\n    {}", " ".repeat(width));
        let body = fields
            .iter()
            .map(|(key, value)| {
                format!("{:>width$} : {}", key, value.replace('\n', &continuation))
            })
            .collect::<Vec<_>>()
            .join("\n");
        format!("\n{}", body).replace('\n', &format!("\n{}", indent))
    }

    pub fn log(&self) {
        let indent = " *  ";
        match self.result_type {
            ResultType::Value => debug!("result (success): {}", self.description(indent)),
            ResultType::Exception => error!("result (exception): {}", self.description(indent)),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = ResultEnvelope::value(10.0, 12.5, Some(128), json!([1, 2, 3]));
        let bytes = serde_json::to_vec(&envelope).unwrap();
        let restored: ResultEnvelope = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(restored.result_type, ResultType::Value);
        assert_eq!(restored.return_value, Some(json!([1, 2, 3])));
        assert_eq!(restored.run_seconds(), 2.5);
        assert!(restored.raise_if_error().is_ok());
    }

    #[test]
    fn test_exception_envelope() {
        let error = TaskError::new("divide", "division by zero")
            .with_traceback("divide_task\n  at items[2]");
        let envelope = ResultEnvelope::exception(1.0, 2.0, None, error);
        let err = envelope.raise_if_error().unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("division by zero"), "{}", message);

        let description = envelope.description(" *  ");
        assert!(description.contains("exception"));
        assert!(description.contains("divide_task"));
    }

    #[test]
    fn test_result_type_strings() {
        assert_eq!(ResultType::Value.to_string(), "value");
        assert_eq!("exception".parse::<ResultType>().unwrap(), ResultType::Exception);
        assert!("bogus".parse::<ResultType>().is_err());
    }
}
