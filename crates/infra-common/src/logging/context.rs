use std::collections::BTreeMap;
use std::fmt;
use tracing::{Level, Span};

/// Context information attached to a span
///
/// The orchestrator builds one per test and per scenario actor so that every
/// log line emitted by an actor carries the test and actor names.
#[derive(Debug, Clone)]
pub struct LogContext {
    /// Component that is generating the log
    pub component: String,
    /// Operation or action being performed
    pub operation: Option<String>,
    /// Additional contextual fields, rendered in key order
    pub fields: BTreeMap<String, String>,
}

impl LogContext {
    pub fn new<S: Into<String>>(component: S) -> Self {
        LogContext {
            component: component.into(),
            operation: None,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_operation<S: Into<String>, T: Into<String>>(component: S, operation: T) -> Self {
        LogContext {
            component: component.into(),
            operation: Some(operation.into()),
            fields: BTreeMap::new(),
        }
    }

    /// Context for one scenario actor of one test
    pub fn actor<S: Into<String>, T: Into<String>>(test: S, actor: T) -> Self {
        LogContext::with_operation("scenario", actor).with_field("test", test)
    }

    pub fn with_field<S: Into<String>, T: Into<String>>(mut self, key: S, value: T) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    fn rendered_fields(&self) -> String {
        self.fields
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Create a span carrying this context
    pub fn span(&self, level: Level) -> Span {
        let op = self.operation.as_deref().unwrap_or("-");
        let fields = self.rendered_fields();
        match level {
            Level::TRACE | Level::DEBUG => {
                tracing::debug_span!("sipdrill", component = %self.component, operation = %op, fields = %fields)
            }
            _ => {
                tracing::info_span!("sipdrill", component = %self.component, operation = %op, fields = %fields)
            }
        }
    }
}

impl fmt::Display for LogContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.component)?;

        if let Some(op) = &self.operation {
            write!(f, "[{}]", op)?;
        }

        for (key, value) in &self.fields {
            write!(f, "[{}={}]", key, value)?;
        }

        Ok(())
    }
}
