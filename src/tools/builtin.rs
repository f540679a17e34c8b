//! Built-in tools available without any external server

use std::fmt::Write;
use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::{json, Value};
use crate::Result;
use crate::error::Error;
use super::Tool;

/// Report the current date and time
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str { "current_time" }
    fn description(&self) -> &str { "Get the current date and time" }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "utc": {
                    "type": "boolean",
                    "description": "Report UTC instead of local time"
                },
                "format": {
                    "type": "string",
                    "description": "strftime format (default: %Y-%m-%d %H:%M:%S)"
                }
            }
        })
    }

    async fn execute(&self, params: Value) -> Result<String> {
        let utc = params.get("utc").and_then(Value::as_bool).unwrap_or(false);
        let format = params
            .get("format")
            .and_then(Value::as_str)
            .unwrap_or("%Y-%m-%d %H:%M:%S");

        // chrono reports a bad format string as a fmt error
        let mut now = String::new();
        let written = if utc {
            write!(now, "{}", Utc::now().format(format))
        } else {
            write!(now, "{}", Local::now().format(format))
        };
        written.map_err(|_| Error::ToolExecution(format!("Invalid time format: {format}")))?;
        Ok(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_time_format() {
        let out = CurrentTimeTool
            .execute(json!({"utc": true, "format": "%Y"}))
            .await
            .unwrap();
        assert_eq!(out.len(), 4);
        assert!(out.chars().all(|c| c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_bad_format_is_an_error() {
        let result = CurrentTimeTool.execute(json!({"format": "%Q"})).await;
        assert!(result.is_err());
    }
}
