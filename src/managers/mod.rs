pub mod api;

use crate::errors::ToolError;
use serde_json::Value;

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn handle(&self, args: Value) -> Result<Value, ToolError>;
}
