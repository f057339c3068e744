use schemars::JsonSchema;
use serde::Deserialize;

use crate::output_store::OutputType;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListExecutionOutputsRequest {
    /// Only list captures of this type
    pub output_type: Option<OutputType>,
    /// Only list captures belonging to this execution
    pub execution_id: Option<String>,
    /// Only list captures whose name (or id) contains this substring
    pub name_pattern: Option<String>,
    /// Maximum entries to return
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ReadExecutionOutputRequest {
    /// Capture identifier from an execution record or the list operation
    pub output_id: String,
    /// Byte offset to start reading from
    #[serde(default)]
    pub offset: u64,
    /// Bytes to read (default 8192)
    #[serde(default = "default_read_size")]
    pub size: usize,
    /// Content encoding: utf-8 (default, lossy) or hex
    #[serde(default = "default_encoding")]
    pub encoding: String,
}

fn default_read_size() -> usize {
    8192
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeleteExecutionOutputsRequest {
    /// Capture identifiers to delete
    pub output_ids: Vec<String>,
    /// Must be true; deletion never happens implicitly
    #[serde(default)]
    pub confirm: bool,
}
