use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
};
use rust_mcp_schema::{
    CallToolRequestParams, ClientCapabilities, Implementation, InitializeRequestParams,
    InitializeResult, PaginatedRequestParams, RequestId, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::{Map, Value};

use super::ToolExecutionError;
use crate::mcp::catalog::{ToolDescriptor, ToolServer};
use crate::mcp::transport::ServerEnvelope;

pub(crate) fn requested_protocol_version(server: &ToolServer) -> String {
    server
        .protocol_version
        .clone()
        .filter(|version| !version.trim().is_empty())
        .unwrap_or_else(|| LATEST_PROTOCOL_VERSION.to_string())
}

pub(crate) fn client_details_for(server: &ToolServer) -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Toolstream MCP Client".to_string()),
            description: Some("Streaming tool orchestration client".to_string()),
            icons: Vec::new(),
            website_url: None,
        },
        meta: None,
        protocol_version: requested_protocol_version(server),
    }
}

pub(crate) fn request_message(request: RequestFromClient, id: i64) -> Result<Value, ToolExecutionError> {
    let message = ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(id)),
    )
    .map_err(|err| ToolExecutionError::Protocol(err.to_string()))?;
    serde_json::to_value(&message).map_err(|err| ToolExecutionError::Protocol(err.to_string()))
}

pub(crate) fn initialized_notification() -> Result<Value, ToolExecutionError> {
    let message = ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(NotificationFromClient::InitializedNotification(
            None,
        )),
        None,
    )
    .map_err(|err| ToolExecutionError::Protocol(err.to_string()))?;
    serde_json::to_value(&message).map_err(|err| ToolExecutionError::Protocol(err.to_string()))
}

pub(crate) fn call_tool_request(tool_name: &str, arguments: &Map<String, Value>) -> RequestFromClient {
    let params = CallToolRequestParams::new(tool_name).with_arguments(arguments.clone());
    RequestFromClient::CallToolRequest(params)
}

pub(crate) fn list_tools_request(cursor: Option<String>) -> RequestFromClient {
    RequestFromClient::ListToolsRequest(cursor.map(|cursor| PaginatedRequestParams {
        cursor: Some(cursor),
        meta: None,
    }))
}

/// The `result` of a response, or the RPC error it carries.
pub(crate) fn response_result(envelope: ServerEnvelope) -> Result<Value, ToolExecutionError> {
    if let Some(error) = envelope.error() {
        return Err(ToolExecutionError::Rpc(format_rpc_error(&error)));
    }
    match envelope.into_value() {
        Value::Object(mut object) => object
            .remove("result")
            .ok_or_else(|| ToolExecutionError::Protocol("response without result".to_string())),
        other => Err(ToolExecutionError::Protocol(format!(
            "Unexpected MCP server message: {other}"
        ))),
    }
}

pub(crate) fn parse_initialize_result(envelope: ServerEnvelope) -> Result<InitializeResult, ToolExecutionError> {
    let value = response_result(envelope)?;
    let result = serde_json::from_value::<InitializeResult>(value)
        .map_err(|err| ToolExecutionError::Protocol(err.to_string()))?;
    if result.protocol_version.trim().is_empty() {
        return Err(ToolExecutionError::Protocol(
            "Unexpected initialize response.".to_string(),
        ));
    }
    Ok(result)
}

/// One page of `tools/list`: descriptors plus the next cursor.
pub(crate) fn parse_tools_page(result: &Value) -> (Vec<ToolDescriptor>, Option<String>) {
    let tools = result
        .get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|tool| {
                    let name = tool.get("name")?.as_str()?.trim();
                    if name.is_empty() {
                        return None;
                    }
                    let description = tool
                        .get("description")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    let schema = tool.get("inputSchema").cloned().unwrap_or(Value::Null);
                    Some(ToolDescriptor::from_input_schema(name, description, &schema))
                })
                .collect()
        })
        .unwrap_or_default();
    let next_cursor = result
        .get("nextCursor")
        .and_then(Value::as_str)
        .filter(|cursor| !cursor.is_empty())
        .map(str::to_string);
    (tools, next_cursor)
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    let mut output = format!("MCP error {}: {}", error.code, error.message);
    if let Some(data) = &error.data {
        let details = data
            .get("details")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string())
            .or_else(|| data.as_str().map(|value| value.to_string()))
            .or_else(|| serde_json::to_string_pretty(data).ok());

        if let Some(details) = details {
            if !details.is_empty() {
                output.push('\n');
                output.push_str(&details);
            }
        }
    }
    output
}
