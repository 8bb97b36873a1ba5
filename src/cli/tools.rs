use std::error::Error;
use std::path::Path;

use tracing::{info, warn};

use crate::core::config::{path_display, EngineConfig};
use crate::mcp::catalog::ToolServer;
use crate::mcp::client::{ExecutorOptions, ToolExecutor};

pub async fn run_tools(
    mut config: EngineConfig,
    config_path: &Path,
    sync: bool,
) -> Result<(), Box<dyn Error>> {
    if config.tool_servers.is_empty() {
        println!("No tool servers configured.");
        println!(
            "Add a [[tool_servers]] entry to {}",
            path_display(config_path)
        );
        return Ok(());
    }

    if sync {
        let executor = ToolExecutor::new(ExecutorOptions {
            request_timeout: config.engine.tool_timeout(),
            connect_timeout: config.engine.connect_timeout(),
            server_messages: None,
        });
        let mut failures = 0usize;
        for server in config.tool_servers.iter_mut().filter(|server| server.enabled) {
            match executor.sync_tools(server).await {
                Ok(synced) => {
                    info!(server = %server.id, tools = synced.tools.len(), "Synced tool list");
                    server.tools = synced.tools;
                    server.last_sync_at = Some(synced.last_sync_at);
                }
                Err(err) => {
                    failures += 1;
                    warn!(server = %server.id, error = %err, "Tool sync failed");
                    eprintln!("❌ {}: {err}", server.label());
                }
            }
        }
        executor.shutdown().await;
        config.save_to_path(config_path)?;
        if failures > 0 {
            eprintln!("{failures} server(s) could not be synced; their previous tool lists were kept.");
        }
    }

    for server in &config.tool_servers {
        print!("{}", server_listing(server));
    }
    Ok(())
}

/// Human-readable block describing one server and its known tools.
pub fn server_listing(server: &ToolServer) -> String {
    let mut out = format!(
        "{} [{}] {} ({})",
        server.label(),
        server.id,
        server.base_url,
        server.protocol.as_str()
    );
    if !server.enabled {
        out.push_str(" (disabled)");
    }
    out.push('\n');
    match server.last_sync_at {
        Some(at) => out.push_str(&format!("  synced {}\n", at.format("%Y-%m-%d %H:%M UTC"))),
        None => out.push_str("  never synced\n"),
    }
    if server.tools.is_empty() {
        out.push_str("  (no tools)\n");
    }
    for tool in &server.tools {
        match tool.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            Some(description) => out.push_str(&format!("  • {}: {description}\n", tool.name)),
            None => out.push_str(&format!("  • {}\n", tool.name)),
        }
    }
    out
}
