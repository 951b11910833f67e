use std::fs;
use std::path::Path;

use anyhow::Context;
use serde_json::json;

use dartlink_relay::registry::{ProcedureKind, RegisteredProcedure};

/// Load the static procedure set: the operator's JSON descriptor file when
/// configured, the built-in defaults otherwise.
pub fn load(path: Option<&Path>) -> anyhow::Result<Vec<RegisteredProcedure>> {
    let Some(path) = path else {
        return Ok(defaults());
    };
    let data = fs::read_to_string(path)
        .with_context(|| format!("reading static tools from {}", path.display()))?;
    let procedures: Vec<RegisteredProcedure> = serde_json::from_str(&data)
        .with_context(|| format!("parsing static tools from {}", path.display()))?;
    Ok(procedures)
}

/// Built-in pass-through tools. The invocation targets are standard Flutter
/// service extensions; their payloads stay opaque to the bridge.
pub fn defaults() -> Vec<RegisteredProcedure> {
    vec![
        descriptor(
            "hot_reload",
            "Hot reload",
            "Reassemble the running Flutter application",
            "ext.flutter.reassemble",
            ProcedureKind::Tool,
        ),
        descriptor(
            "dump_widget_tree",
            "Dump widget tree",
            "Dump the app's widget hierarchy",
            "ext.flutter.debugDumpApp",
            ProcedureKind::Resource,
        ),
        descriptor(
            "dump_render_tree",
            "Dump render tree",
            "Dump the app's render-object tree",
            "ext.flutter.debugDumpRenderTree",
            ProcedureKind::Resource,
        ),
    ]
}

fn descriptor(
    id: &str,
    display_name: &str,
    description: &str,
    invocation_target: &str,
    kind: ProcedureKind,
) -> RegisteredProcedure {
    RegisteredProcedure {
        id: id.to_string(),
        kind,
        display_name: display_name.to_string(),
        description: Some(description.to_string()),
        invocation_target: invocation_target.to_string(),
        input_schema: Some(json!({"type": "object"})),
        output_schema: None,
        owner_connection_id: None,
    }
}
