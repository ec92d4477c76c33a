//! `/server/files/list`, `/server/files/metadata`, `/server/files/directory`,
//! `/server/files/move`, `/server/files/copy`, `/server/files/delete_file`.
//!
//! Grounded on `components/file_manager.py`'s corresponding HTTP handlers,
//! re-expressed against `gateway_core::files::FileRootsManager`'s already
//! transport-agnostic API.

use std::path::PathBuf;

use gateway_core::GatewayError;
use serde_json::{json, Value};

use crate::state::AppState;
use crate::web::WebRequest;

fn gcodes_root_path(state: &AppState) -> Option<PathBuf> {
    state.roots.root("gcodes").map(|root| root.path)
}

pub async fn list(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    let root_name = req.get_str("root", Some("gcodes"))?;
    let root = state
        .roots
        .root(&root_name)
        .ok_or_else(|| GatewayError::not_found(format!("root '{root_name}' not registered")))?;
    let gcodes_root = gcodes_root_path(&state);
    let listing = state
        .roots
        .list_directory(&root.path, gcodes_root.as_deref(), true, Some(&state.metadata))
        .await?;
    Ok(json!({"files": listing.files, "disk_usage": listing.disk_usage}))
}

pub async fn metadata(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    let filename = req.get_str("filename", None)?;
    match state.metadata.get(&filename) {
        Some(record) => Ok(Value::Object(record.into_iter().collect())),
        None => Err(GatewayError::not_found(format!("no metadata for '{filename}'"))),
    }
}

pub async fn directory(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    let path = req.get_str("path", None)?;
    let (root, abs_path) = state.roots.convert_request_path(&path)?;

    match req.action()?.as_str() {
        "GET" => {
            let extended = req.get_boolean("extended", Some(false))?;
            let gcodes_root = gcodes_root_path(&state);
            let listing = state.roots.list_directory(&abs_path, gcodes_root.as_deref(), extended, Some(&state.metadata)).await?;
            Ok(json!({"dirs": listing.dirs, "files": listing.files, "disk_usage": listing.disk_usage}))
        }
        "POST" => {
            state.roots.create_directory(&root, &abs_path).await?;
            Ok(json!({"item": {"path": path, "root": root.name}, "action": "create_dir"}))
        }
        "DELETE" => {
            let force = req.get_boolean("force", Some(false))?;
            state.roots.delete_directory(&root, &abs_path, force, state.print_status.as_ref()).await?;
            Ok(json!({"item": {"path": path, "root": root.name}, "action": "delete_dir"}))
        }
        other => Err(GatewayError::bad_request(format!("unsupported action '{other}' for /server/files/directory"))),
    }
}

pub async fn move_file(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    transfer(req, state, true).await
}

pub async fn copy_file(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    transfer(req, state, false).await
}

async fn transfer(req: WebRequest, state: AppState, is_move: bool) -> Result<Value, GatewayError> {
    let source = req.get_str("source", None)?;
    let dest = req.get_str("dest", None)?;
    let (source_root, source_path) = state.roots.convert_request_path(&source)?;
    let (dest_root, dest_path) = state.roots.convert_request_path(&dest)?;
    state
        .roots
        .move_or_copy(&source_root, &source_path, &dest_root, &dest_path, is_move, state.print_status.as_ref())
        .await?;
    Ok(json!({
        "item": {"path": dest, "root": dest_root.name},
        "source_item": {"path": source, "root": source_root.name},
        "action": if is_move { "move_item" } else { "copy_item" },
    }))
}

pub async fn delete_file(req: WebRequest, state: AppState) -> Result<Value, GatewayError> {
    let path = req.get_str("path", None)?;
    let (root, abs_path) = state.roots.convert_request_path(&path)?;
    state.roots.delete_file(&root, &abs_path, state.print_status.as_ref()).await?;
    Ok(json!({"item": {"path": path, "root": root.name}, "action": "delete_file"}))
}
