//! Multipart upload ingest, shared by `/server/files/upload` and the
//! OctoPrint-compatible `/api/files/local` alias.
//!
//! Grounded on `components/file_manager.py::_parse_upload_args` /
//! `finalize_upload` / `_finish_gcode_upload`: stream the body to a
//! temp file named with a monotonic timestamp, validate the destination
//! root and path, reject uploads while the destination is the active
//! print, extract embedded gcode from `.ufp` packages, then synchronously
//! run the metadata extractor before answering so the response already
//! reflects the parsed record.
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::{Multipart, State};
use axum::Json;
use gateway_core::files::roots::FULL_ACCESS_ROOTS;
use gateway_core::GatewayError;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use crate::state::AppState;

struct ParsedUpload {
    root: String,
    filename: String,
    dir_path: String,
    print: bool,
    tmp_path: PathBuf,
}

fn gen_temp_upload_path() -> PathBuf {
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis()).unwrap_or(0);
    std::env::temp_dir().join(format!("gateway.upload-{stamp}.mru"))
}

pub async fn handle_upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<Value>, GatewayError> {
    let mut root = "gcodes".to_string();
    let mut dir_path = String::new();
    let mut filename: Option<String> = None;
    let mut print = false;
    let mut tmp_path: Option<PathBuf> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| GatewayError::bad_request(err.to_string()))? {
        match field.name().unwrap_or_default() {
            "root" => root = field.text().await.map_err(|e| GatewayError::bad_request(e.to_string()))?.to_lowercase(),
            "path" => dir_path = field.text().await.map_err(|e| GatewayError::bad_request(e.to_string()))?,
            "print" => print = field.text().await.map_err(|e| GatewayError::bad_request(e.to_string()))? == "true",
            "filename" => filename = Some(field.text().await.map_err(|e| GatewayError::bad_request(e.to_string()))?),
            "file" => {
                let field_filename = field.file_name().map(str::to_string);
                if filename.is_none() {
                    filename = field_filename;
                }
                let dest = gen_temp_upload_path();
                let mut out = tokio::fs::File::create(&dest).await?;
                let bytes = field.bytes().await.map_err(|e| GatewayError::bad_request(e.to_string()))?;
                out.write_all(&bytes).await?;
                out.flush().await?;
                tmp_path = Some(dest);
            }
            _ => {}
        }
    }

    let tmp_path = tmp_path.ok_or_else(|| GatewayError::bad_request("no file part in upload"))?;
    let filename = filename.ok_or_else(|| GatewayError::bad_request("no filename specified in upload form"))?;

    let result = finalize_upload(
        &state,
        ParsedUpload {
            root,
            filename,
            dir_path,
            print,
            tmp_path: tmp_path.clone(),
        },
    )
    .await;

    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp_path).await;
    }
    result.map(Json)
}

async fn finalize_upload(state: &AppState, upload: ParsedUpload) -> Result<Value, GatewayError> {
    if upload.root != "gcodes" && !FULL_ACCESS_ROOTS.contains(&upload.root.as_str()) {
        return Err(GatewayError::bad_request(format!("invalid root request: {}", upload.root)));
    }
    let root = state
        .roots
        .root(&upload.root)
        .ok_or_else(|| GatewayError::bad_request(format!("root '{}' not available", upload.root)))?;

    let rel_name = upload.filename.trim().trim_start_matches('/');
    let mut rel_path = if upload.dir_path.is_empty() {
        PathBuf::from(rel_name)
    } else {
        PathBuf::from(&upload.dir_path).join(rel_name)
    };

    let mut unzip_ufp = false;
    if upload.root == "gcodes" && rel_path.extension().map(|e| e.eq_ignore_ascii_case("ufp")).unwrap_or(false) {
        unzip_ufp = true;
        rel_path.set_extension("gcode");
    }

    let dest_path = root.path.join(&rel_path);
    if let Some(parent) = dest_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut print_ongoing = false;
    let mut start_print = upload.print;
    if upload.root == "gcodes" {
        match state.print_status.current_print().await {
            Some((loaded_path, true)) if loaded_path == dest_path => {
                return Err(GatewayError::forbidden("file is loaded, upload not permitted"));
            }
            Some((_, active)) => print_ongoing = active,
            None => start_print = false,
        }
    }
    start_print = start_print && !print_ongoing;

    if unzip_ufp {
        extract_ufp(&upload.tmp_path, &dest_path).await?;
    } else {
        tokio::fs::rename(&upload.tmp_path, &dest_path).await?;
    }

    let meta = tokio::fs::metadata(&dest_path).await?;
    let size = meta.len();
    let modified = meta.modified().ok().and_then(|m| m.duration_since(UNIX_EPOCH).ok()).map(|d| d.as_secs_f64()).unwrap_or(0.0);

    let rel_path_str = rel_path.to_string_lossy().replace('\\', "/");
    if upload.root == "gcodes" {
        let _ = state.metadata.parse_metadata(&rel_path_str, size, modified, true).await;
    }

    let mut print_started = false;
    if start_print {
        match state.host.make_request("printer.print.start", json!({"filename": rel_path_str})).await {
            Ok(_) => print_started = true,
            Err(_) => print_started = false,
        }
    }

    Ok(json!({
        "filename": rel_path_str,
        "print_started": print_started,
    }))
}

/// Pulls `/3D/model.gcode` out of a UFP package and removes the package.
async fn extract_ufp(ufp_path: &Path, dest_path: &Path) -> Result<(), GatewayError> {
    const UFP_MODEL_ENTRY: &str = "3D/model.gcode";
    let ufp_path = ufp_path.to_path_buf();
    let dest_path = dest_path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<(), GatewayError> {
        let file = std::fs::File::open(&ufp_path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|err| GatewayError::bad_request(format!("invalid ufp package: {err}")))?;
        let mut entry = archive
            .by_name(UFP_MODEL_ENTRY)
            .map_err(|_| GatewayError::bad_request("ufp package has no embedded model.gcode"))?;
        let mut out = std::fs::File::create(&dest_path)?;
        std::io::copy(&mut entry, &mut out)?;
        drop(out);
        let _ = std::fs::remove_file(&ufp_path);
        Ok(())
    })
    .await
    .map_err(|err| GatewayError::internal(format!("ufp extraction task panicked: {err}")))?
}
