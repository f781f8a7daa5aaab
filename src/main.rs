use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use base64::prelude::*;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;

mod cmyk;
mod config;
mod raster_export;
mod sheet;

#[cfg(test)]
mod render_tests;

use config::Config;
use raster_export::{PreviewSurface, export_filename, export_pdf, export_png};
use sheet::{CardSlot, ExportScope, LayoutSettings, RenderableDocument, SheetDocument};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the web server
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Render card images to a PDF or PNG without the server
    Render {
        /// Card image files, filling slots in page order
        images: Vec<PathBuf>,
        #[arg(short, long, default_value = "pdf")]
        format: String,
        #[arg(short, long, default_value = "standard")]
        quality: String,
        #[arg(short, long, default_value = "out.pdf")]
        output: PathBuf,
        /// Apply the simple CMYK print simulation
        #[arg(long)]
        cmyk: bool,
    },
}

struct AppState {
    document: SheetDocument,
    settings: LayoutSettings,
    preview: PreviewSurface,
    exporting_pdf: bool,
    exporting_png: bool,
}

type SharedState = Arc<Mutex<AppState>>;

impl AppState {
    fn new() -> AppState {
        AppState {
            document: SheetDocument::new(),
            settings: LayoutSettings::default(),
            preview: PreviewSurface::new(),
            exporting_pdf: false,
            exporting_png: false,
        }
    }
}

/// Dismissable user-facing notification: short title plus detail.
#[derive(Serialize)]
struct Notice {
    title: String,
    detail: String,
}

impl Notice {
    fn new(title: &str, detail: impl ToString) -> Notice {
        Notice {
            title: title.to_string(),
            detail: detail.to_string(),
        }
    }
}

type ApiError = (StatusCode, Json<Notice>);

fn conflict(title: &str, detail: impl ToString) -> ApiError {
    (StatusCode::CONFLICT, Json(Notice::new(title, detail)))
}

#[derive(Serialize)]
struct Status {
    status: String,
    pages: usize,
    active_page: usize,
}

async fn get_status(State(state): State<SharedState>) -> Json<Status> {
    let state = state.lock().unwrap();
    Json(Status {
        status: "ok".to_string(),
        pages: state.document.pages().len(),
        active_page: state.document.active_index(),
    })
}

async fn get_document(State(state): State<SharedState>) -> Json<RenderableDocument> {
    let state = state.lock().unwrap();
    Json(state.document.renderable(&state.settings))
}

async fn upload_card(
    State(state): State<SharedState>,
    mut multipart: Multipart,
) -> Result<Json<RenderableDocument>, ApiError> {
    let mut page: Option<usize> = None;
    let mut slot: Option<usize> = None;
    let mut data: Option<Vec<u8>> = None;

    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().unwrap_or("").to_string();
                let bytes = field.bytes().await.map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        Json(Notice::new("Upload failed", e)),
                    )
                })?;
                match name.as_str() {
                    "page" => page = String::from_utf8_lossy(&bytes).trim().parse().ok(),
                    "slot" => slot = String::from_utf8_lossy(&bytes).trim().parse().ok(),
                    "file" => data = Some(bytes.to_vec()),
                    _ => {}
                }
            }
            Ok(None) => break,
            Err(e) => {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(Notice::new("Upload failed", e)),
                ));
            }
        }
    }

    let slot_index = slot.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(Notice::new("Upload failed", "missing slot index")),
        )
    })?;
    let data = data.ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(Notice::new("Upload failed", "missing file field")),
        )
    })?;

    let mut state = state.lock().unwrap();
    let card = CardSlot::from_bytes(&data, state.settings.card).map_err(|e| {
        log::warn!("card image decode failed: {e}");
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(Notice::new("Image could not be decoded", e)),
        )
    })?;
    let page_index = page.unwrap_or(state.document.active_index());
    let page = state.document.page_mut(page_index).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(Notice::new("No such page", page_index)),
        )
    })?;
    page.set_slot(slot_index, card)
        .map_err(|e| (StatusCode::BAD_REQUEST, Json(Notice::new("Bad slot", e))))?;
    log::info!("card placed on page {page_index} slot {slot_index}");
    Ok(Json(state.document.renderable(&state.settings)))
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
enum Action {
    SetSlotImage {
        page: Option<usize>,
        slot: usize,
        /// Raw base64 or a data URL.
        data: String,
    },
    UpdateSlot {
        page: Option<usize>,
        slot: usize,
        scale: Option<f32>,
        position: Option<[f32; 2]>,
    },
    ClearSlot {
        page: Option<usize>,
        slot: usize,
    },
    AddPage,
    DeletePage {
        index: usize,
    },
    SetActivePage {
        index: usize,
    },
    SetSettings {
        settings: LayoutSettings,
    },
}

async fn perform_action(
    State(state): State<SharedState>,
    Json(action): Json<Action>,
) -> Result<Json<RenderableDocument>, ApiError> {
    let mut state = state.lock().unwrap();
    let active = state.document.active_index();
    let bad_request =
        |title: &str, e: anyhow::Error| (StatusCode::BAD_REQUEST, Json(Notice::new(title, e)));

    match action {
        Action::SetSlotImage { page, slot, data } => {
            let payload = data.rsplit_once(',').map(|(_, b)| b).unwrap_or(&data);
            let bytes = BASE64_STANDARD.decode(payload).map_err(|e| {
                (
                    StatusCode::BAD_REQUEST,
                    Json(Notice::new("Invalid image payload", e)),
                )
            })?;
            let card = CardSlot::from_bytes(&bytes, state.settings.card).map_err(|e| {
                log::warn!("card image decode failed: {e}");
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(Notice::new("Image could not be decoded", e)),
                )
            })?;
            let page_index = page.unwrap_or(active);
            let page = state.document.page_mut(page_index).ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    Json(Notice::new("No such page", page_index)),
                )
            })?;
            page.set_slot(slot, card)
                .map_err(|e| bad_request("Bad slot", e))?;
        }
        Action::UpdateSlot {
            page,
            slot,
            scale,
            position,
        } => {
            let page_index = page.unwrap_or(active);
            let page = state.document.page_mut(page_index).ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    Json(Notice::new("No such page", page_index)),
                )
            })?;
            page.update_slot(slot, scale, position)
                .map_err(|e| bad_request("Bad slot update", e))?;
        }
        Action::ClearSlot { page, slot } => {
            let page_index = page.unwrap_or(active);
            let page = state.document.page_mut(page_index).ok_or_else(|| {
                (
                    StatusCode::NOT_FOUND,
                    Json(Notice::new("No such page", page_index)),
                )
            })?;
            page.clear_slot(slot)
                .map_err(|e| bad_request("Bad slot", e))?;
        }
        Action::AddPage => {
            state.document.add_page();
        }
        Action::DeletePage { index } => {
            state
                .document
                .delete_page(index)
                .map_err(|e| conflict("Cannot delete page", e))?;
        }
        Action::SetActivePage { index } => {
            state
                .document
                .set_active(index)
                .map_err(|e| bad_request("No such page", e))?;
        }
        Action::SetSettings { settings } => {
            settings
                .validate()
                .map_err(|e| bad_request("Bad settings", e))?;
            state.settings = settings;
        }
    }
    Ok(Json(state.document.renderable(&state.settings)))
}

#[derive(Deserialize)]
struct PreviewParams {
    width: f32,
    page: Option<usize>,
}

async fn get_preview(
    State(state): State<SharedState>,
    Query(params): Query<PreviewParams>,
) -> Result<impl IntoResponse, ApiError> {
    let mut state = state.lock().unwrap();
    let page_index = params.page.unwrap_or(state.document.active_index());
    let AppState {
        document,
        settings,
        preview,
        ..
    } = &mut *state;
    let page = document.page(page_index).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            Json(Notice::new("No such page", page_index)),
        )
    })?;
    let canvas = preview.render(page, settings, params.width).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(Notice::new("Invalid preview width", params.width)),
        )
    })?;
    let png = raster_export::encode_png(canvas).map_err(|e| {
        log::error!("preview encode failed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(Notice::new("Preview failed", e)),
        )
    })?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

#[derive(Clone, Copy, PartialEq)]
enum ExportFormat {
    Pdf,
    Png,
}

/// Clears the per-format in-flight flag on every exit path, including
/// panics inside the blocking render task.
struct ExportGuard {
    state: SharedState,
    format: ExportFormat,
}

impl Drop for ExportGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        match self.format {
            ExportFormat::Pdf => state.exporting_pdf = false,
            ExportFormat::Png => state.exporting_png = false,
        }
    }
}

#[derive(Deserialize)]
struct ExportParams {
    format: String, // "pdf" or "png"
}

async fn export_file(
    State(state): State<SharedState>,
    Query(params): Query<ExportParams>,
) -> Result<impl IntoResponse, ApiError> {
    let format = match params.format.as_str() {
        "pdf" => ExportFormat::Pdf,
        "png" => ExportFormat::Png,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(Notice::new("Unknown export format", other)),
            ));
        }
    };

    // Snapshot under the lock, render outside it. The busy flag keeps a
    // second export of the same format from racing this one.
    let (document, settings) = {
        let mut st = state.lock().unwrap();
        match format {
            ExportFormat::Pdf => {
                if st.exporting_pdf {
                    return Err(conflict("Export busy", "a PDF export is already running"));
                }
                st.exporting_pdf = true;
            }
            ExportFormat::Png => {
                if st.exporting_png {
                    return Err(conflict("Export busy", "a PNG export is already running"));
                }
                st.exporting_png = true;
            }
        }
        (st.document.clone(), st.settings.clone())
    };
    let _guard = ExportGuard {
        state: state.clone(),
        format,
    };

    let icc_profile = Config::from_env().icc_profile;
    let dpi = settings.quality.dpi();
    let scope = settings.scope;
    let joined = tokio::task::spawn_blocking(move || match format {
        ExportFormat::Pdf => export_pdf(&document, &settings, icc_profile.as_deref()),
        ExportFormat::Png => export_png(&document, &settings, icc_profile.as_deref()),
    })
    .await;

    let blob = match joined {
        Ok(Ok(blob)) => blob,
        Ok(Err(e)) => {
            log::error!("export failed: {e}");
            let status = if e.to_string().contains("not implemented") {
                StatusCode::NOT_IMPLEMENTED
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            return Err((status, Json(Notice::new("Export failed", e))));
        }
        Err(e) => {
            log::error!("export task failed: {e}");
            return Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(Notice::new("Export failed", e)),
            ));
        }
    };

    let (content_type, extension) = match format {
        ExportFormat::Pdf => ("application/pdf", "pdf"),
        ExportFormat::Png => ("image/png", "png"),
    };
    let filename = export_filename(scope, dpi, extension);
    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        blob,
    ))
}

fn run_render_command(
    images: Vec<PathBuf>,
    format: String,
    quality: String,
    output: PathBuf,
    cmyk: bool,
) -> anyhow::Result<()> {
    use sheet::SLOTS_PER_PAGE;

    let mut settings = LayoutSettings::default();
    settings.quality = serde_json::from_value(serde_json::Value::String(quality))?;
    settings.cmyk_enabled = cmyk;

    let mut document = SheetDocument::new();
    for (i, path) in images.iter().enumerate() {
        if i > 0 && i % SLOTS_PER_PAGE == 0 {
            document.add_page();
        }
        let bytes = std::fs::read(path)?;
        match CardSlot::from_bytes(&bytes, settings.card) {
            Ok(card) => {
                document
                    .active_page_mut()
                    .set_slot(i % SLOTS_PER_PAGE, card)?;
            }
            Err(e) => log::warn!("skipping {}: {e}", path.display()),
        }
    }
    if document.pages().len() > 1 {
        settings.scope = ExportScope::All;
    }
    document.set_active(0)?;

    let config = Config::from_env();
    let blob = match format.as_str() {
        "pdf" => export_pdf(&document, &settings, config.icc_profile.as_deref())?,
        "png" => export_png(&document, &settings, config.icc_profile.as_deref())?,
        other => anyhow::bail!("unknown format {other:?} (expected pdf or png)"),
    };
    std::fs::write(&output, &blob)?;
    log::info!(
        "wrote {} ({} bytes, {} page(s))",
        output.display(),
        blob.len(),
        document.pages().len()
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Render {
            images,
            format,
            quality,
            output,
            cmyk,
        }) => {
            if let Err(e) = run_render_command(images, format, quality, output, cmyk) {
                log::error!("render failed: {e}");
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { port }) => {
            let mut config = Config::from_env();
            if let Some(port) = port {
                config.port = port;
            }
            serve(config).await;
        }
        None => {
            serve(Config::from_env()).await;
        }
    }
}

async fn serve(config: Config) {
    let state: SharedState = Arc::new(Mutex::new(AppState::new()));

    let app = Router::new()
        .route("/api/status", get(get_status))
        .route("/api/upload", post(upload_card))
        .route("/api/document", get(get_document))
        .route("/api/action", post(perform_action))
        .route("/api/preview", get(get_preview))
        .route("/api/export", get(export_file))
        .layer(DefaultBodyLimit::max(config.body_limit_bytes()))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    log::info!("backend listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind server port");
    axum::serve(listener, app).await.expect("server error");
}
