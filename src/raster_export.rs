//! Raster page rendering and PDF/PNG export.
//!
//! The preview and the export share one drawing path: compute the grid in mm,
//! convert to pixels at the target scale, and composite each card with
//! aspect-fit, user scale, slack-fraction positioning and a hard clip to its
//! cell. Exports always redraw from the source bitmaps at the requested DPI;
//! the preview raster is never upscaled.

use std::io::Write;

use anyhow::{Context, Result, anyhow, bail};
use flate2::Compression;
use flate2::write::ZlibEncoder;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, Rgba, RgbaImage};
use log::warn;
use lopdf::{
    Document, Object, Stream,
    content::{Content, Operation},
    dictionary,
    xref::XrefType,
};
use rayon::prelude::*;

use crate::cmyk;
use crate::sheet::geometry::{GridGeometry, PAGE_HEIGHT_MM, PAGE_WIDTH_MM, PxScale};
use crate::sheet::{
    CardSlot, CmykMode, ExportScope, LayoutSettings, Page, SLOTS_PER_PAGE, SheetDocument,
};

/// Empty-slot background in the preview.
const PLACEHOLDER_COLOR: Rgba<u8> = Rgba([229, 229, 229, 255]);
/// Fill used when a card image cannot be drawn.
const ERROR_FILL_COLOR: Rgba<u8> = Rgba([254, 226, 226, 255]);
const ERROR_CROSS_COLOR: Rgba<u8> = Rgba([120, 20, 20, 255]);
const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

/// One card cell in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Aspect-fit: scale the source so its longer-fitting dimension exactly
/// touches the destination box, preserving the ratio. At least one returned
/// dimension equals the destination's, neither exceeds it.
pub fn aspect_fit(src_w: f32, src_h: f32, dest_w: f32, dest_h: f32) -> (f32, f32) {
    if src_w <= 0.0 || src_h <= 0.0 || dest_w <= 0.0 || dest_h <= 0.0 {
        return (0.0, 0.0);
    }
    let src_aspect = src_w / src_h;
    let dest_aspect = dest_w / dest_h;
    if src_aspect > dest_aspect {
        (dest_w, dest_w / src_aspect)
    } else {
        (dest_h * src_aspect, dest_h)
    }
}

/// Placement of a slot's image within its cell: scaled size plus the
/// top-left offset relative to the cell origin. Centering slack is signed,
/// so positions only move the image within the clip when `scale >= 1`.
pub fn fitted_placement(slot: &CardSlot, rect: CellRect) -> (f32, f32, f32, f32) {
    let (src_w, src_h) = if slot.original_size.0 > 0 && slot.original_size.1 > 0 {
        (slot.original_size.0 as f32, slot.original_size.1 as f32)
    } else {
        (slot.image.width() as f32, slot.image.height() as f32)
    };
    let (fit_w, fit_h) = aspect_fit(src_w, src_h, rect.width as f32, rect.height as f32);
    let scaled_w = fit_w * slot.scale;
    let scaled_h = fit_h * slot.scale;
    let slack_x = (rect.width as f32 - scaled_w) / 2.0;
    let slack_y = (rect.height as f32 - scaled_h) / 2.0;
    let dx = slack_x + slot.position[0] * slack_x;
    let dy = slack_y + slot.position[1] * slack_y;
    (scaled_w, scaled_h, dx, dy)
}

/// What a single card contributes to the page, prepared off the canvas so
/// the per-card work can run in parallel and be joined before compositing.
enum PreparedCard {
    Empty,
    Image {
        resized: RgbaImage,
        // Offset of the visible crop relative to the cell origin.
        dx: i64,
        dy: i64,
    },
    Error,
}

fn prepare_card(slot: Option<&CardSlot>, rect: CellRect, filter: FilterType) -> PreparedCard {
    let Some(slot) = slot else {
        return PreparedCard::Empty;
    };
    if slot.image.width() == 0 || slot.image.height() == 0 {
        return PreparedCard::Error;
    }
    let (scaled_w, scaled_h, dx, dy) = fitted_placement(slot, rect);
    if scaled_w < 0.5 || scaled_h < 0.5 {
        // Scaled away to nothing; the placeholder fill is all that remains.
        return PreparedCard::Empty;
    }

    // Only the part of the scaled image that survives the clip gets resized,
    // so the working buffer never exceeds the cell even at extreme scales.
    let vis_x1 = dx.max(0.0);
    let vis_y1 = dy.max(0.0);
    let vis_x2 = (dx + scaled_w).min(rect.width as f32);
    let vis_y2 = (dy + scaled_h).min(rect.height as f32);
    let out_w = (vis_x2 - vis_x1).round() as i64;
    let out_h = (vis_y2 - vis_y1).round() as i64;
    if out_w < 1 || out_h < 1 {
        return PreparedCard::Empty;
    }

    let sx = slot.image.width() as f32 / scaled_w;
    let sy = slot.image.height() as f32 / scaled_h;
    let crop_x = (((vis_x1 - dx) * sx).floor() as u32).min(slot.image.width() - 1);
    let crop_y = (((vis_y1 - dy) * sy).floor() as u32).min(slot.image.height() - 1);
    let crop_w = (((vis_x2 - vis_x1) * sx).ceil() as u32).clamp(1, slot.image.width() - crop_x);
    let crop_h = (((vis_y2 - vis_y1) * sy).ceil() as u32).clamp(1, slot.image.height() - crop_y);
    let visible = image::imageops::crop_imm(&slot.image, crop_x, crop_y, crop_w, crop_h).to_image();

    let resized = image::imageops::resize(&visible, out_w as u32, out_h as u32, filter);
    PreparedCard::Image {
        resized,
        dx: vis_x1.round() as i64,
        dy: vis_y1.round() as i64,
    }
}

fn fill_rect(canvas: &mut RgbaImage, rect: CellRect, color: Rgba<u8>) {
    let x1 = rect.x.min(canvas.width());
    let y1 = rect.y.min(canvas.height());
    let x2 = (rect.x + rect.width).min(canvas.width());
    let y2 = (rect.y + rect.height).min(canvas.height());
    for y in y1..y2 {
        for x in x1..x2 {
            canvas.put_pixel(x, y, color);
        }
    }
}

/// Alpha-over blit of `src` at (dst_x, dst_y), clipped to `clip` and to the
/// canvas bounds. The clip is what keeps an overscaled card inside its cell.
fn blit_clipped(canvas: &mut RgbaImage, src: &RgbaImage, dst_x: i64, dst_y: i64, clip: CellRect) {
    let clip_x1 = clip.x as i64;
    let clip_y1 = clip.y as i64;
    let clip_x2 = ((clip.x + clip.width).min(canvas.width())) as i64;
    let clip_y2 = ((clip.y + clip.height).min(canvas.height())) as i64;

    let x1 = dst_x.max(clip_x1);
    let y1 = dst_y.max(clip_y1);
    let x2 = (dst_x + src.width() as i64).min(clip_x2);
    let y2 = (dst_y + src.height() as i64).min(clip_y2);
    if x1 >= x2 || y1 >= y2 {
        return;
    }

    for y in y1..y2 {
        for x in x1..x2 {
            let sp = src.get_pixel((x - dst_x) as u32, (y - dst_y) as u32);
            let a = sp.0[3] as u32;
            if a == 255 {
                canvas.put_pixel(x as u32, y as u32, *sp);
            } else if a > 0 {
                let dp = canvas.get_pixel(x as u32, y as u32).0;
                let blend = |s: u8, d: u8| ((s as u32 * a + d as u32 * (255 - a)) / 255) as u8;
                canvas.put_pixel(
                    x as u32,
                    y as u32,
                    Rgba([
                        blend(sp.0[0], dp[0]),
                        blend(sp.0[1], dp[1]),
                        blend(sp.0[2], dp[2]),
                        255,
                    ]),
                );
            }
        }
    }
}

/// Error placeholder: distinct fill plus a diagonal cross so a failed card
/// is visible in the output instead of silently blank.
fn draw_error_marker(canvas: &mut RgbaImage, rect: CellRect) {
    fill_rect(canvas, rect, ERROR_FILL_COLOR);
    if rect.width < 2 || rect.height < 2 {
        return;
    }
    let y_min = rect.y;
    let y_max = rect.y + rect.height - 1;
    let steps = rect.width.max(rect.height);
    let thickness = (steps / 60).max(1);
    for i in 0..=steps {
        let fx = i as f32 / steps as f32;
        let x = rect.x + ((rect.width - 1) as f32 * fx) as u32;
        let y_down = rect.y + ((rect.height - 1) as f32 * fx) as u32;
        let y_up = rect.y + rect.height - 1 - ((rect.height - 1) as f32 * fx) as u32;
        for t in 0..thickness {
            // The stroke widens towards the cell edges but must not cross
            // them into the spacing strip.
            for (px, py) in [
                (x, y_down.saturating_add(t).min(y_max)),
                (x, y_up.saturating_sub(t).max(y_min)),
            ] {
                if px < canvas.width() && py < canvas.height() {
                    canvas.put_pixel(px, py, ERROR_CROSS_COLOR);
                }
            }
        }
    }
}

/// Pixel rects for every renderable cell of the page, paired with the slot
/// occupying it. Limited by both the grid capacity and the data-model slot
/// capacity.
fn layout_cells<'a>(
    page: &'a Page,
    geometry: &GridGeometry,
    scale: PxScale,
) -> Vec<(CellRect, Option<&'a CardSlot>)> {
    let count = geometry.capacity().min(SLOTS_PER_PAGE);
    let mut cells = Vec::with_capacity(count);
    for index in 0..count {
        let Some((x_mm, y_mm)) = geometry.cell_origin_mm(index) else {
            continue;
        };
        let rect = CellRect {
            x: scale.to_px(x_mm),
            y: scale.to_px(y_mm),
            width: scale.to_px(geometry.card_width_mm),
            height: scale.to_px(geometry.card_height_mm),
        };
        if rect.width == 0 || rect.height == 0 {
            continue;
        }
        cells.push((rect, page.slot(index)));
    }
    cells
}

/// Draws one page onto an existing canvas. Clears to white first, then
/// composites every cell. Per-card preparation (decode-dependent resize) is
/// fanned out and joined; one bad card never aborts its siblings. A
/// zero-capacity grid leaves a blank white page.
///
/// The neutral placeholder fill marking empty cells is a screen affordance:
/// the preview passes `show_placeholders`, the print-ready export leaves
/// uncovered paper white. The error marker is drawn on both paths.
pub fn render_page_into(
    canvas: &mut RgbaImage,
    page: &Page,
    geometry: &GridGeometry,
    scale: PxScale,
    filter: FilterType,
    show_placeholders: bool,
) {
    for px in canvas.pixels_mut() {
        *px = WHITE;
    }
    if !scale.is_valid() {
        return;
    }
    let cells = layout_cells(page, geometry, scale);

    let prepared: Vec<(CellRect, PreparedCard)> = cells
        .par_iter()
        .map(|&(rect, slot)| (rect, prepare_card(slot, rect, filter)))
        .collect();

    for (rect, card) in prepared {
        match card {
            PreparedCard::Empty => {
                if show_placeholders {
                    fill_rect(canvas, rect, PLACEHOLDER_COLOR);
                }
            }
            PreparedCard::Image { resized, dx, dy } => {
                if show_placeholders {
                    fill_rect(canvas, rect, PLACEHOLDER_COLOR);
                }
                blit_clipped(canvas, &resized, rect.x as i64 + dx, rect.y as i64 + dy, rect);
            }
            PreparedCard::Error => {
                warn!("card raster failed; drawing error placeholder");
                draw_error_marker(canvas, rect);
            }
        }
    }
}

/// Screen-resolution preview of the active page. Owns its canvas and only
/// reallocates when the container-derived size actually changes, so repeated
/// renders during a resize drag stay cheap.
pub struct PreviewSurface {
    canvas: Option<RgbaImage>,
}

impl PreviewSurface {
    pub fn new() -> PreviewSurface {
        PreviewSurface { canvas: None }
    }

    /// Renders `page` at the scale implied by `container_width` pixels.
    /// Returns `None` when the width is not yet known or not positive.
    pub fn render(
        &mut self,
        page: &Page,
        settings: &LayoutSettings,
        container_width: f32,
    ) -> Option<&RgbaImage> {
        let scale = PxScale::from_container_width(container_width);
        if !scale.is_valid() {
            return None;
        }
        let (width, height) = scale.page_size_px();
        if width == 0 || height == 0 {
            return None;
        }
        let needs_alloc = self
            .canvas
            .as_ref()
            .map(|c| c.width() != width || c.height() != height)
            .unwrap_or(true);
        if needs_alloc {
            self.canvas = Some(RgbaImage::new(width, height));
        }
        let (card_w, card_h) = settings.card_size_mm();
        let geometry = GridGeometry::compute(card_w, card_h, settings.spacing_mm);
        let canvas = self.canvas.as_mut().expect("canvas allocated above");
        render_page_into(canvas, page, &geometry, scale, FilterType::Triangle, true);
        Some(canvas)
    }
}

impl Default for PreviewSurface {
    fn default() -> PreviewSurface {
        PreviewSurface::new()
    }
}

/// Rebuilds one page from the source bitmaps at the export DPI and applies
/// the simple CMYK pass in place when enabled. Accurate mode defers color
/// handling (currently a logged fallback to RGB, see `cmyk`).
pub fn render_page_hires(
    page: &Page,
    settings: &LayoutSettings,
    dpi: u32,
    icc_profile: Option<&std::path::Path>,
) -> Result<RgbaImage> {
    let scale = PxScale::from_dpi(dpi);
    let (width, height) = scale.page_size_px();
    if width == 0 || height == 0 {
        bail!("invalid raster size {width}x{height} at {dpi} DPI");
    }
    let (card_w, card_h) = settings.card_size_mm();
    let geometry = GridGeometry::compute(card_w, card_h, settings.spacing_mm);
    let mut canvas = RgbaImage::new(width, height);
    render_page_into(&mut canvas, page, &geometry, scale, FilterType::Lanczos3, false);

    if settings.cmyk_enabled {
        match settings.cmyk_mode {
            CmykMode::Simple => cmyk::simulate_print_colors(&mut canvas),
            CmykMode::Accurate => cmyk::apply_accurate_profile(&mut canvas, icc_profile),
        }
    }
    Ok(canvas)
}

/// Raster encoding embedded in the exported PDF.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbeddedFormat {
    /// Lossy DCTDecode at maximum quality; acceptable because the simple
    /// CMYK pass already produced an approximation.
    Jpeg,
    /// Lossless FlateDecode over raw RGB rows.
    RawRgb,
}

pub fn embedded_format(settings: &LayoutSettings) -> EmbeddedFormat {
    if settings.cmyk_enabled && settings.cmyk_mode == CmykMode::Simple {
        EmbeddedFormat::Jpeg
    } else {
        EmbeddedFormat::RawRgb
    }
}

pub fn export_filename(scope: ExportScope, dpi: u32, extension: &str) -> String {
    format!("proxysheet-{}-{}dpi.{}", scope.as_str(), dpi, extension)
}

pub fn encode_png(image: &RgbaImage) -> Result<Vec<u8>> {
    let mut buffer = std::io::Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image.clone())
        .write_to(&mut buffer, image::ImageFormat::Png)
        .context("PNG encode failed")?;
    Ok(buffer.into_inner())
}

/// Single-page PNG export of the active page. Multi-page PNG is explicitly
/// unsupported: a scope of `all` is an error the caller surfaces as a
/// notice, never a silent single-page export.
pub fn export_png(
    document: &SheetDocument,
    settings: &LayoutSettings,
    icc_profile: Option<&std::path::Path>,
) -> Result<Vec<u8>> {
    if settings.scope == ExportScope::All {
        bail!("multi-page PNG export is not implemented; switch the scope to the current page");
    }
    let dpi = settings.quality.dpi();
    let raster = render_page_hires(document.active_page(), settings, dpi, icc_profile)?;
    encode_png(&raster)
}

fn embed_page_raster(
    doc: &mut Document,
    raster: &RgbaImage,
    format: EmbeddedFormat,
) -> Result<lopdf::ObjectId> {
    let width = raster.width();
    let height = raster.height();
    let rgb = DynamicImage::ImageRgba8(raster.clone()).to_rgb8();

    let (data, filter) = match format {
        EmbeddedFormat::Jpeg => {
            let mut buffer = Vec::new();
            let encoder = JpegEncoder::new_with_quality(&mut buffer, 100);
            rgb.write_with_encoder(encoder)
                .context("JPEG encode failed")?;
            (buffer, "DCTDecode")
        }
        EmbeddedFormat::RawRgb => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(rgb.as_raw())?;
            (encoder.finish()?, "FlateDecode")
        }
    };

    let image_dict = dictionary! {
        "Type" => "XObject",
        "Subtype" => "Image",
        "Width" => width as i64,
        "Height" => height as i64,
        "ColorSpace" => "DeviceRGB",
        "BitsPerComponent" => 8,
        "Filter" => filter,
    };
    let mut stream = Stream::new(image_dict, data);
    // Both payloads are already compressed; a second Flate pass would only
    // corrupt the filter chain.
    stream.allows_compression = false;
    Ok(doc.add_object(stream))
}

fn pdf_date_now() -> String {
    let date = time::OffsetDateTime::now_utc();
    format!(
        "D:{:04}{:02}{:02}{:02}{:02}{:02}Z",
        date.year(),
        u8::from(date.month()),
        date.day(),
        date.hour(),
        date.minute(),
        date.second(),
    )
}

/// Multi-page PDF export. One high-resolution render per page in scope, each
/// placed full-bleed on a 210x297 mm page.
pub fn export_pdf(
    document: &SheetDocument,
    settings: &LayoutSettings,
    icc_profile: Option<&std::path::Path>,
) -> Result<Vec<u8>> {
    let dpi = settings.quality.dpi();
    let format = embedded_format(settings);

    let page_indices: Vec<usize> = match settings.scope {
        ExportScope::Current => vec![document.active_index()],
        ExportScope::All => (0..document.pages().len()).collect(),
    };

    let mut doc = Document::with_version("1.4");
    doc.reference_table.cross_reference_type = XrefType::CrossReferenceTable;

    let id_pages = doc.new_object_id();

    let mm_to_pt = |mm: f32| mm * 72.0 / 25.4;
    let page_w_pt = mm_to_pt(PAGE_WIDTH_MM);
    let page_h_pt = mm_to_pt(PAGE_HEIGHT_MM);

    let mut kids = vec![];
    for &index in &page_indices {
        let page = document
            .page(index)
            .ok_or_else(|| anyhow!("page index {index} out of range"))?;
        let raster = render_page_hires(page, settings, dpi, icc_profile)?;
        let id_image = embed_page_raster(&mut doc, &raster, format)?;

        // Full-bleed placement: scale the unit-square image to the page.
        let ops = vec![
            Operation::new("q", vec![]),
            Operation::new(
                "cm",
                vec![
                    page_w_pt.into(),
                    0.into(),
                    0.into(),
                    page_h_pt.into(),
                    0.into(),
                    0.into(),
                ],
            ),
            Operation::new("Do", vec![Object::Name(b"Im0".to_vec())]),
            Operation::new("Q", vec![]),
        ];
        let content = Content { operations: ops };
        let encoded = content
            .encode()
            .map_err(|e| anyhow!("content stream encode failed: {e}"))?;
        let id_content = doc.add_object(Stream::new(dictionary! {}, encoded));

        let id_resources = doc.add_object(dictionary! {
            "XObject" => dictionary! {
                "Im0" => id_image,
            },
        });

        let id_page = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => id_pages,
            "Contents" => id_content,
            "Resources" => id_resources,
        });
        kids.push(id_page.into());
    }

    let pdf_pages = dictionary! {
        "Type" => "Pages",
        "Count" => kids.len() as i32,
        "Kids" => kids,
        "MediaBox" => vec![
            0.into(), 0.into(),
            page_w_pt.into(), page_h_pt.into(),
        ],
    };
    doc.set_object(id_pages, pdf_pages);

    let id_catalog = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => id_pages,
    });
    doc.trailer.set("Root", id_catalog);

    let s_date = pdf_date_now();
    let id_info = doc.add_object(dictionary! {
        "Title" => Object::string_literal("Proxy Card Sheet"),
        "Subject" => Object::string_literal(format!(
            "{} page(s) at {} dpi", page_indices.len(), dpi
        )),
        "Creator" => Object::string_literal("proxysheet-backend"),
        "CreationDate" => Object::string_literal(s_date.clone()),
        "ModDate" => Object::string_literal(s_date),
    });
    doc.trailer.set("Info", id_info);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)?;
    Ok(buffer)
}
