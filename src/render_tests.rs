
#[cfg(test)]
mod tests {
    use crate::raster_export::{
        CellRect, EmbeddedFormat, PreviewSurface, aspect_fit, embedded_format, export_filename,
        export_pdf, export_png, fitted_placement, render_page_hires, render_page_into,
    };
    use crate::sheet::geometry::{GridGeometry, PxScale};
    use crate::sheet::{CardKind, CardSlot, CmykMode, ExportScope, LayoutSettings, SheetDocument};
    use image::{Rgba, RgbaImage};
    use lopdf::{Document, Object};

    fn red_card(width: u32, height: u32) -> CardSlot {
        CardSlot::from_image(
            RgbaImage::from_pixel(width, height, Rgba([255, 0, 0, 255])),
            CardKind::Pokemon,
        )
    }

    fn parse_pdf(bytes: &[u8]) -> Document {
        Document::load_mem(bytes).expect("exported PDF should parse")
    }

    fn image_stream_filters(doc: &Document) -> Vec<String> {
        let mut filters = Vec::new();
        for object in doc.objects.values() {
            if let Object::Stream(stream) = object {
                let is_image = matches!(
                    stream.dict.get(b"Subtype"),
                    Ok(Object::Name(n)) if n == b"Image"
                );
                if is_image {
                    if let Ok(Object::Name(name)) = stream.dict.get(b"Filter") {
                        filters.push(String::from_utf8_lossy(name).into_owned());
                    }
                }
            }
        }
        filters
    }

    fn pages_media_box(doc: &Document) -> Vec<f32> {
        for object in doc.objects.values() {
            if let Object::Dictionary(dict) = object {
                let is_pages = matches!(
                    dict.get(b"Type"),
                    Ok(Object::Name(n)) if n == b"Pages"
                );
                if is_pages {
                    if let Ok(Object::Array(media_box)) = dict.get(b"MediaBox") {
                        return media_box
                            .iter()
                            .map(|o| o.as_float().unwrap_or(f32::NAN))
                            .collect();
                    }
                }
            }
        }
        panic!("no Pages dictionary with a MediaBox found");
    }

    #[test]
    fn aspect_fit_touches_the_box() {
        // One dimension must exactly match the destination, neither exceed it.
        for (sw, sh) in [(100.0, 100.0), (300.0, 100.0), (100.0, 300.0), (63.0, 88.0)] {
            let (w, h) = aspect_fit(sw, sh, 126.0, 176.0);
            assert!(w <= 126.0 + 1e-3 && h <= 176.0 + 1e-3, "{sw}x{sh} -> {w}x{h}");
            let touches = (w - 126.0).abs() < 1e-3 || (h - 176.0).abs() < 1e-3;
            assert!(touches, "{sw}x{sh} -> {w}x{h}");
            assert!((w / h - sw / sh).abs() < 1e-3, "ratio distorted");
        }
        assert_eq!(aspect_fit(0.0, 100.0, 126.0, 176.0), (0.0, 0.0));
    }

    #[test]
    fn position_stays_inside_the_cell_at_unit_scale() {
        let rect = CellRect {
            x: 0,
            y: 0,
            width: 126,
            height: 176,
        };
        let mut slot = red_card(100, 100);
        for px in [-1.0f32, -0.5, 0.0, 0.5, 1.0] {
            for py in [-1.0f32, -0.5, 0.0, 0.5, 1.0] {
                slot.position = [px, py];
                let (w, h, dx, dy) = fitted_placement(&slot, rect);
                assert!(dx >= -1e-3 && dy >= -1e-3, "pos ({px},{py}): {dx},{dy}");
                assert!(dx + w <= 126.0 + 1e-3, "pos ({px},{py}) overflows x");
                assert!(dy + h <= 176.0 + 1e-3, "pos ({px},{py}) overflows y");
            }
        }
    }

    #[test]
    fn preview_renders_cards_into_their_cells() {
        // 420 px container over 210 mm -> 2 px/mm. Pokémon grid: margins
        // 5.5/11.5 mm, cells 126x176 px starting at (11, 23).
        let mut doc = SheetDocument::new();
        doc.active_page_mut().set_slot(0, red_card(63, 88)).unwrap();
        let settings = LayoutSettings::default();

        let mut preview = PreviewSurface::new();
        let canvas = preview
            .render(doc.active_page(), &settings, 420.0)
            .expect("valid width");
        assert_eq!((canvas.width(), canvas.height()), (420, 594));

        // Card 0 center is red, the page margin stays white, and the empty
        // neighbor cell shows the placeholder fill.
        assert_eq!(canvas.get_pixel(74, 111).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(2, 2).0, [255, 255, 255, 255]);
        assert_eq!(canvas.get_pixel(210, 111).0, [229, 229, 229, 255]);
    }

    #[test]
    fn preview_surface_reuses_its_canvas() {
        let doc = SheetDocument::new();
        let settings = LayoutSettings::default();
        let mut preview = PreviewSurface::new();

        let first = preview.render(doc.active_page(), &settings, 420.0).unwrap();
        let first_ptr = first.as_raw().as_ptr();
        let second = preview.render(doc.active_page(), &settings, 420.0).unwrap();
        assert_eq!(second.as_raw().as_ptr(), first_ptr, "same size must not reallocate");

        let resized = preview.render(doc.active_page(), &settings, 630.0).unwrap();
        assert_eq!((resized.width(), resized.height()), (630, 891));

        assert!(preview.render(doc.active_page(), &settings, 0.0).is_none());
        assert!(preview.render(doc.active_page(), &settings, f32::NAN).is_none());
    }

    #[test]
    fn overscaled_card_is_clipped_to_its_cell() {
        let mut doc = SheetDocument::new();
        let mut card = red_card(63, 88);
        card.scale = 3.0;
        doc.active_page_mut().set_slot(0, card).unwrap();
        let settings = LayoutSettings::default();

        let mut preview = PreviewSurface::new();
        let canvas = preview
            .render(doc.active_page(), &settings, 420.0)
            .unwrap();
        // Inside cell 0: red. One pixel into the spacing strip right of the
        // cell (x = 11 + 126 + 2): untouched white.
        assert_eq!(canvas.get_pixel(74, 111).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(139, 111).0, [255, 255, 255, 255]);
    }

    #[test]
    fn shrunken_card_leaves_placeholder_visible() {
        let mut doc = SheetDocument::new();
        let mut card = red_card(63, 88);
        card.scale = 0.5;
        doc.active_page_mut().set_slot(0, card).unwrap();
        let settings = LayoutSettings::default();

        let mut preview = PreviewSurface::new();
        let canvas = preview
            .render(doc.active_page(), &settings, 420.0)
            .unwrap();
        // Center still red, cell corner shows the placeholder background.
        assert_eq!(canvas.get_pixel(74, 111).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(13, 25).0, [229, 229, 229, 255]);
    }

    #[test]
    fn undrawable_card_gets_an_error_marker() {
        let mut doc = SheetDocument::new();
        let broken = CardSlot::from_image(RgbaImage::new(0, 0), CardKind::Pokemon);
        doc.active_page_mut().set_slot(0, broken).unwrap();
        doc.active_page_mut().set_slot(1, red_card(63, 88)).unwrap();
        let settings = LayoutSettings::default();

        let mut preview = PreviewSurface::new();
        let canvas = preview
            .render(doc.active_page(), &settings, 420.0)
            .unwrap();
        // Off-diagonal point inside cell 0 shows the error fill; the sibling
        // card still rendered.
        assert_eq!(canvas.get_pixel(74, 33).0, [254, 226, 226, 255]);
        assert_eq!(canvas.get_pixel(210, 111).0, [255, 0, 0, 255]);
        // The cross stroke stays inside the cell: one pixel above and one
        // pixel below the cell corner column remain untouched white.
        assert_eq!(canvas.get_pixel(136, 22).0, [255, 255, 255, 255]);
        assert_eq!(canvas.get_pixel(136, 199).0, [255, 255, 255, 255]);
    }

    #[test]
    fn extreme_scale_resizes_only_the_visible_crop() {
        // At scale 10000 the naive full resize would be a ~1.3M x 1.8M px
        // buffer. Only the clipped window may be materialized, and the cell
        // must still render correctly.
        let mut doc = SheetDocument::new();
        let mut card = red_card(63, 88);
        card.scale = 10_000.0;
        doc.active_page_mut().set_slot(0, card).unwrap();
        let settings = LayoutSettings::default();

        let mut preview = PreviewSurface::new();
        let canvas = preview
            .render(doc.active_page(), &settings, 420.0)
            .unwrap();
        assert_eq!(canvas.get_pixel(74, 111).0, [255, 0, 0, 255]);
        assert_eq!(canvas.get_pixel(139, 111).0, [255, 255, 255, 255]);
    }

    #[test]
    fn zero_capacity_grid_renders_a_blank_page() {
        // A 250 mm card cannot fit on a 210 mm page: zero columns, blank
        // render, no panic.
        let geometry = GridGeometry::compute(250.0, 88.0, 5.0);
        assert_eq!(geometry.capacity(), 0);
        let mut doc = SheetDocument::new();
        doc.active_page_mut().set_slot(0, red_card(63, 88)).unwrap();

        let mut canvas = RgbaImage::new(420, 594);
        render_page_into(
            &mut canvas,
            doc.active_page(),
            &geometry,
            PxScale::from_container_width(420.0),
            image::imageops::FilterType::Triangle,
            true,
        );
        assert!(canvas.pixels().all(|p| p.0 == [255, 255, 255, 255]));
    }

    #[test]
    fn hires_render_matches_dpi_dimensions() {
        let doc = SheetDocument::new();
        let settings = LayoutSettings::default();
        let raster = render_page_hires(doc.active_page(), &settings, 300, None).unwrap();
        assert_eq!((raster.width(), raster.height()), (2480, 3508));
        let raster = render_page_hires(doc.active_page(), &settings, 150, None).unwrap();
        assert_eq!((raster.width(), raster.height()), (1240, 1754));
        assert!(render_page_hires(doc.active_page(), &settings, 0, None).is_err());
    }

    #[test]
    fn hires_export_leaves_empty_cells_white() {
        // The gray placeholder marking empty slots is a screen affordance
        // and must never reach the print raster.
        let doc = SheetDocument::new();
        let settings = LayoutSettings::default();
        let raster = render_page_hires(doc.active_page(), &settings, 150, None).unwrap();
        let non_white = raster.pixels().filter(|p| p.0 != [255, 255, 255, 255]).count();
        assert_eq!(non_white, 0);
    }

    #[test]
    fn hires_export_has_no_placeholder_behind_cards() {
        let mut doc = SheetDocument::new();
        let mut card = red_card(63, 88);
        card.scale = 0.5;
        doc.active_page_mut().set_slot(0, card).unwrap();
        let settings = LayoutSettings::default();

        // 150 dpi -> 5.9055 px/mm. Cell 0 spans (32, 68)..(404, 588); the
        // half-scale card sits centered at (125, 198)..(311, 458).
        let raster = render_page_hires(doc.active_page(), &settings, 150, None).unwrap();
        assert_eq!(raster.get_pixel(218, 328).0, [255, 0, 0, 255]);
        assert_eq!(raster.get_pixel(34, 70).0, [255, 255, 255, 255]);
    }

    #[test]
    fn empty_page_exports_as_blank_pdf() {
        let doc = SheetDocument::new();
        let settings = LayoutSettings::default();
        let bytes = export_pdf(&doc, &settings, None).unwrap();
        let pdf = parse_pdf(&bytes);
        assert_eq!(pdf.get_pages().len(), 1);

        let media_box = pages_media_box(&pdf);
        assert!((media_box[2] - 210.0 * 72.0 / 25.4).abs() < 0.1);
        assert!((media_box[3] - 297.0 * 72.0 / 25.4).abs() < 0.1);
    }

    #[test]
    fn scope_all_exports_every_page() {
        let mut doc = SheetDocument::new();
        doc.add_page();
        doc.add_page();
        doc.active_page_mut().set_slot(4, red_card(30, 40)).unwrap();
        let mut settings = LayoutSettings::default();
        settings.scope = ExportScope::All;

        let bytes = export_pdf(&doc, &settings, None).unwrap();
        let pdf = parse_pdf(&bytes);
        assert_eq!(pdf.get_pages().len(), 3);
        assert_eq!(image_stream_filters(&pdf).len(), 3);
    }

    #[test]
    fn scope_current_exports_one_page() {
        let mut doc = SheetDocument::new();
        doc.add_page();
        doc.add_page();
        let settings = LayoutSettings::default(); // scope: current
        let bytes = export_pdf(&doc, &settings, None).unwrap();
        assert_eq!(parse_pdf(&bytes).get_pages().len(), 1);
    }

    #[test]
    fn simple_cmyk_embeds_jpeg() {
        let mut settings = LayoutSettings::default();
        settings.cmyk_enabled = true;
        settings.cmyk_mode = CmykMode::Simple;
        assert_eq!(embedded_format(&settings), EmbeddedFormat::Jpeg);

        let doc = SheetDocument::new();
        let bytes = export_pdf(&doc, &settings, None).unwrap();
        assert_eq!(image_stream_filters(&parse_pdf(&bytes)), vec!["DCTDecode"]);
    }

    #[test]
    fn lossless_paths_embed_flate_rgb() {
        let doc = SheetDocument::new();

        let mut settings = LayoutSettings::default();
        settings.cmyk_enabled = false;
        assert_eq!(embedded_format(&settings), EmbeddedFormat::RawRgb);
        let bytes = export_pdf(&doc, &settings, None).unwrap();
        assert_eq!(image_stream_filters(&parse_pdf(&bytes)), vec!["FlateDecode"]);

        settings.cmyk_enabled = true;
        settings.cmyk_mode = CmykMode::Accurate;
        assert_eq!(embedded_format(&settings), EmbeddedFormat::RawRgb);
        let bytes = export_pdf(&doc, &settings, None).unwrap();
        assert_eq!(image_stream_filters(&parse_pdf(&bytes)), vec!["FlateDecode"]);
    }

    #[test]
    fn png_export_has_dpi_derived_dimensions() {
        let doc = SheetDocument::new();
        let settings = LayoutSettings::default();
        let bytes = export_png(&doc, &settings, None).unwrap();
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (2480, 3508));
    }

    #[test]
    fn multi_page_png_is_rejected_not_silently_truncated() {
        let mut doc = SheetDocument::new();
        doc.add_page();
        let mut settings = LayoutSettings::default();
        settings.scope = ExportScope::All;
        let err = export_png(&doc, &settings, None).unwrap_err();
        assert!(err.to_string().contains("not implemented"), "{err}");
    }

    #[test]
    fn export_filenames_embed_scope_and_dpi() {
        assert_eq!(
            export_filename(ExportScope::Current, 300, "pdf"),
            "proxysheet-current-300dpi.pdf"
        );
        assert_eq!(
            export_filename(ExportScope::All, 600, "png"),
            "proxysheet-all-600dpi.png"
        );
    }
}
