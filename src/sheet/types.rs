//! Document model: pages of card slots plus the layout settings bundle.

use anyhow::{Result, bail};
use image::RgbaImage;
use serde::{Deserialize, Serialize};

/// Fixed data-model slot capacity per page. The grid capacity derived from
/// the card size may be smaller; slots beyond it are simply not rendered.
pub const SLOTS_PER_PAGE: usize = 9;

/// Card game preset, keyed by the physical card size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardKind {
    #[default]
    Pokemon,
    Yugioh,
}

impl CardKind {
    /// Physical card size in mm (width, height).
    pub fn size_mm(self) -> (f32, f32) {
        match self {
            CardKind::Pokemon => (63.0, 88.0),
            CardKind::Yugioh => (59.0, 86.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmykMode {
    #[default]
    Simple,
    Accurate,
}

/// Export quality preset. Unrecognized values deserialize to `Standard`
/// instead of failing, so an outdated frontend can never block an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportQuality {
    #[default]
    Standard,
    High,
    Ultra,
}

impl ExportQuality {
    pub fn dpi(self) -> u32 {
        match self {
            ExportQuality::Standard => 300,
            ExportQuality::High => 450,
            ExportQuality::Ultra => 600,
        }
    }
}

impl<'de> Deserialize<'de> for ExportQuality {
    fn deserialize<D>(deserializer: D) -> Result<ExportQuality, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "high" => ExportQuality::High,
            "ultra" => ExportQuality::Ultra,
            _ => ExportQuality::Standard,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportScope {
    #[default]
    Current,
    All,
}

impl ExportScope {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportScope::Current => "current",
            ExportScope::All => "all",
        }
    }
}

/// Process-wide layout settings. These are passed by value into every render
/// and export call; the HTTP layer owns the mutable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayoutSettings {
    pub card: CardKind,
    pub spacing_mm: f32,
    pub cmyk_enabled: bool,
    pub cmyk_mode: CmykMode,
    pub quality: ExportQuality,
    pub scope: ExportScope,
}

impl Default for LayoutSettings {
    fn default() -> LayoutSettings {
        LayoutSettings {
            card: CardKind::Pokemon,
            spacing_mm: 5.0,
            cmyk_enabled: false,
            cmyk_mode: CmykMode::Simple,
            quality: ExportQuality::Standard,
            scope: ExportScope::Current,
        }
    }
}

impl LayoutSettings {
    pub fn card_size_mm(&self) -> (f32, f32) {
        self.card.size_mm()
    }

    /// Boundary check for settings received over the API. Negative spacing
    /// would make cells overlap, so it is rejected rather than clamped.
    pub fn validate(&self) -> Result<()> {
        if !self.spacing_mm.is_finite() || self.spacing_mm < 0.0 {
            bail!(
                "card spacing must be a non-negative number of mm, got {}",
                self.spacing_mm
            );
        }
        Ok(())
    }
}

/// One placed card. Owns the decoded bitmap; `original_size` keeps the
/// intrinsic dimensions so the aspect ratio never needs a re-decode.
#[derive(Clone)]
pub struct CardSlot {
    pub image: RgbaImage,
    /// 1.0 = aspect-fit exactly into the card box.
    pub scale: f32,
    /// Nudge as a fraction of the centering slack, roughly [-1, 1] each.
    pub position: [f32; 2],
    pub source_kind: CardKind,
    pub original_size: (u32, u32),
}

impl CardSlot {
    pub fn from_bytes(bytes: &[u8], source_kind: CardKind) -> Result<CardSlot> {
        let decoded = image::load_from_memory(bytes)?;
        let image = decoded.to_rgba8();
        let original_size = (image.width(), image.height());
        Ok(CardSlot {
            image,
            scale: 1.0,
            position: [0.0, 0.0],
            source_kind,
            original_size,
        })
    }

    pub fn from_image(image: RgbaImage, source_kind: CardKind) -> CardSlot {
        let original_size = (image.width(), image.height());
        CardSlot {
            image,
            scale: 1.0,
            position: [0.0, 0.0],
            source_kind,
            original_size,
        }
    }
}

#[derive(Clone)]
pub struct Page {
    slots: Vec<Option<CardSlot>>,
}

impl Page {
    pub fn new() -> Page {
        Page {
            slots: (0..SLOTS_PER_PAGE).map(|_| None).collect(),
        }
    }

    pub fn slot(&self, index: usize) -> Option<&CardSlot> {
        self.slots.get(index).and_then(|s| s.as_ref())
    }

    pub fn slots(&self) -> impl Iterator<Item = Option<&CardSlot>> {
        self.slots.iter().map(|s| s.as_ref())
    }

    pub fn set_slot(&mut self, index: usize, slot: CardSlot) -> Result<()> {
        let Some(cell) = self.slots.get_mut(index) else {
            bail!("slot index {index} out of range (page holds {SLOTS_PER_PAGE} slots)");
        };
        *cell = Some(slot);
        Ok(())
    }

    pub fn update_slot(
        &mut self,
        index: usize,
        scale: Option<f32>,
        position: Option<[f32; 2]>,
    ) -> Result<()> {
        let Some(Some(slot)) = self.slots.get_mut(index) else {
            bail!("no card in slot {index}");
        };
        if let Some(scale) = scale {
            if !scale.is_finite() || scale <= 0.0 {
                bail!("card scale must be a positive number, got {scale}");
            }
            slot.scale = scale;
        }
        if let Some(position) = position {
            slot.position = position;
        }
        Ok(())
    }

    pub fn clear_slot(&mut self, index: usize) -> Result<()> {
        let Some(cell) = self.slots.get_mut(index) else {
            bail!("slot index {index} out of range (page holds {SLOTS_PER_PAGE} slots)");
        };
        *cell = None;
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }
}

impl Default for Page {
    fn default() -> Page {
        Page::new()
    }
}

/// The whole design: an ordered sequence of pages, never fewer than one.
#[derive(Clone)]
pub struct SheetDocument {
    pages: Vec<Page>,
    active: usize,
}

impl SheetDocument {
    pub fn new() -> SheetDocument {
        SheetDocument {
            pages: vec![Page::new()],
            active: 0,
        }
    }

    pub fn pages(&self) -> &[Page] {
        &self.pages
    }

    pub fn page(&self, index: usize) -> Option<&Page> {
        self.pages.get(index)
    }

    pub fn page_mut(&mut self, index: usize) -> Option<&mut Page> {
        self.pages.get_mut(index)
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn active_page(&self) -> &Page {
        // `active` is clamped by every mutation, and `pages` is never empty.
        &self.pages[self.active]
    }

    pub fn active_page_mut(&mut self) -> &mut Page {
        &mut self.pages[self.active]
    }

    /// Appends an empty page and makes it the active one.
    pub fn add_page(&mut self) -> usize {
        self.pages.push(Page::new());
        self.active = self.pages.len() - 1;
        self.active
    }

    /// Removes a page. Deleting the last remaining page is rejected and the
    /// document is left unchanged.
    pub fn delete_page(&mut self, index: usize) -> Result<()> {
        if self.pages.len() <= 1 {
            bail!("cannot delete the last remaining page");
        }
        if index >= self.pages.len() {
            bail!("page index {index} out of range");
        }
        self.pages.remove(index);
        if self.active >= self.pages.len() {
            self.active = self.pages.len() - 1;
        }
        Ok(())
    }

    pub fn set_active(&mut self, index: usize) -> Result<()> {
        if index >= self.pages.len() {
            bail!("page index {index} out of range");
        }
        self.active = index;
        Ok(())
    }
}

impl Default for SheetDocument {
    fn default() -> SheetDocument {
        SheetDocument::new()
    }
}

// Serializable views for API responses. Pixel data stays server-side; the
// frontend keeps its own object URLs for the uploaded images.

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderableSlot {
    pub scale: f32,
    pub position: [f32; 2],
    pub source_kind: CardKind,
    pub original_size: (u32, u32),
}

#[derive(Serialize)]
pub struct RenderablePage {
    pub slots: Vec<Option<RenderableSlot>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderableDocument {
    pub pages: Vec<RenderablePage>,
    pub active_page: usize,
    pub settings: LayoutSettings,
}

impl SheetDocument {
    pub fn renderable(&self, settings: &LayoutSettings) -> RenderableDocument {
        RenderableDocument {
            pages: self
                .pages
                .iter()
                .map(|page| RenderablePage {
                    slots: page
                        .slots()
                        .map(|slot| {
                            slot.map(|s| RenderableSlot {
                                scale: s.scale,
                                position: s.position,
                                source_kind: s.source_kind,
                                original_size: s.original_size,
                            })
                        })
                        .collect(),
                })
                .collect(),
            active_page: self.active,
            settings: settings.clone(),
        }
    }
}
