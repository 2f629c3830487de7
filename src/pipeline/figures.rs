//! Figure extraction: ask the model where the figures are, then crop them.
//!
//! The model answers with a JSON object
//!
//! ```json
//! { "regions": [ { "page_number": 3, "fig_number": 1,
//!                  "bbox": [x0, y0, x1, y1], "caption": "...",
//!                  "element_type": "chart" } ] }
//! ```
//!
//! A reply that does not parse against this shape is a
//! [`BatchError::SchemaValidation`] and is retried like any transient error.
//! Individual regions are then filtered: boxes are clamped to the page, and
//! degenerate boxes or unknown pages are dropped with a warning. A box whose
//! area falls outside the configured fraction of the page is dropped
//! silently; tiny boxes are icons and rules, huge ones are the model boxing
//! the whole page.

use super::encode::{encode_pages, estimate_batch_tokens, estimate_text_tokens};
use super::plan::Batch;
use super::postprocess::extract_json_object;
use super::render::PageImage;
use super::retry::{RetryOutcome, RetryPolicy};
use crate::cancel::CancelToken;
use crate::config::{BboxSpace, ProcessorConfig};
use crate::error::BatchError;
use crate::model::{ModelRequest, VisionModel};
use crate::progress::{ProcessingCallback, Severity};
use crate::prompts::{
    build_user_preamble, IMAGE_SYSTEM_PROMPT, NORMALIZED_BBOX_NOTE, PIXEL_BBOX_NOTE,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Pixel box on a page image, `(0, 0)` at the top-left, exclusive max edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BBox {
    pub x0: u32,
    pub y0: u32,
    pub x1: u32,
    pub y1: u32,
}

impl BBox {
    pub fn width(&self) -> u32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> u32 {
        self.y1 - self.y0
    }

    pub fn area(&self) -> f64 {
        self.width() as f64 * self.height() as f64
    }
}

/// A cropped figure ready to be written as `{page_num}_fig{fig_number}.png`.
#[derive(Clone, PartialEq)]
pub struct ExtractedImage {
    pub page_num: u32,
    /// 1-based, sequential per page over the crops that succeeded, in the
    /// order the model listed them.
    pub fig_number: u32,
    pub bbox: BBox,
    pub caption: String,
    pub element_type: String,
    /// PNG bytes.
    pub bytes: Vec<u8>,
}

impl ExtractedImage {
    pub fn file_stem(&self) -> String {
        format!("{}_fig{}", self.page_num, self.fig_number)
    }
}

impl fmt::Debug for ExtractedImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractedImage")
            .field("name", &self.file_stem())
            .field("bbox", &self.bbox)
            .field("caption", &self.caption)
            .field("element_type", &self.element_type)
            .field("png_bytes", &self.bytes.len())
            .finish()
    }
}

/// What one successful figure request produced.
#[derive(Debug, Clone, Default)]
pub struct FigureOutput {
    pub images: Vec<ExtractedImage>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

// ── Response schema ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegionResponse {
    regions: Vec<RawRegion>,
}

#[derive(Debug, Deserialize)]
struct RawRegion {
    #[serde(default)]
    page_number: Option<u32>,
    bbox: [f64; 4],
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    element_type: Option<String>,
}

fn parse_regions(content: &str) -> Result<Vec<RawRegion>, BatchError> {
    serde_json::from_str::<RegionResponse>(extract_json_object(content))
        .map(|r| r.regions)
        .map_err(|e| BatchError::SchemaValidation(e.to_string()))
}

/// A region that passed validation, not yet cropped.
#[derive(Debug, Clone, PartialEq)]
struct Selected {
    page_num: u32,
    bbox: BBox,
    caption: String,
    element_type: String,
}

/// Bounds a region must satisfy to be kept.
#[derive(Debug, Clone, Copy)]
pub struct RegionFilter {
    pub min_area_fraction: f64,
    pub max_area_fraction: f64,
    pub bbox_space: BboxSpace,
}

impl RegionFilter {
    pub fn from_config(config: &ProcessorConfig) -> Self {
        Self {
            min_area_fraction: config.min_area_fraction,
            max_area_fraction: config.max_area_fraction,
            bbox_space: config.bbox_space,
        }
    }

    /// Map a raw box onto `page`, clamping to its edges. `None` when the
    /// result is empty or the input is not finite.
    fn to_pixels(&self, raw: [f64; 4], page: &PageImage) -> Option<BBox> {
        if raw.iter().any(|v| !v.is_finite()) {
            return None;
        }
        let (w, h) = (page.width as f64, page.height as f64);
        let [x0, y0, x1, y1] = match self.bbox_space {
            BboxSpace::Pixels => raw,
            BboxSpace::Normalized1000 => [
                raw[0] * w / 1000.0,
                raw[1] * h / 1000.0,
                raw[2] * w / 1000.0,
                raw[3] * h / 1000.0,
            ],
        };
        let bbox = BBox {
            x0: x0.clamp(0.0, w).floor() as u32,
            y0: y0.clamp(0.0, h).floor() as u32,
            x1: x1.clamp(0.0, w).ceil() as u32,
            y1: y1.clamp(0.0, h).ceil() as u32,
        };
        (bbox.x1 > bbox.x0 && bbox.y1 > bbox.y0).then_some(bbox)
    }

    fn select(&self, regions: Vec<RawRegion>, batch: &Batch) -> Vec<Selected> {
        let single_page = (batch.pages.len() == 1).then(|| batch.pages[0].page_num);
        let mut out = Vec::new();

        for raw in regions {
            let Some(page_num) = raw.page_number.or(single_page) else {
                warn!(batch = batch.span.batch_num, "region without page_number dropped");
                continue;
            };
            let Some(page) = batch.page(page_num) else {
                warn!(batch = batch.span.batch_num, page = page_num, "region on unknown page dropped");
                continue;
            };
            let Some(bbox) = self.to_pixels(raw.bbox, page) else {
                warn!(page = page_num, bbox = ?raw.bbox, "degenerate region dropped");
                continue;
            };
            let fraction = bbox.area() / page.area().max(1.0);
            if fraction < self.min_area_fraction || fraction > self.max_area_fraction {
                debug!(page = page_num, fraction, "region outside area bounds dropped");
                continue;
            }

            out.push(Selected {
                page_num,
                bbox,
                caption: raw.caption.unwrap_or_default().trim().to_string(),
                element_type: raw.element_type.unwrap_or_else(|| "figure".to_string()),
            });
        }
        out
    }
}

/// Decode each page once and crop its selected regions to PNG. Figures are
/// numbered here so a crop that fails leaves no gap in a page's sequence.
fn crop_regions(pages: &[PageImage], selected: Vec<Selected>) -> Vec<ExtractedImage> {
    let mut decoded: HashMap<u32, image::DynamicImage> = HashMap::new();
    let mut per_page: HashMap<u32, u32> = HashMap::new();
    let mut out = Vec::with_capacity(selected.len());

    for sel in selected {
        if !decoded.contains_key(&sel.page_num) {
            let Some(page) = pages.iter().find(|p| p.page_num == sel.page_num) else {
                continue;
            };
            match image::load_from_memory(&page.pixel_data) {
                Ok(img) => {
                    decoded.insert(sel.page_num, img);
                }
                Err(e) => {
                    warn!(page = sel.page_num, "page image could not be decoded: {e}");
                    continue;
                }
            }
        }
        let Some(img) = decoded.get(&sel.page_num) else {
            continue;
        };

        let crop = img.crop_imm(sel.bbox.x0, sel.bbox.y0, sel.bbox.width(), sel.bbox.height());
        let mut bytes = Vec::new();
        if let Err(e) = crop.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png) {
            warn!(page = sel.page_num, bbox = ?sel.bbox, "crop encoding failed: {e}");
            continue;
        }
        let n = per_page.entry(sel.page_num).or_insert(0);
        *n += 1;
        out.push(ExtractedImage {
            page_num: sel.page_num,
            fig_number: *n,
            bbox: sel.bbox,
            caption: sel.caption,
            element_type: sel.element_type,
            bytes,
        });
    }
    out
}

// ── Extractor ────────────────────────────────────────────────────────────

pub struct ImageExtractor {
    model: Arc<dyn VisionModel>,
    policy: RetryPolicy,
    filter: RegionFilter,
    system_prompt: String,
    max_tokens: usize,
    temperature: f32,
    timeout: Duration,
}

impl ImageExtractor {
    pub fn new(model: Arc<dyn VisionModel>, config: &ProcessorConfig) -> Self {
        let base = config.image_prompt.as_deref().unwrap_or(IMAGE_SYSTEM_PROMPT);
        let note = match config.bbox_space {
            BboxSpace::Pixels => PIXEL_BBOX_NOTE,
            BboxSpace::Normalized1000 => NORMALIZED_BBOX_NOTE,
        };
        Self {
            model,
            policy: RetryPolicy::from_config(config),
            filter: RegionFilter::from_config(config),
            system_prompt: format!("{base}{note}"),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Locate and crop every figure in `batch`, retrying under the policy.
    pub async fn run(
        &self,
        batch: &Batch,
        context: &str,
        callback: &dyn ProcessingCallback,
        cancel: &CancelToken,
    ) -> RetryOutcome<FigureOutput> {
        let request = ModelRequest {
            system_prompt: self.system_prompt.clone(),
            preamble: build_user_preamble(context, batch.pages.len()),
            pages: encode_pages(&batch.pages),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };
        let batch_num = batch.span.batch_num;

        self.policy
            .execute_notify(
                cancel,
                |attempt| {
                    let request = request.clone();
                    async move {
                        debug!(batch = batch_num, attempt, "figure request");
                        self.attempt(batch, request).await
                    }
                },
                |attempt, delay, error| {
                    callback.on_error(
                        &format!(
                            "batch {} figures: attempt {attempt} failed ({error}), retrying in {:.1}s",
                            batch_num + 1,
                            delay.as_secs_f64()
                        ),
                        Severity::Warning,
                    );
                },
            )
            .await
    }

    async fn attempt(&self, batch: &Batch, request: ModelRequest) -> Result<FigureOutput, BatchError> {
        let response = tokio::time::timeout(self.timeout, self.model.extract_regions(request))
            .await
            .map_err(|_| BatchError::Timeout {
                secs: self.timeout.as_secs(),
            })??;

        let regions = parse_regions(&response.content)?;
        let region_count = regions.len();
        let selected = self.filter.select(regions, batch);

        let pages = Arc::clone(&batch.pages);
        let images = tokio::task::spawn_blocking(move || crop_regions(&pages, selected))
            .await
            .map_err(|e| BatchError::Network(format!("crop task failed: {e}")))?;

        debug!(
            batch = batch.span.batch_num,
            regions = region_count,
            kept = images.len(),
            "figures extracted"
        );

        let (input_tokens, output_tokens) = match response.usage {
            Some(u) => (u.input_tokens, u.output_tokens),
            None => (
                estimate_batch_tokens(&batch.pages),
                estimate_text_tokens(&response.content),
            ),
        };
        Ok(FigureOutput {
            images,
            input_tokens,
            output_tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::plan::BatchSpan;
    use image::{DynamicImage, Rgb, RgbImage};

    fn page(page_num: u32, w: u32, h: u32) -> PageImage {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(w, h, Rgb([255, 255, 255])));
        PageImage::from_image(page_num, 130, &img).unwrap()
    }

    fn batch(pages: Vec<PageImage>) -> Batch {
        let span = BatchSpan {
            batch_num: 0,
            start_page: pages[0].page_num,
            end_page: pages[pages.len() - 1].page_num,
        };
        Batch::new(span, pages)
    }

    fn filter() -> RegionFilter {
        RegionFilter {
            min_area_fraction: 0.05,
            max_area_fraction: 0.85,
            bbox_space: BboxSpace::Pixels,
        }
    }

    #[test]
    fn missing_regions_key_is_schema_error() {
        let err = parse_regions(r#"{"figures": []}"#).unwrap_err();
        assert!(matches!(err, BatchError::SchemaValidation(_)));
        assert!(matches!(
            parse_regions("not json at all").unwrap_err(),
            BatchError::SchemaValidation(_)
        ));
    }

    #[test]
    fn fenced_json_parses() {
        let r = parse_regions("```json\n{\"regions\": [{\"page_number\": 1, \"bbox\": [0,0,10,10]}]}\n```")
            .unwrap();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn small_region_dropped_silently() {
        let b = batch(vec![page(1, 100, 100)]);
        // 2% of the page.
        let regions = parse_regions(r#"{"regions":[{"page_number":1,"bbox":[0,0,20,10]}]}"#).unwrap();
        assert!(filter().select(regions, &b).is_empty());
    }

    #[test]
    fn whole_page_region_dropped() {
        let b = batch(vec![page(1, 100, 100)]);
        let regions = parse_regions(r#"{"regions":[{"page_number":1,"bbox":[0,0,100,100]}]}"#).unwrap();
        assert!(filter().select(regions, &b).is_empty());
    }

    #[test]
    fn numbering_is_sequential_per_page() {
        let b = batch(vec![page(4, 100, 100), page(5, 100, 100)]);
        let regions = parse_regions(
            r#"{"regions":[
                {"page_number":4,"fig_number":7,"bbox":[0,0,50,50],"caption":" A "},
                {"page_number":5,"bbox":[0,0,50,50]},
                {"page_number":4,"bbox":[50,50,100,100],"element_type":"chart"}
            ]}"#,
        )
        .unwrap();
        let sel = filter().select(regions, &b);
        assert_eq!(sel[0].caption, "A");
        assert_eq!(sel[2].element_type, "chart");

        let out = crop_regions(&b.pages, sel);
        let ids: Vec<_> = out.iter().map(|i| (i.page_num, i.fig_number)).collect();
        assert_eq!(ids, vec![(4, 1), (5, 1), (4, 2)]);
    }

    #[test]
    fn out_of_page_box_is_clamped() {
        let b = batch(vec![page(1, 100, 100)]);
        let regions =
            parse_regions(r#"{"regions":[{"page_number":1,"bbox":[-10,-10,60,60]}]}"#).unwrap();
        let sel = filter().select(regions, &b);
        assert_eq!(
            sel[0].bbox,
            BBox {
                x0: 0,
                y0: 0,
                x1: 60,
                y1: 60
            }
        );
    }

    #[test]
    fn degenerate_and_unknown_page_dropped() {
        let b = batch(vec![page(1, 100, 100), page(2, 100, 100)]);
        let regions = parse_regions(
            r#"{"regions":[
                {"page_number":1,"bbox":[60,60,10,10]},
                {"page_number":1,"bbox":[200,200,300,300]},
                {"page_number":9,"bbox":[0,0,50,50]},
                {"bbox":[0,0,50,50]}
            ]}"#,
        )
        .unwrap();
        assert!(filter().select(regions, &b).is_empty());
    }

    #[test]
    fn single_page_batch_infers_page_number() {
        let b = batch(vec![page(3, 100, 100)]);
        let regions = parse_regions(r#"{"regions":[{"bbox":[0,0,50,50]}]}"#).unwrap();
        assert_eq!(filter().select(regions, &b)[0].page_num, 3);
    }

    #[test]
    fn normalized_boxes_scale_to_pixels() {
        let b = batch(vec![page(1, 200, 100)]);
        let f = RegionFilter {
            bbox_space: BboxSpace::Normalized1000,
            ..filter()
        };
        let regions =
            parse_regions(r#"{"regions":[{"page_number":1,"bbox":[0,0,500,500]}]}"#).unwrap();
        assert_eq!(
            f.select(regions, &b)[0].bbox,
            BBox {
                x0: 0,
                y0: 0,
                x1: 100,
                y1: 50
            }
        );
    }

    #[test]
    fn crops_have_box_dimensions() {
        let pages = vec![page(1, 100, 80)];
        let sel = vec![Selected {
            page_num: 1,
            bbox: BBox {
                x0: 10,
                y0: 20,
                x1: 40,
                y1: 60,
            },
            caption: String::new(),
            element_type: "figure".into(),
        }];
        let out = crop_regions(&pages, sel);
        let img = image::load_from_memory(&out[0].bytes).unwrap();
        assert_eq!((img.width(), img.height()), (30, 40));
        assert_eq!(out[0].file_stem(), "1_fig1");
    }

    #[test]
    fn failed_crop_leaves_no_numbering_gap() {
        // Pixels smaller than the recorded size: a box past the real edge
        // crops to nothing and cannot be encoded.
        let mut short = page(1, 40, 40);
        short.width = 100;
        short.height = 100;
        let b = batch(vec![short]);
        let regions = parse_regions(
            r#"{"regions":[
                {"page_number":1,"bbox":[50,50,100,100]},
                {"page_number":1,"bbox":[0,0,30,30]},
                {"page_number":1,"bbox":[0,0,40,40]}
            ]}"#,
        )
        .unwrap();
        let sel = filter().select(regions, &b);
        assert_eq!(sel.len(), 3);

        let out = crop_regions(&b.pages, sel);
        let names: Vec<_> = out.iter().map(ExtractedImage::file_stem).collect();
        assert_eq!(names, vec!["1_fig1", "1_fig2"]);
        assert_eq!(out[0].bbox.x1, 30);
    }

    #[test]
    fn undecodable_page_yields_no_figures() {
        let mut broken = page(1, 100, 100);
        broken.pixel_data = b"not a png".to_vec();
        let b = batch(vec![broken, page(2, 100, 100)]);
        let regions = parse_regions(
            r#"{"regions":[
                {"page_number":1,"bbox":[0,0,50,50]},
                {"page_number":2,"bbox":[0,0,50,50]}
            ]}"#,
        )
        .unwrap();
        let out = crop_regions(&b.pages, filter().select(regions, &b));
        let names: Vec<_> = out.iter().map(ExtractedImage::file_stem).collect();
        assert_eq!(names, vec!["2_fig1"]);
    }
}
