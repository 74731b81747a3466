//! Image normalization: downscale to the target screen, convert CMYK JPEGs
//! to RGB and squeeze JPEGs under a byte ceiling.
//!
//! Images are processed on the rayon pool. A result replaces the original
//! only when it is smaller.

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use rayon::prelude::*;

use crate::error::Result;
use crate::options::profiles::parse_size;
use crate::options::OptionDef;
use crate::pipeline::StageContext;
use crate::types::media::is_raster_image;
use crate::types::Book;

use super::Transform;

const DEFAULT_QUALITY: u8 = 90;
const MIN_QUALITY: u8 = 10;

pub struct NormalizeImages;

impl NormalizeImages {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NormalizeImages {
    fn default() -> Self {
        Self::new()
    }
}

struct Limits {
    width: u32,
    height: u32,
    /// JPEG size ceiling, 0 for none
    max_bytes: usize,
}

/// Number of colour components declared by a JPEG's frame header
fn jpeg_components(data: &[u8]) -> Option<u8> {
    let mut i = 2;
    while i + 4 <= data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        if marker == 0xFF {
            i += 1;
            continue;
        }
        let len = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
        let is_frame = matches!(marker, 0xC0..=0xCF) && !matches!(marker, 0xC4 | 0xC8 | 0xCC);
        if is_frame {
            return data.get(i + 9).copied();
        }
        i += 2 + len;
    }
    None
}

fn encode_jpeg(img: &DynamicImage, quality: u8) -> image::ImageResult<Vec<u8>> {
    let mut out = Vec::new();
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, quality))?;
    Ok(out)
}

/// Highest quality whose output fits in `ceiling` bytes
fn jpeg_under(img: &DynamicImage, ceiling: usize) -> image::ImageResult<Option<Vec<u8>>> {
    let first = encode_jpeg(img, DEFAULT_QUALITY)?;
    if first.len() <= ceiling {
        return Ok(Some(first));
    }
    let (mut lo, mut hi) = (MIN_QUALITY, DEFAULT_QUALITY - 1);
    let mut best = None;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let bytes = encode_jpeg(img, mid)?;
        if bytes.len() <= ceiling {
            best = Some(bytes);
            lo = mid + 1;
        } else if mid == MIN_QUALITY {
            break;
        } else {
            hi = mid - 1;
        }
    }
    Ok(best)
}

/// New bytes for one image, or `None` to keep the original
fn normalize(data: &[u8], media_type: &str, limits: &Limits) -> image::ImageResult<Option<Vec<u8>>> {
    let cmyk = media_type == "image/jpeg" && jpeg_components(data) == Some(4);
    let oversized_bytes =
        media_type == "image/jpeg" && limits.max_bytes > 0 && data.len() > limits.max_bytes;
    let img = image::load_from_memory(data)?;
    let (w, h) = img.dimensions();
    let too_big = w > limits.width || h > limits.height;
    if !cmyk && !too_big && !oversized_bytes {
        return Ok(None);
    }

    let img = if too_big {
        img.resize(limits.width, limits.height, FilterType::Lanczos3)
    } else {
        img
    };
    let ceiling = match limits.max_bytes {
        0 => data.len().saturating_sub(1),
        max => max.min(data.len().saturating_sub(1)),
    };
    let bytes = match media_type {
        "image/jpeg" => jpeg_under(&img, ceiling)?,
        other => {
            let format = ImageFormat::from_mime_type(other).unwrap_or(ImageFormat::Png);
            let mut out = Cursor::new(Vec::new());
            img.write_to(&mut out, format)?;
            Some(out.into_inner())
        }
    };
    Ok(bytes.filter(|b| b.len() < data.len()))
}

impl Transform for NormalizeImages {
    fn name(&self) -> &'static str {
        "normalize_images"
    }

    fn description(&self) -> &'static str {
        "Downscale large images and convert CMYK JPEGs to RGB"
    }

    fn options(&self) -> Vec<OptionDef> {
        vec![
            OptionDef::string("max_image_size", None, "Largest image size as WIDTHxHEIGHT"),
            OptionDef::int("max_image_bytes", 0, "Recompress JPEGs above this many bytes"),
        ]
    }

    fn run(&self, book: &mut Book, ctx: &StageContext) -> Result<()> {
        let (width, height) = ctx
            .options
            .str("max_image_size")
            .and_then(parse_size)
            .unwrap_or(ctx.output_profile.screen_size);
        let limits = Limits {
            width: width.max(1),
            height: height.max(1),
            max_bytes: ctx.options.int("max_image_bytes").unwrap_or(0).max(0) as usize,
        };

        let mut jobs = Vec::new();
        for item in book.manifest().iter() {
            // gifs may be animated
            if !is_raster_image(&item.media_type) || item.media_type == "image/gif" {
                continue;
            }
            let ext = item.href.rsplit_once('.').map_or("", |(_, e)| e);
            if !ctx.output_profile.supports_image(ext) {
                ctx.log.warn(format!(
                    "{}: {} images may not display on {}",
                    item.href, item.media_type, ctx.output_profile.name
                ));
            }
            jobs.push((item.href.clone(), item.media_type.clone()));
        }
        let mut inputs = Vec::with_capacity(jobs.len());
        for (name, media_type) in jobs {
            inputs.push((book.container.read(&name)?, name, media_type));
        }

        let results: Vec<(String, Option<Vec<u8>>)> = inputs
            .par_iter()
            .map(|(data, name, media_type)| {
                if ctx.cancel.is_cancelled() {
                    return (name.clone(), None);
                }
                match normalize(data, media_type, &limits) {
                    Ok(bytes) => (name.clone(), bytes),
                    Err(e) => {
                        ctx.log.warn(format!("{name}: {e}"));
                        (name.clone(), None)
                    }
                }
            })
            .collect();
        ctx.checkpoint()?;

        let mut changed = 0;
        for (name, bytes) in results {
            if let Some(bytes) = bytes {
                book.container.write(&name, &bytes)?;
                changed += 1;
            }
        }
        if changed > 0 {
            ctx.log.info(format!("normalized {changed} images"));
        }
        Ok(())
    }
}
