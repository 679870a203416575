use crate::params::{Colour, Format, Params};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ExtendedColorType, ImageFormat, ImageReader};
use std::io::Cursor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("read source image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("encode result image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("source format has no supported encoder")]
    UnsupportedSource,
}

/// Options handed to the transform engine for one job. Derived from the
/// normalized params and the decoded source dimensions; an engine is
/// expected to honor every field it is capable of.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransformOptions {
    /// Target width, 0 = keep. Never exceeds the source width.
    pub width: u32,
    /// Target height, 0 = keep. Never exceeds the source height.
    pub height: u32,
    pub crop: bool,
    pub embed: bool,
    pub auto_rotate: bool,
    pub strip_profile: bool,
    pub interlace: bool,
    pub colour: Colour,
    /// Gaussian blur sigma, 0.0 = no blur.
    pub blur_sigma: f32,
    /// Encode quality, 0 = engine default.
    pub quality: u8,
    /// Output format, `None` = keep the source format.
    pub format: Option<Format>,
    pub flip: bool,
    pub flop: bool,
}

/// Derive engine options from validated params and the source size.
/// A requested dimension is applied only when it is strictly smaller
/// than the source dimension, so output is never upscaled.
pub fn derive_options(params: &Params, source_width: u32, source_height: u32) -> TransformOptions {
    let mut options = TransformOptions {
        width: 0,
        height: 0,
        crop: true,
        embed: false,
        auto_rotate: false,
        strip_profile: true,
        interlace: true,
        colour: params.colour,
        blur_sigma: 0.0,
        quality: params.quality,
        format: params.format,
        flip: params.flip,
        flop: params.flop,
    };

    if params.width > 0 && params.width < source_width {
        options.width = params.width;
    }
    if params.height > 0 && params.height < source_height {
        options.height = params.height;
    }
    if params.blur > 0 {
        options.blur_sigma = params.blur as f32;
    }

    options
}

/// The image-processing boundary. Implementations take master bytes and
/// normalized params and return encoded output bytes; all failures
/// surface verbatim.
pub trait Transformer: Send + Sync {
    fn transform(&self, master: &[u8], params: &Params) -> Result<Vec<u8>, TransformError>;
}

/// Default engine on top of the `image` crate: fill-crop resize,
/// mirror, grayscale, gaussian blur, and JPEG/PNG/WebP encoding.
pub struct ImageEngine;

impl Transformer for ImageEngine {
    fn transform(&self, master: &[u8], params: &Params) -> Result<Vec<u8>, TransformError> {
        let reader = ImageReader::new(Cursor::new(master))
            .with_guessed_format()
            .map_err(|err| TransformError::Decode(image::ImageError::IoError(err)))?;
        let source_format = reader.format();
        let image = reader.decode().map_err(TransformError::Decode)?;

        let options = derive_options(params, image.width(), image.height());
        let output_format = match options.format {
            Some(format) => format,
            None => output_format_for_source(source_format)?,
        };

        let image = apply_geometry(image, &options);
        let image = apply_filters(image, &options);
        encode_image(&image, output_format, options.quality)
    }
}

fn apply_geometry(image: DynamicImage, options: &TransformOptions) -> DynamicImage {
    let mut image = match (options.width, options.height) {
        (0, 0) => image,
        (width, 0) => image.resize(width, u32::MAX, FilterType::Lanczos3),
        (0, height) => image.resize(u32::MAX, height, FilterType::Lanczos3),
        (width, height) if options.crop => {
            image.resize_to_fill(width, height, FilterType::Lanczos3)
        }
        (width, height) => image.resize(width, height, FilterType::Lanczos3),
    };
    if options.flop {
        image = image.fliph();
    }
    if options.flip {
        image = image.flipv();
    }
    image
}

fn apply_filters(image: DynamicImage, options: &TransformOptions) -> DynamicImage {
    let image = match options.colour {
        Colour::Srgb => image,
        Colour::Bw => image.grayscale(),
    };
    if options.blur_sigma > 0.0 {
        image.blur(options.blur_sigma)
    } else {
        image
    }
}

fn output_format_for_source(source: Option<ImageFormat>) -> Result<Format, TransformError> {
    match source {
        Some(ImageFormat::Jpeg) => Ok(Format::Jpeg),
        Some(ImageFormat::Png) => Ok(Format::Png),
        Some(ImageFormat::WebP) => Ok(Format::Webp),
        _ => Err(TransformError::UnsupportedSource),
    }
}

fn encode_image(
    image: &DynamicImage,
    format: Format,
    quality: u8,
) -> Result<Vec<u8>, TransformError> {
    let mut bytes = Vec::new();
    match format {
        Format::Jpeg => {
            let rgb = image.to_rgb8();
            let mut encoder = if quality > 0 {
                JpegEncoder::new_with_quality(&mut bytes, quality)
            } else {
                JpegEncoder::new(&mut bytes)
            };
            encoder
                .encode(
                    rgb.as_raw(),
                    rgb.width(),
                    rgb.height(),
                    ExtendedColorType::Rgb8,
                )
                .map_err(TransformError::Encode)?;
        }
        Format::Png => {
            image
                .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
                .map_err(TransformError::Encode)?;
        }
        Format::Webp => {
            let rgba = image.to_rgba8();
            let encoder = WebPEncoder::new_lossless(&mut bytes);
            encoder
                .encode(
                    rgba.as_raw(),
                    rgba.width(),
                    rgba.height(),
                    ExtendedColorType::Rgba8,
                )
                .map_err(TransformError::Encode)?;
        }
    }
    Ok(bytes)
}
