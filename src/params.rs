use mime::Mime;
use serde::{Deserialize, Serialize};

pub const MAX_DIMENSION: u32 = 8192;
pub const MAX_QUALITY: u8 = 90;
pub const DEFAULT_QUALITY: u8 = 75;
pub const MAX_BLUR_SIGMA: u32 = 50;

/// Raw query values as they arrive on the wire. Unknown keys are ignored
/// and every field is optional; decoding never fails a request.
#[derive(Debug, Default, Deserialize)]
pub struct ImageQuery {
    pub w: Option<String>,
    pub h: Option<String>,
    pub q: Option<String>,
    pub blur: Option<String>,
    pub fmt: Option<String>,
    pub c: Option<String>,
    pub flip: Option<String>,
}

/// Normalized transformation parameters. Every numeric field is either 0
/// (unset) or inside its documented range once `validate_params` has run.
///
/// Serialization order and zero-field omission are load-bearing: the
/// serialized form feeds the request fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Params {
    #[serde(rename = "w", skip_serializing_if = "is_zero_u32")]
    pub width: u32,
    #[serde(rename = "h", skip_serializing_if = "is_zero_u32")]
    pub height: u32,
    #[serde(rename = "q", skip_serializing_if = "is_zero_u8")]
    pub quality: u8,
    #[serde(rename = "blur", skip_serializing_if = "is_zero_u32")]
    pub blur: u32,
    #[serde(skip_serializing_if = "is_false")]
    pub flip: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub flop: bool,
    #[serde(rename = "c")]
    pub colour: Colour,
    #[serde(rename = "fmt", skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            quality: 0,
            blur: 0,
            flip: false,
            flop: false,
            colour: Colour::Srgb,
            format: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    Srgb,
    Bw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    Jpeg,
    Png,
    Webp,
}

impl Format {
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }

    pub fn mime(&self) -> Mime {
        match self {
            Self::Jpeg => mime::IMAGE_JPEG,
            Self::Png => mime::IMAGE_PNG,
            Self::Webp => "image/webp".parse().expect("static mime"),
        }
    }
}

/// Clamp untrusted query values into a canonical `Params`. Invalid input
/// degrades to defaults; this function has no failure path.
pub fn validate_params(query: &ImageQuery) -> Params {
    let mut params = Params::default();

    if let Some(width) = parse_int(query.w.as_deref()) {
        if width > 0 && width <= MAX_DIMENSION as i64 {
            params.width = width as u32;
        }
    }

    if let Some(height) = parse_int(query.h.as_deref()) {
        if height > 0 && height <= MAX_DIMENSION as i64 {
            params.height = height as u32;
        }
    }

    // A single dimension implies a square output.
    if params.width > 0 && params.height == 0 {
        params.height = params.width;
    } else if params.height > 0 && params.width == 0 {
        params.width = params.height;
    }

    // An out-of-range value resets to the default; an absent or
    // unparseable one stays 0 and defers to the transform engine.
    if let Some(quality) = parse_int(query.q.as_deref()) {
        if quality > 0 && quality <= MAX_QUALITY as i64 {
            params.quality = quality as u8;
        } else {
            params.quality = DEFAULT_QUALITY;
        }
    }

    if let Some(blur) = parse_int(query.blur.as_deref()) {
        if blur > 0 && blur <= MAX_BLUR_SIGMA as i64 {
            params.blur = blur as u32;
        } else if blur > MAX_BLUR_SIGMA as i64 {
            params.blur = MAX_BLUR_SIGMA;
        }
    }

    if let Some(fmt) = query.fmt.as_deref() {
        params.format = Format::from_token(fmt);
    }

    if let Some(c) = query.c.as_deref() {
        if c.eq_ignore_ascii_case("bw") {
            params.colour = Colour::Bw;
        }
    }

    if let Some(flip) = query.flip.as_deref() {
        match flip.to_lowercase().as_str() {
            "h" => params.flop = true,
            "v" => params.flip = true,
            _ => {}
        }
    }

    params
}

fn parse_int(value: Option<&str>) -> Option<i64> {
    value?.trim().parse().ok()
}

fn is_zero_u32(value: &u32) -> bool {
    *value == 0
}

fn is_zero_u8(value: &u8) -> bool {
    *value == 0
}

fn is_false(value: &bool) -> bool {
    !*value
}
