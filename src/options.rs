use std::{collections::BTreeMap, fmt};

use axum::http::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{config::non_empty, error::ApiError};

const DEFAULT_AUDIO_BITRATE_KBPS: u32 = 192;
const MIN_AUDIO_BITRATE_KBPS: u32 = 32;
const MAX_AUDIO_BITRATE_KBPS: u32 = 320;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Best,
    MaxHeight(u32),
}

impl Quality {
    /// Accepts `best`, `720` or `720p`. Anything unparseable means `Best`, and
    /// so does a zero height such as `0p`, which could never match a format.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.eq_ignore_ascii_case("best") {
            return Self::Best;
        }

        value
            .trim_end_matches(['p', 'P'])
            .parse::<u32>()
            .ok()
            .filter(|height| *height > 0)
            .map(Self::MaxHeight)
            .unwrap_or(Self::Best)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputType {
    Mp4,
    Webm,
    Mkv,
    Mp3,
    M4a,
    Opus,
}

impl OutputType {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "webm" => Some(Self::Webm),
            "mkv" => Some(Self::Mkv),
            "mp3" => Some(Self::Mp3),
            "m4a" => Some(Self::M4a),
            "opus" => Some(Self::Opus),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
            Self::Mkv => "mkv",
            Self::Mp3 => "mp3",
            Self::M4a => "m4a",
            Self::Opus => "opus",
        }
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Self::Mp3 | Self::M4a | Self::Opus)
    }
}

impl fmt::Display for OutputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Numbers arrive as JSON numbers from POST bodies and as text from query strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberParam {
    Number(u64),
    Text(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum FlagParam {
    Bool(bool),
    Text(String),
}

impl FlagParam {
    pub fn is_set(&self) -> bool {
        match self {
            Self::Bool(value) => *value,
            Self::Text(value) => matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
        }
    }
}

/// A JSON object in POST bodies, or the same object JSON-encoded in a query string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum HeadersParam {
    Map(BTreeMap<String, String>),
    Encoded(String),
}

impl HeadersParam {
    fn into_pairs(self) -> Result<Vec<(String, String)>, ApiError> {
        match self {
            Self::Map(map) => Ok(map.into_iter().collect()),
            Self::Encoded(raw) if raw.trim().is_empty() => Ok(Vec::new()),
            Self::Encoded(raw) => serde_json::from_str::<BTreeMap<String, String>>(&raw)
                .map(|map| map.into_iter().collect())
                .map_err(|error| {
                    ApiError::bad_request(format!("headers must be a JSON object of strings: {error}"))
                }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestParams {
    pub url: Option<String>,
    pub quality: Option<String>,
    pub output_type: Option<String>,
    pub mp3_bitrate: Option<NumberParam>,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub headers: Option<HeadersParam>,
    pub stream: Option<FlagParam>,
}

impl RequestParams {
    pub fn wants_stream(&self) -> bool {
        self.stream.as_ref().is_some_and(FlagParam::is_set)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOptions {
    pub url: String,
    pub quality: Quality,
    pub output: OutputType,
    pub audio_bitrate_kbps: u32,
    pub referer: Option<String>,
    pub user_agent: Option<String>,
    pub extra_headers: Vec<(String, String)>,
}

impl DownloadOptions {
    pub fn from_params(params: RequestParams) -> Result<Self, ApiError> {
        let url = params
            .url
            .as_deref()
            .and_then(non_empty)
            .ok_or_else(|| ApiError::bad_request("URL required"))?
            .to_string();
        validate_media_url(&url)?;

        let quality = params
            .quality
            .as_deref()
            .and_then(non_empty)
            .map(Quality::parse)
            .unwrap_or(Quality::Best);

        let output = match params.output_type.as_deref().and_then(non_empty) {
            None => OutputType::Mp4,
            Some(value) => OutputType::parse(value).ok_or_else(|| {
                ApiError::bad_request(format!(
                    "Unsupported outputType {value:?}. Use mp4, webm, mkv, mp3, m4a or opus."
                ))
            })?,
        };

        let audio_bitrate_kbps = match params.mp3_bitrate {
            None => DEFAULT_AUDIO_BITRATE_KBPS,
            Some(value) => parse_bitrate(value)?,
        };

        let extra_headers = params
            .headers
            .map(HeadersParam::into_pairs)
            .transpose()?
            .unwrap_or_default()
            .into_iter()
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect::<Vec<_>>();
        for (name, value) in &extra_headers {
            validate_header(name, value)?;
        }

        let referer = params
            .referer
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string);
        let user_agent = params
            .user_agent
            .as_deref()
            .and_then(non_empty)
            .map(ToString::to_string);
        if let Some(value) = &referer {
            validate_header("Referer", value)?;
        }
        if let Some(value) = &user_agent {
            validate_header("User-Agent", value)?;
        }

        Ok(Self {
            url,
            quality,
            output,
            audio_bitrate_kbps,
            referer,
            user_agent,
            extra_headers,
        })
    }

    pub fn is_audio(&self) -> bool {
        self.output.is_audio()
    }

    pub fn extension(&self) -> &'static str {
        self.output.extension()
    }

    /// HTTP headers forwarded to the extractor. Extra headers override
    /// User-Agent and Referer, compared case-insensitively.
    pub fn http_headers(&self) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> = Vec::new();
        let mut upsert = |name: &str, value: &str| {
            match headers
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            {
                Some(entry) => entry.1 = value.to_string(),
                None => headers.push((name.to_string(), value.to_string())),
            }
        };

        if let Some(user_agent) = &self.user_agent {
            upsert("User-Agent", user_agent);
        }
        if let Some(referer) = &self.referer {
            upsert("Referer", referer);
        }
        for (name, value) in &self.extra_headers {
            upsert(name, value);
        }

        headers
    }

    /// Arguments shared by every extractor invocation, without the URL.
    pub fn extractor_args(&self) -> Vec<String> {
        let mut args = base_args();
        args.extend(self.header_args());

        if self.is_audio() {
            args.extend([
                "-f".to_string(),
                "bestaudio/best".to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                self.extension().to_string(),
                "--audio-quality".to_string(),
                format!("{}K", self.audio_bitrate_kbps),
            ]);
        } else {
            args.extend([
                "-f".to_string(),
                format_selector(self.quality),
                "--merge-output-format".to_string(),
                self.extension().to_string(),
            ]);
        }

        args
    }

    /// Arguments for writing a single unprocessed stream to stdout.
    pub fn pipe_args(&self) -> Vec<String> {
        let mut args = base_args();
        args.extend(self.header_args());
        args.push("-f".to_string());
        if self.is_audio() {
            args.push("bestaudio/best".to_string());
        } else {
            args.push(single_file_selector(self.quality));
        }
        args
    }

    /// Arguments for metadata-only extraction, without the URL.
    pub fn probe_args(&self) -> Vec<String> {
        let mut args = base_args();
        args.extend(self.header_args());
        args
    }

    fn header_args(&self) -> Vec<String> {
        self.http_headers()
            .into_iter()
            .flat_map(|(name, value)| ["--add-header".to_string(), format!("{name}:{value}")])
            .collect()
    }
}

fn base_args() -> Vec<String> {
    vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--quiet".to_string(),
        "--geo-bypass".to_string(),
    ]
}

pub fn format_selector(quality: Quality) -> String {
    match quality {
        Quality::Best => "bestvideo+bestaudio/best".to_string(),
        Quality::MaxHeight(height) => format!(
            "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/\
             bestvideo[height<={height}]+bestaudio/\
             best[height<={height}]"
        ),
    }
}

/// Selector that never needs a merge, for piping straight to stdout.
pub fn single_file_selector(quality: Quality) -> String {
    match quality {
        Quality::Best => "best[ext=mp4]/best".to_string(),
        Quality::MaxHeight(height) => {
            format!("best[height<={height}][ext=mp4]/best[height<={height}]")
        }
    }
}

fn validate_media_url(value: &str) -> Result<(), ApiError> {
    let parsed = Url::parse(value)
        .map_err(|error| ApiError::bad_request(format!("Invalid URL {value:?}: {error}")))?;

    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(ApiError::bad_request(
            "Only http and https URLs can be downloaded.",
        ));
    }

    Ok(())
}

fn parse_bitrate(value: NumberParam) -> Result<u32, ApiError> {
    let parsed = match value {
        NumberParam::Number(number) => u32::try_from(number).ok(),
        NumberParam::Text(text) => text.trim().trim_end_matches(['k', 'K']).parse::<u32>().ok(),
    };

    parsed
        .filter(|bitrate| (MIN_AUDIO_BITRATE_KBPS..=MAX_AUDIO_BITRATE_KBPS).contains(bitrate))
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "mp3Bitrate must be a number between {MIN_AUDIO_BITRATE_KBPS} and {MAX_AUDIO_BITRATE_KBPS}."
            ))
        })
}

fn validate_header(name: &str, value: &str) -> Result<(), ApiError> {
    if name.is_empty() || name.contains(':') || HeaderName::from_bytes(name.as_bytes()).is_err() {
        return Err(ApiError::bad_request(format!("Invalid header name {name:?}.")));
    }

    if value.contains(['\r', '\n']) || HeaderValue::from_str(value).is_err() {
        return Err(ApiError::bad_request(format!(
            "Invalid value for header {name:?}."
        )));
    }

    Ok(())
}
