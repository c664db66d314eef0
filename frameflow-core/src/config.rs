use std::{fmt, io::ErrorKind, path::Path};

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer};

use crate::pool::BYTES_PER_PIXEL;

/// Hardware acceleration APIs recognised on the decoder command line.
/// Anything unrecognised falls back to `Auto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HwAccelApi {
    #[default]
    Auto,
    None,
    Vdpau,
    Dxva2,
    D3d11va,
    Vaapi,
    Qsv,
    Videotoolbox,
    Cuda,
}

impl HwAccelApi {
    pub fn parse(text: &str) -> HwAccelApi {
        match text.to_ascii_lowercase().as_str() {
            "none" => HwAccelApi::None,
            "vdpau" => HwAccelApi::Vdpau,
            "dxva2" => HwAccelApi::Dxva2,
            "d3d11va" => HwAccelApi::D3d11va,
            "vaapi" => HwAccelApi::Vaapi,
            "qsv" => HwAccelApi::Qsv,
            "videotoolbox" => HwAccelApi::Videotoolbox,
            "cuda" => HwAccelApi::Cuda,
            _ => HwAccelApi::Auto,
        }
    }

    pub fn as_arg(self) -> &'static str {
        match self {
            HwAccelApi::Auto => "auto",
            HwAccelApi::None => "none",
            HwAccelApi::Vdpau => "vdpau",
            HwAccelApi::Dxva2 => "dxva2",
            HwAccelApi::D3d11va => "d3d11va",
            HwAccelApi::Vaapi => "vaapi",
            HwAccelApi::Qsv => "qsv",
            HwAccelApi::Videotoolbox => "videotoolbox",
            HwAccelApi::Cuda => "cuda",
        }
    }
}

impl fmt::Display for HwAccelApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_arg())
    }
}

impl<'de> Deserialize<'de> for HwAccelApi {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<HwAccelApi, D::Error> {
        let text = String::deserialize(deserializer)?;
        Ok(HwAccelApi::parse(&text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Options {
    /// Try the hardware decode path first.
    pub hardware_decode: bool,
    /// Value passed as `-hwaccel`.
    pub hardware_decode_api: HwAccelApi,
    /// Frame-cache capacity; 0 derives one from the stream geometry.
    pub max_cache_size: usize,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            hardware_decode: true,
            hardware_decode_api: HwAccelApi::Auto,
            max_cache_size: 0,
        }
    }
}

const CACHE_MEMORY_BUDGET: usize = 768 * 1024 * 1024;
const FHD_PIXELS: u64 = 1920 * 1080;

impl Options {
    pub fn cache_capacity(&self, width: u32, height: u32) -> usize {
        if self.max_cache_size > 0 {
            return self.max_cache_size;
        }
        auto_cache_capacity(width, height)
    }
}

/// As many frames as fit the memory budget, clamped to a sane band; high
/// resolutions get a tighter upper bound.
fn auto_cache_capacity(width: u32, height: u32) -> usize {
    let frame_len = (width as usize * height as usize * BYTES_PER_PIXEL).max(1);
    let by_budget = CACHE_MEMORY_BUDGET / frame_len;
    let upper = if width as u64 * height as u64 > FHD_PIXELS {
        120
    } else {
        240
    };
    by_budget.clamp(12, upper)
}

/// On-disk settings: JSON with comments; unknown fields ignored.
#[derive(Default, Deserialize)]
#[serde(default)]
struct SettingsFile {
    hardware_decode: Option<bool>,
    hardware_decode_api: Option<HwAccelApi>,
    max_cache_size: Option<i64>,
}

/// Reads the settings file at `path`; a missing file yields the defaults.
pub fn load_settings(path: &Path) -> Result<Options> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Options::default()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    parse_settings(&text).with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_settings(text: &str) -> Result<Options> {
    let stripped = strip_comments(text);
    let file: SettingsFile =
        serde_json::from_str(&stripped).context("settings are not valid JSON")?;
    let defaults = Options::default();
    Ok(Options {
        hardware_decode: file.hardware_decode.unwrap_or(defaults.hardware_decode),
        hardware_decode_api: file
            .hardware_decode_api
            .unwrap_or(defaults.hardware_decode_api),
        max_cache_size: file
            .max_cache_size
            .map(|size| size.max(0) as usize)
            .unwrap_or(defaults.max_cache_size),
    })
}

/// Removes `//` line and `/* */` block comments outside string literals,
/// preserving newlines so parse errors still point at the right line.
fn strip_comments(text: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Code,
        Str { escaped: bool },
        Line,
        Block,
    }

    let mut out = String::with_capacity(text.len());
    let mut state = State::Code;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match state {
            State::Code => match c {
                '"' => {
                    state = State::Str { escaped: false };
                    out.push(c);
                }
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::Line;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::Block;
                }
                _ => out.push(c),
            },
            State::Str { escaped } => {
                out.push(c);
                state = match c {
                    _ if escaped => State::Str { escaped: false },
                    '\\' => State::Str { escaped: true },
                    '"' => State::Code,
                    _ => State::Str { escaped: false },
                };
            }
            State::Line => {
                if c == '\n' {
                    out.push(c);
                    state = State::Code;
                }
            }
            State::Block => {
                if c == '\n' {
                    out.push(c);
                } else if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults() {
        let options = Options::default();
        assert!(options.hardware_decode);
        assert_eq!(options.hardware_decode_api, HwAccelApi::Auto);
        assert_eq!(options.max_cache_size, 0);
    }

    #[test]
    fn test_parse_settings_with_comments_and_unknown_fields() {
        let text = r#"{
            // scrubbing feels better with the gpu involved
            "hardware_decode": true,
            "hardware_decode_api": "vaapi", /* linux */
            "max_cache_size": 48,
            "unrelated_host_option": { "nested": "// not a comment" }
        }"#;
        let options = parse_settings(text).unwrap();
        assert!(options.hardware_decode);
        assert_eq!(options.hardware_decode_api, HwAccelApi::Vaapi);
        assert_eq!(options.max_cache_size, 48);
    }

    #[test]
    fn test_unrecognised_api_maps_to_auto() {
        let options = parse_settings(r#"{ "hardware_decode_api": "metal" }"#).unwrap();
        assert_eq!(options.hardware_decode_api, HwAccelApi::Auto);
    }

    #[test]
    fn test_negative_cache_size_means_auto() {
        let options = parse_settings(r#"{ "max_cache_size": -3 }"#).unwrap();
        assert_eq!(options.max_cache_size, 0);
    }

    #[test]
    fn test_comment_markers_inside_strings_survive() {
        let stripped = strip_comments(r#"{ "a": "http://x/*y*/z" } // tail"#);
        assert!(stripped.contains("http://x/*y*/z"));
        assert!(!stripped.contains("tail"));
    }

    #[test]
    fn test_load_settings_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let options = load_settings(&dir.path().join("absent.json")).unwrap();
        assert_eq!(options, Options::default());
    }

    #[test]
    fn test_load_settings_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(file, r#"{{ "max_cache_size": 24 }} // trailing"#).unwrap();
        assert_eq!(load_settings(&path).unwrap().max_cache_size, 24);
    }

    #[test]
    fn test_auto_cache_capacity_bands() {
        // FHD: budget-bound. 768 MiB / (1920·1080·4) = 97.
        assert_eq!(auto_cache_capacity(1920, 1080), 97);
        // 4K: budget binds well under the above-FHD bound of 120.
        assert_eq!(auto_cache_capacity(3840, 2160), 24);
        // Small frames hit the generic upper bound.
        assert_eq!(auto_cache_capacity(640, 480), 240);
        // Absurdly small frames still keep a floor.
        assert!(auto_cache_capacity(2, 2) >= 12);
    }

    #[test]
    fn test_explicit_cache_size_wins() {
        let options = Options {
            max_cache_size: 7,
            ..Options::default()
        };
        assert_eq!(options.cache_capacity(1920, 1080), 7);
        let auto = Options::default();
        assert_eq!(auto.cache_capacity(1920, 1080), 97);
    }
}
