//! ffprobe JSON parsing.

use serde::Deserialize;

use super::error::TranscodeError;
use crate::modules::resource::model::MediaProbe;

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

#[derive(Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    duration: Option<String>,
    color_space: Option<String>,
}

/// Parses `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(output: &str) -> Result<MediaProbe, TranscodeError> {
    let probe: ProbeOutput = serde_json::from_str(output).map_err(|e| TranscodeError::ParseError {
        reason: e.to_string(),
    })?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or(TranscodeError::NoVideoStream)?;
    let audio = probe.streams.iter().find(|s| s.codec_type.as_deref() == Some("audio"));

    let (width, height) = match (video.width, video.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(TranscodeError::probe_failed("video stream has no dimensions")),
    };

    let duration_seconds = probe
        .format
        .as_ref()
        .and_then(|f| parse_seconds(f.duration.as_deref()))
        .or_else(|| parse_seconds(video.duration.as_deref()));

    let frame_rate = parse_frame_rate(video.r_frame_rate.as_deref())
        .or_else(|| parse_frame_rate(video.avg_frame_rate.as_deref()));

    Ok(MediaProbe {
        width,
        height,
        duration_seconds,
        frame_rate,
        video_codec: video.codec_name.clone().unwrap_or_else(|| "unknown".to_string()),
        color_space: video.color_space.clone().filter(|c| c != "unknown"),
        audio_codec: audio.and_then(|s| s.codec_name.clone()),
    })
}

fn parse_seconds(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Accepts `30000/1001`, `25/1` or a plain number. `0/0` means unknown.
pub fn parse_frame_rate(raw: Option<&str>) -> Option<f64> {
    let raw = raw?.trim();
    let rate = match raw.split_once('/') {
        Some((num, den)) => {
            let num = num.parse::<f64>().ok()?;
            let den = den.parse::<f64>().ok()?;
            if den == 0.0 {
                return None;
            }
            num / den
        }
        None => raw.parse::<f64>().ok()?,
    };
    (rate.is_finite() && rate > 0.0).then_some(rate)
}
