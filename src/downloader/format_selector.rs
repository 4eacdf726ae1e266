// FormatSelector - unified format selection logic
//
// Converts raw formats from the resolver into UI-friendly options.
// Handles:
// - Best quality detection (by resolution, H.264 preferred)
// - One option per distinct video height, highest first
// - Audio-only extraction
// - Size estimation (video + audio combined)
// - Mapping a selector onto an item's own options (playlists)

use super::models::{QualityOption, QualitySelector, RawFormat};
use super::utils::format_size;

/// Format expressions handed to yt-dlp
pub const BEST_FORMAT_SPEC: &str = "bestvideo+bestaudio/best";
pub const AUDIO_FORMAT_SPEC: &str = "bestaudio/best";

/// Format selector with smart quality detection
pub struct FormatSelector;

impl FormatSelector {
    /// Build quality options from raw formats: best, each height, audio
    pub fn build_quality_options(formats: &[RawFormat]) -> Vec<QualityOption> {
        let mut options = Vec::new();

        let video_formats: Vec<&RawFormat> = formats.iter().filter(|f| f.has_video()).collect();
        let audio_formats: Vec<&RawFormat> = formats.iter().filter(|f| f.is_audio_only()).collect();

        let best_audio = Self::find_best_audio(&audio_formats);
        let best_audio_size = best_audio.and_then(|a| a.effective_size()).unwrap_or(0);

        // 1. Best Quality option
        match Self::find_best_video(&video_formats) {
            Some(best) => {
                let requires_merge = best.is_video_only() && best_audio.is_some();
                options.push(QualityOption {
                    id: "best".to_string(),
                    label: Self::video_label("Best Quality", best, requires_merge, best_audio_size),
                    requires_merge,
                    height: best.height,
                    estimated_size: Self::estimate(best, requires_merge, best_audio_size),
                    codec: Some(Self::get_codec_label(best)),
                    is_audio: false,
                });
            }
            None => options.push(QualityOption {
                requires_merge: false,
                ..QualityOption::best_available()
            }),
        }

        // 2. Every distinct height, highest first
        let mut heights: Vec<u32> = video_formats.iter().filter_map(|f| f.height).collect();
        heights.sort_unstable_by(|a, b| b.cmp(a));
        heights.dedup();

        for height in heights {
            if let Some(fmt) = Self::find_by_height(&video_formats, height) {
                let requires_merge = fmt.is_video_only() && best_audio.is_some();
                options.push(QualityOption {
                    id: format!("{}p", height),
                    label: Self::video_label(&format!("{}p", height), fmt, requires_merge, best_audio_size),
                    requires_merge,
                    height: Some(height),
                    estimated_size: Self::estimate(fmt, requires_merge, best_audio_size),
                    codec: Some(Self::get_codec_label(fmt)),
                    is_audio: false,
                });
            }
        }

        // 3. Audio only (MP3)
        options.push(QualityOption {
            id: "audio".to_string(),
            label: "Audio Only (MP3)".to_string(),
            requires_merge: false,
            height: None,
            estimated_size: best_audio.and_then(|a| a.effective_size()).map(format_size),
            codec: best_audio.and_then(|a| a.acodec.clone()),
            is_audio: true,
        });

        options
    }

    /// yt-dlp format expression for an option
    pub fn format_spec(option: &QualityOption) -> String {
        if option.is_audio {
            return AUDIO_FORMAT_SPEC.to_string();
        }
        match option.height {
            Some(h) if !option.is_best() => format!(
                "bestvideo[height<={h}][vcodec^=avc1]+bestaudio[acodec^=mp4a]/bestvideo[height<={h}]+bestaudio/best[height<={h}]"
            ),
            _ => BEST_FORMAT_SPEC.to_string(),
        }
    }

    /// Map a selector onto an item's options, degrading instead of failing:
    /// a missing height falls back to the closest lower one, then to best.
    pub fn closest_option(options: &[QualityOption], selector: &QualitySelector) -> QualityOption {
        let best = options
            .iter()
            .find(|o| o.is_best())
            .cloned()
            .unwrap_or_else(QualityOption::best_available);

        match selector {
            QualitySelector::Best => best,
            QualitySelector::Audio => options.iter().find(|o| o.is_audio).cloned().unwrap_or(best),
            QualitySelector::Height(h) => Self::at_most(options, *h).unwrap_or(best),
            QualitySelector::Id(id) => {
                let lower = id.to_lowercase();
                options
                    .iter()
                    .find(|o| o.id.to_lowercase() == lower || o.label.to_lowercase() == lower)
                    .cloned()
                    .unwrap_or(best)
            }
            QualitySelector::Index(i) => options.get(i.saturating_sub(1)).cloned().unwrap_or(best),
        }
    }

    fn at_most(options: &[QualityOption], height: u32) -> Option<QualityOption> {
        options
            .iter()
            .filter(|o| !o.is_best() && !o.is_audio)
            .filter(|o| o.height.map_or(false, |oh| oh <= height))
            .max_by_key(|o| o.height.unwrap_or(0))
            .cloned()
    }

    /// Find best video format (highest resolution with H.264 preference)
    fn find_best_video<'a>(formats: &[&'a RawFormat]) -> Option<&'a RawFormat> {
        let best_h264 = formats
            .iter()
            .filter(|f| f.is_h264())
            .max_by_key(|f| (f.height.unwrap_or(0), f.effective_size().unwrap_or(0)));

        let best_any = formats
            .iter()
            .max_by_key(|f| (f.height.unwrap_or(0), f.effective_size().unwrap_or(0)));

        match (best_h264, best_any) {
            // A much higher resolution in VP9/AV1 (e.g., 4K vs 1080p) wins
            (Some(h264), Some(any)) if any.height.unwrap_or(0) > h264.height.unwrap_or(0) * 3 / 2 => {
                Some(*any)
            }
            (Some(h264), _) => Some(*h264),
            (None, any) => any.copied(),
        }
    }

    /// Representative format for an exact height, H.264 preferred
    fn find_by_height<'a>(formats: &[&'a RawFormat], height: u32) -> Option<&'a RawFormat> {
        let matches: Vec<&'a RawFormat> = formats
            .iter()
            .filter(|f| f.height == Some(height))
            .copied()
            .collect();

        if let Some(h264) = matches.iter().find(|f| f.is_h264()) {
            return Some(*h264);
        }

        matches
            .into_iter()
            .max_by_key(|f| f.effective_size().unwrap_or(0))
    }

    /// Find best audio format (prefer AAC for compatibility)
    fn find_best_audio<'a>(formats: &[&'a RawFormat]) -> Option<&'a RawFormat> {
        let by_bitrate = |f: &&&RawFormat| f.abr.map(|b| (b * 100.0) as u32).unwrap_or(0);

        formats
            .iter()
            .filter(|f| f.is_aac())
            .max_by_key(by_bitrate)
            .or_else(|| formats.iter().max_by_key(by_bitrate))
            .copied()
    }

    fn estimate(format: &RawFormat, requires_merge: bool, audio_size: u64) -> Option<String> {
        let size = format.effective_size()?;
        let total = if requires_merge { size + audio_size } else { size };
        Some(format_size(total))
    }

    fn video_label(prefix: &str, format: &RawFormat, requires_merge: bool, audio_size: u64) -> String {
        let mut details = Vec::new();
        if let (Some(w), Some(h)) = (format.width, format.height) {
            details.push(format!("{}x{}", w, h));
        }
        details.push(Self::get_codec_label(format));
        if let Some(size) = Self::estimate(format, requires_merge, audio_size) {
            details.push(format!("~{}", size));
        }
        format!("{} ({})", prefix, details.join(", "))
    }

    /// Get human-readable codec label
    fn get_codec_label(format: &RawFormat) -> String {
        if format.is_h264() {
            "H.264".to_string()
        } else if format.is_vp9() {
            "VP9".to_string()
        } else if format.is_av1() {
            "AV1".to_string()
        } else {
            format
                .vcodec
                .as_deref()
                .map(|v| v.split('.').next().unwrap_or(v).to_string())
                .unwrap_or_else(|| "Unknown".to_string())
        }
    }
}
