use std::path::PathBuf;

use crate::config::AudioConfig;
use crate::detect::FileCategory;
use crate::error::ProcessError;
use crate::processor::command::run_tool;
use crate::processor::{write_error, MediaProcessor, WorkItem};
use crate::storage::filesystem::{bytes_to_mb, remove_artifact};

/// Re-encodes audio to MP3 through ffmpeg. The thumbnail is a waveform
/// image when ffmpeg can draw one, a short text description otherwise.
pub struct AudioProcessor {
    config: AudioConfig,
}

impl AudioProcessor {
    pub fn new(config: AudioConfig) -> Self {
        Self { config }
    }

    fn encode_args(&self, item: &WorkItem<'_>) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            item.input.display().to_string(),
            "-vn".to_string(),
            "-codec:a".to_string(),
            "libmp3lame".to_string(),
            "-b:a".to_string(),
            format!("{}k", self.config.bitrate_kbps),
            item.output.display().to_string(),
        ]
    }

    fn waveform_args(&self, item: &WorkItem<'_>, target: &std::path::Path) -> Vec<String> {
        vec![
            "-y".to_string(),
            "-hide_banner".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            item.output.display().to_string(),
            "-filter_complex".to_string(),
            format!(
                "showwavespic=s={}x{}:colors={}",
                self.config.waveform_width, self.config.waveform_height, self.config.waveform_color
            ),
            "-frames:v".to_string(),
            "1".to_string(),
            target.display().to_string(),
        ]
    }

    fn describe(&self, item: &WorkItem<'_>) -> String {
        let size = std::fs::metadata(item.output)
            .map(|m| bytes_to_mb(m.len()))
            .unwrap_or(0.0);
        format!(
            "Audio file: {}\nFormat: MP3 {} kbps\nSize: {} MB\n",
            item.display_name, self.config.bitrate_kbps, size
        )
    }
}

impl MediaProcessor for AudioProcessor {
    fn category(&self) -> FileCategory {
        FileCategory::Audio
    }

    fn transform(&self, item: &WorkItem<'_>) -> Result<(), ProcessError> {
        let _span = tracing::info_span!("processor.audio").entered();
        run_tool(&self.config.ffmpeg_path, self.encode_args(item))?;
        Ok(())
    }

    fn thumbnail(&self, item: &WorkItem<'_>) -> Result<PathBuf, ProcessError> {
        let _span = tracing::info_span!("processor.audio.waveform").entered();

        let waveform = item.thumbnail_path("_waveform.png");
        match run_tool(&self.config.ffmpeg_path, self.waveform_args(item, &waveform)) {
            Ok(_) if waveform.exists() => return Ok(waveform),
            Ok(_) => tracing::warn!("ffmpeg produced no waveform image, using text description"),
            Err(e) => {
                tracing::warn!(error = %e, "Waveform rendering failed, using text description");
                remove_artifact(&waveform);
            }
        }

        let info = item.thumbnail_path("_info.txt");
        std::fs::write(&info, self.describe(item)).map_err(|e| write_error(&info, e))?;
        Ok(info)
    }
}
