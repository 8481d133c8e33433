use image::ImageFormat;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::services::formats::extension_of;

/// A single conversion: read `source`, write `output` in the format implied
/// by its extension, optionally bounded to `max_dimension` pixels.
#[derive(Debug, Clone, Copy)]
pub struct TranscodeRequest<'a> {
    pub source: &'a Path,
    pub output: &'a Path,
    pub max_dimension: Option<u32>,
}

/// Produces derivative files (alternate formats, thumbnails) from a source.
#[async_trait::async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode(&self, request: TranscodeRequest<'_>) -> Result<(), TranscodeError>;
}

/// Still-image conversions handled in-process with the `image` crate.
#[derive(Debug, Default, Clone)]
pub struct ImageTranscoder;

impl ImageTranscoder {
    /// True when both ends are formats this build can read and write.
    pub fn supports(source: &Path, output: &Path) -> bool {
        let readable = ImageFormat::from_path(source)
            .map(|f| f.reading_enabled())
            .unwrap_or(false);
        let writable = ImageFormat::from_path(output)
            .map(|f| f.writing_enabled())
            .unwrap_or(false);
        readable && writable
    }
}

#[async_trait::async_trait]
impl Transcoder for ImageTranscoder {
    async fn transcode(&self, request: TranscodeRequest<'_>) -> Result<(), TranscodeError> {
        let source = request.source.to_path_buf();
        let output = request.output.to_path_buf();
        let max_dimension = request.max_dimension;

        // Decoding and resizing are CPU-bound.
        tokio::task::spawn_blocking(move || -> Result<(), TranscodeError> {
            let format = ImageFormat::from_path(&output)?;
            let mut img = image::open(&source)?;
            if let Some(max) = max_dimension {
                img = img.thumbnail(max, max);
            }
            // JPEG has no alpha channel.
            if format == ImageFormat::Jpeg {
                img = image::DynamicImage::ImageRgb8(img.to_rgb8());
            }
            img.save_with_format(&output, format)?;
            Ok(())
        })
        .await
        .map_err(|e| TranscodeError::Unavailable(format!("image worker panicked: {e}")))?
    }
}

/// Conversions delegated to an external `ffmpeg` binary.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoder {
    binary: PathBuf,
}

impl FfmpegTranscoder {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn arguments(request: &TranscodeRequest<'_>) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-y".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            request.source.to_string_lossy().into_owned(),
        ];

        let output_ext = extension_of(request.output).unwrap_or_default();
        let still_output = matches!(output_ext.as_str(), "jpg" | "jpeg" | "png" | "webp");

        if let Some(max) = request.max_dimension {
            args.push("-vf".into());
            args.push(format!(
                "scale=w={max}:h={max}:force_original_aspect_ratio=decrease"
            ));
        }
        if still_output {
            args.extend(["-frames:v".into(), "1".into()]);
        } else if output_ext == "mp4" {
            args.extend([
                "-c:v".into(),
                "libx264".into(),
                "-pix_fmt".into(),
                "yuv420p".into(),
                "-c:a".into(),
                "aac".into(),
                "-movflags".into(),
                "+faststart".into(),
            ]);
        }

        args.push(request.output.to_string_lossy().into_owned());
        args
    }
}

#[async_trait::async_trait]
impl Transcoder for FfmpegTranscoder {
    async fn transcode(&self, request: TranscodeRequest<'_>) -> Result<(), TranscodeError> {
        let args = Self::arguments(&request);
        tracing::debug!(
            source = %request.source.display(),
            output = %request.output.display(),
            "Running ffmpeg"
        );

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TranscodeError::Unavailable(format!(
                    "ffmpeg not found at {}",
                    self.binary.display()
                )),
                _ => TranscodeError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr.lines().rev().take(3).collect::<Vec<_>>().join(" | ");
            return Err(TranscodeError::Failed(format!(
                "ffmpeg exited with {}: {}",
                output.status, tail
            )));
        }
        Ok(())
    }
}

/// Routes still-image work to [`ImageTranscoder`] and everything else
/// (HEIC stills, video, poster frames) to ffmpeg.
pub struct MediaTranscoder {
    images: ImageTranscoder,
    ffmpeg: FfmpegTranscoder,
}

impl MediaTranscoder {
    pub fn new(ffmpeg_binary: impl Into<PathBuf>) -> Self {
        Self {
            images: ImageTranscoder,
            ffmpeg: FfmpegTranscoder::new(ffmpeg_binary),
        }
    }
}

#[async_trait::async_trait]
impl Transcoder for MediaTranscoder {
    async fn transcode(&self, request: TranscodeRequest<'_>) -> Result<(), TranscodeError> {
        if ImageTranscoder::supports(request.source, request.output) {
            self.images.transcode(request).await
        } else {
            self.ffmpeg.transcode(request).await
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    /// The transcoder could not be reached; worth retrying.
    #[error("Transcoder unavailable: {0}")]
    Unavailable(String),

    #[error("Transcode failed: {0}")]
    Failed(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TranscodeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TranscodeError::Unavailable(_) | TranscodeError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_support_detection() {
        assert!(ImageTranscoder::supports(Path::new("a.png"), Path::new("b.jpg")));
        assert!(!ImageTranscoder::supports(Path::new("a.heic"), Path::new("b.jpg")));
        assert!(!ImageTranscoder::supports(Path::new("a.mov"), Path::new("b.jpg")));
    }

    #[test]
    fn test_ffmpeg_thumbnail_arguments() {
        let request = TranscodeRequest {
            source: Path::new("/in/clip.mov"),
            output: Path::new("/out/thumb-320.jpg"),
            max_dimension: Some(320),
        };
        let args = FfmpegTranscoder::arguments(&request);
        assert!(args.contains(&"-frames:v".to_string()));
        assert!(args.iter().any(|a| a.starts_with("scale=w=320:h=320")));
        assert_eq!(args.last().map(String::as_str), Some("/out/thumb-320.jpg"));
    }

    #[tokio::test]
    async fn test_image_thumbnail_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.png");
        let output = dir.path().join("thumb.jpg");
        image::RgbaImage::new(400, 200).save(&source).unwrap();

        ImageTranscoder
            .transcode(TranscodeRequest {
                source: &source,
                output: &output,
                max_dimension: Some(100),
            })
            .await
            .unwrap();

        let thumb = image::open(&output).unwrap();
        assert_eq!((thumb.width(), thumb.height()), (100, 50));
    }

    #[tokio::test]
    async fn test_missing_ffmpeg_is_transient() {
        let transcoder = FfmpegTranscoder::new("/nonexistent/ffmpeg-binary");
        let err = transcoder
            .transcode(TranscodeRequest {
                source: Path::new("/in/a.mov"),
                output: Path::new("/out/a.mp4"),
                max_dimension: None,
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
