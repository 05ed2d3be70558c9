use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageError};
use thiserror::Error;

use crate::PixelBuffer;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("png encoding failed: {0}")]
    Image(#[from] ImageError),
}

/// Write `image` as an RGBA PNG at `path`, replacing any existing file.
pub fn encode_png(image: &PixelBuffer, path: impl AsRef<Path>) -> Result<(), EncodeError> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|source| io_error(path, source))?;
    write_png(image, BufWriter::new(file), path)
}

/// Encode into `writer` and flush it. I/O failures from the encoder or the
/// final flush are both reported as `EncodeError::Io`.
fn write_png<W: Write>(image: &PixelBuffer, mut writer: W, path: &Path) -> Result<(), EncodeError> {
    PngEncoder::new(&mut writer)
        .write_image(
            image.as_bytes(),
            image.width(),
            image.height(),
            ExtendedColorType::Rgba8,
        )
        .map_err(|e| match e {
            ImageError::IoError(source) => io_error(path, source),
            other => EncodeError::Image(other),
        })?;
    writer.flush().map_err(|source| io_error(path, source))
}

fn io_error(path: &Path, source: std::io::Error) -> EncodeError {
    EncodeError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{render_reference, RenderParams};

    #[test]
    fn encoded_png_decodes_with_same_dimensions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        let params = RenderParams::new(40, 30, None).with_max_iterations(32);
        let image = render_reference(&params).unwrap().colorize();

        encode_png(&image, &path).unwrap();

        let decoded = image::open(&path).unwrap().to_rgba8();
        assert_eq!(decoded.dimensions(), (40, 30));
        assert_eq!(decoded.as_raw().as_slice(), image.as_bytes());
    }

    #[test]
    fn encoding_overwrites_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.png");
        std::fs::write(&path, b"not a png").unwrap();

        let params = RenderParams::new(8, 8, None);
        encode_png(&render_reference(&params).unwrap().colorize(), &path).unwrap();

        assert_eq!(image::open(&path).unwrap().width(), 8);
    }

    #[test]
    fn missing_directory_reports_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("frame.png");
        let params = RenderParams::new(2, 2, None);
        let err = encode_png(&render_reference(&params).unwrap().colorize(), &path).unwrap_err();
        assert!(matches!(err, EncodeError::Io { .. }));
    }

    /// Accepts `budget` bytes, then fails every write like a full disk.
    struct FullAfter {
        budget: usize,
    }

    impl Write for FullAfter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if self.budget == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "no space left on device",
                ));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_during_encoding_is_io_error() {
        // Well past one BufWriter capacity, so the failure hits mid-encode.
        let params = RenderParams::new(512, 512, None);
        let image = render_reference(&params).unwrap().colorize();
        let writer = BufWriter::new(FullAfter { budget: 1024 });

        let err = write_png(&image, writer, Path::new("full.png")).unwrap_err();
        match err {
            EncodeError::Io { path, source } => {
                assert_eq!(path, "full.png");
                assert!(source.to_string().contains("no space left"));
            }
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn write_failure_at_flush_is_io_error() {
        let params = RenderParams::new(4, 4, None);
        let image = render_reference(&params).unwrap().colorize();
        let writer = BufWriter::new(FullAfter { budget: 0 });

        let err = write_png(&image, writer, Path::new("tiny.png")).unwrap_err();
        assert!(matches!(err, EncodeError::Io { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn large_frame_to_full_device_is_io_error() {
        let params = RenderParams::new(512, 512, None);
        let image = render_reference(&params).unwrap().colorize();
        let err = encode_png(&image, "/dev/full").unwrap_err();
        assert!(matches!(err, EncodeError::Io { .. }), "got {err:?}");
    }
}
