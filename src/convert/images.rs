//! Images to PDF
//!
//! Writes a minimal PDF 1.4 file with one page per image. JPEG sources are
//! re-encoded as JPEG and embedded with `DCTDecode`; everything else is
//! flattened onto white and embedded losslessly with `FlateDecode`.

use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, RgbImage};

use super::{Conversion, ConvertError};

/// Extensions accepted by the images to PDF conversion
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "tif", "tiff", "webp"];

const JPEG_QUALITY: u8 = 85;

/// Points per pixel (72 pt per inch, 96 px per inch)
const POINTS_PER_PIXEL: f64 = 72.0 / 96.0;

/// Build a PDF from images, in order
///
/// Undecodable images are skipped and counted.
pub async fn images_to_pdf(images: Vec<PathBuf>, output: PathBuf) -> Result<Conversion, ConvertError> {
    tokio::task::spawn_blocking(move || build_pdf(&images, &output))
        .await
        .map_err(|e| ConvertError::Io(std::io::Error::other(e)))?
}

fn build_pdf(images: &[PathBuf], output: &Path) -> Result<Conversion, ConvertError> {
    if images.is_empty() {
        return Err(ConvertError::InvalidInput("No images provided".to_string()));
    }

    let mut pages = Vec::with_capacity(images.len());
    let mut skipped = 0;
    for (idx, path) in images.iter().enumerate() {
        match encode_image(path) {
            Ok(page) => pages.push(page),
            Err(e) => {
                tracing::warn!("Image {} ({}) could not be processed, skipping: {}", idx + 1, path.display(), e);
                skipped += 1;
            }
        }
    }

    if pages.is_empty() {
        return Err(ConvertError::InvalidInput("No valid image provided".to_string()));
    }

    let bytes = write_pdf(&pages);
    if let Err(e) = std::fs::write(output, bytes) {
        let _ = std::fs::remove_file(output);
        return Err(e.into());
    }

    tracing::info!(
        "{} image(s) converted to PDF {}, {} skipped",
        pages.len(),
        output.display(),
        skipped
    );
    Ok(Conversion::single(
        output,
        format!("{} image(s) converted to PDF, {} skipped", pages.len(), skipped),
    ))
}

/// An image ready to be embedded as an XObject
struct EmbeddedImage {
    width: u32,
    height: u32,
    filter: &'static str,
    data: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
enum EncodeError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
}

fn encode_image(path: &Path) -> Result<EmbeddedImage, EncodeError> {
    let bytes = std::fs::read(path)?;
    let format = image::guess_format(&bytes)?;
    let decoded = image::load_from_memory_with_format(&bytes, format)?;
    let (width, height) = (decoded.width(), decoded.height());

    if format == ImageFormat::Jpeg {
        let mut data = Vec::new();
        DynamicImage::ImageRgb8(decoded.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut data, JPEG_QUALITY))?;
        return Ok(EmbeddedImage {
            width,
            height,
            filter: "DCTDecode",
            data,
        });
    }

    let rgb = flatten_on_white(&decoded);
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(rgb.as_raw())?;
    Ok(EmbeddedImage {
        width,
        height,
        filter: "FlateDecode",
        data: encoder.finish()?,
    })
}

/// Composite transparent pixels over a white background
fn flatten_on_white(image: &DynamicImage) -> RgbImage {
    let rgba = image.to_rgba8();
    RgbImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let blend = |c: u8| ((c as u32 * a as u32 + 255 * (255 - a as u32)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}

/// Serialize pages into a PDF document
///
/// Object layout: 1 catalog, 2 page tree, then page/content/image triples.
fn write_pdf(pages: &[EmbeddedImage]) -> Vec<u8> {
    let mut pdf = PdfWriter::new(2 + 3 * pages.len());

    let kids: Vec<String> = (0..pages.len()).map(|i| format!("{} 0 R", page_id(i))).collect();
    pdf.object(1, "<< /Type /Catalog /Pages 2 0 R >>");
    pdf.object(
        2,
        &format!("<< /Type /Pages /Kids [{}] /Count {} >>", kids.join(" "), pages.len()),
    );

    for (i, page) in pages.iter().enumerate() {
        let (id, content_id, image_id) = (page_id(i), page_id(i) + 1, page_id(i) + 2);
        let width = points(page.width);
        let height = points(page.height);

        pdf.object(
            id,
            &format!(
                "<< /Type /Page /Parent 2 0 R /MediaBox [0 0 {w} {h}] \
                 /Resources << /XObject << /Im0 {img} 0 R >> >> /Contents {c} 0 R >>",
                w = width,
                h = height,
                img = image_id,
                c = content_id
            ),
        );
        let content = format!("q\n{} 0 0 {} 0 0 cm\n/Im0 Do\nQ\n", width, height);
        pdf.stream(content_id, "", content.as_bytes());
        pdf.stream(
            image_id,
            &format!(
                "/Type /XObject /Subtype /Image /Width {} /Height {} \
                 /ColorSpace /DeviceRGB /BitsPerComponent 8 /Filter /{}",
                page.width, page.height, page.filter
            ),
            &page.data,
        );
    }

    pdf.finish()
}

fn page_id(index: usize) -> usize {
    3 + 3 * index
}

/// Pixel size in points, without trailing zeros
fn points(pixels: u32) -> String {
    let formatted = format!("{:.2}", pixels as f64 * POINTS_PER_PIXEL);
    formatted.trim_end_matches('0').trim_end_matches('.').to_string()
}

struct PdfWriter {
    buf: Vec<u8>,
    /// Byte offset of each object, indexed by id - 1
    offsets: Vec<usize>,
}

impl PdfWriter {
    fn new(objects: usize) -> Self {
        let mut buf = Vec::new();
        buf.extend_from_slice(b"%PDF-1.4\n%\xE2\xE3\xCF\xD3\n");
        Self {
            buf,
            offsets: vec![0; objects],
        }
    }

    fn object(&mut self, id: usize, body: &str) {
        self.offsets[id - 1] = self.buf.len();
        self.buf
            .extend_from_slice(format!("{} 0 obj\n{}\nendobj\n", id, body).as_bytes());
    }

    fn stream(&mut self, id: usize, dict: &str, data: &[u8]) {
        self.offsets[id - 1] = self.buf.len();
        let separator = if dict.is_empty() { "" } else { " " };
        self.buf.extend_from_slice(
            format!("{} 0 obj\n<< {}{}/Length {} >>\nstream\n", id, dict, separator, data.len()).as_bytes(),
        );
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\nendstream\nendobj\n");
    }

    fn finish(mut self) -> Vec<u8> {
        let xref_offset = self.buf.len();
        let size = self.offsets.len() + 1;
        let mut tail = format!("xref\n0 {}\n0000000000 65535 f \n", size);
        for offset in &self.offsets {
            tail.push_str(&format!("{:010} 00000 n \n", offset));
        }
        tail.push_str(&format!(
            "trailer\n<< /Size {} /Root 1 0 R >>\nstartxref\n{}\n%%EOF\n",
            size, xref_offset
        ));
        self.buf.extend_from_slice(tail.as_bytes());
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, Rgba, RgbaImage};
    use tempfile::TempDir;

    fn contains(haystack: &[u8], needle: &str) -> bool {
        haystack.windows(needle.len()).any(|w| w == needle.as_bytes())
    }

    #[test]
    fn test_points_formatting() {
        assert_eq!(points(4), "3");
        assert_eq!(points(3), "2.25");
        assert_eq!(points(96), "72");
        assert_eq!(points(1), "0.75");
    }

    #[test]
    fn test_flatten_on_white() {
        let mut img = RgbaImage::new(2, 1);
        img.put_pixel(0, 0, Rgba([0, 0, 0, 0]));
        img.put_pixel(1, 0, Rgba([10, 20, 30, 255]));
        let flat = flatten_on_white(&DynamicImage::ImageRgba8(img));
        assert_eq!(flat.get_pixel(0, 0), &Rgb([255, 255, 255]));
        assert_eq!(flat.get_pixel(1, 0), &Rgb([10, 20, 30]));
    }

    #[tokio::test]
    async fn test_images_to_pdf_mixed_sources() {
        let dir = TempDir::new().unwrap();
        let png = dir.path().join("scan.png");
        RgbaImage::from_pixel(4, 3, Rgba([255, 0, 0, 128])).save(&png).unwrap();
        let jpg = dir.path().join("photo.jpg");
        RgbImage::from_pixel(8, 8, Rgb([0, 128, 255])).save(&jpg).unwrap();
        let junk = dir.path().join("broken.png");
        std::fs::write(&junk, b"definitely not an image").unwrap();
        let output = dir.path().join("out.pdf");

        let result = images_to_pdf(vec![png, junk, jpg], output.clone()).await.unwrap();

        assert_eq!(result.message, "2 image(s) converted to PDF, 1 skipped");
        let bytes = std::fs::read(&output).unwrap();
        assert!(bytes.starts_with(b"%PDF-1.4"));
        assert!(contains(&bytes, "/Count 2"));
        assert!(contains(&bytes, "/MediaBox [0 0 3 2.25]"));
        assert!(contains(&bytes, "/MediaBox [0 0 6 6]"));
        assert!(contains(&bytes, "/Filter /FlateDecode"));
        assert!(contains(&bytes, "/Filter /DCTDecode"));
        assert!(bytes.ends_with(b"%%EOF\n"));
    }

    #[tokio::test]
    async fn test_images_to_pdf_without_valid_images() {
        let dir = TempDir::new().unwrap();
        let junk = dir.path().join("a.jpg");
        std::fs::write(&junk, b"garbage").unwrap();
        let output = dir.path().join("out.pdf");

        let err = images_to_pdf(vec![junk], output.clone()).await.unwrap_err();
        assert!(matches!(err, ConvertError::InvalidInput(_)));
        assert!(!output.exists());

        let err = images_to_pdf(Vec::new(), output).await.unwrap_err();
        assert_eq!(err.user_message(), "No images provided");
    }

    #[test]
    fn test_xref_points_at_objects() {
        let page = EmbeddedImage {
            width: 2,
            height: 2,
            filter: "FlateDecode",
            data: vec![1, 2, 3],
        };
        let bytes = write_pdf(&[page]);

        let marker = b"startxref\n";
        let start = bytes.windows(marker.len()).rposition(|w| w == marker).unwrap() + marker.len();
        let tail = std::str::from_utf8(&bytes[start..]).unwrap();
        let xref_offset: usize = tail.lines().next().unwrap().parse().unwrap();
        let xref = std::str::from_utf8(&bytes[xref_offset..]).unwrap();
        assert!(xref.starts_with("xref\n0 6\n"));

        for (i, entry) in xref.lines().skip(3).take(5).enumerate() {
            let offset: usize = entry[..10].parse().unwrap();
            assert!(bytes[offset..].starts_with(format!("{} 0 obj", i + 1).as_bytes()));
        }
    }
}
