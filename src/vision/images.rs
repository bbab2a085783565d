//! 写真の前処理
//!
//! デコード → 長辺を上限に縮小 → RGB の JPEG に再エンコード。
//! 同一画像判定用に SHA-256 を保持する。

use crate::error::{ListingAiError, Result};
use crate::fetcher::RateLimitedFetcher;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use image::codecs::jpeg::JpegEncoder;
use sha2::{Digest, Sha256};
use tracing::warn;

/// 送信用に整形済みの画像
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub mime_type: String,
    pub data: Vec<u8>,
    /// data の SHA-256（16進）
    pub digest: String,
}

impl PreparedImage {
    pub fn from_jpeg(data: Vec<u8>) -> Self {
        let digest = hex::encode(Sha256::digest(&data));
        Self {
            mime_type: "image/jpeg".into(),
            data,
            digest,
        }
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.data)
    }
}

/// 掲載写真1枚
#[derive(Debug, Clone, PartialEq)]
pub struct Photo {
    pub index: usize,
    pub url: String,
    pub image: PreparedImage,
}

/// 画像バイト列を整形
pub fn prepare_image(bytes: &[u8], max_edge: u32, quality: u8) -> Result<PreparedImage> {
    let decoded = image::load_from_memory(bytes)
        .map_err(|e| ListingAiError::Image(format!("デコード失敗: {}", e)))?;

    let resized = if decoded.width() > max_edge || decoded.height() > max_edge {
        decoded.thumbnail(max_edge, max_edge)
    } else {
        decoded
    };
    let rgb = resized.to_rgb8();

    let mut data = Vec::new();
    JpegEncoder::new_with_quality(&mut data, quality.clamp(1, 100))
        .encode_image(&rgb)
        .map_err(|e| ListingAiError::Image(format!("エンコード失敗: {}", e)))?;

    Ok(PreparedImage::from_jpeg(data))
}

/// 写真のダウンロード結果
#[derive(Debug, Default)]
pub struct DownloadedPhotos {
    pub photos: Vec<Photo>,
    /// 取得・デコードに失敗したURL
    pub failed: Vec<String>,
}

/// 写真を順に取得して整形
///
/// インデックスは入力URLの順番。失敗した写真は `failed` に入る。
pub async fn download_photos(
    fetcher: &RateLimitedFetcher,
    urls: &[String],
    max_edge: u32,
    quality: u8,
) -> DownloadedPhotos {
    let mut downloaded = DownloadedPhotos::default();

    for (index, url) in urls.iter().enumerate() {
        let bytes = match fetcher.get(url).await {
            Ok(result) if result.is_success() => result.body,
            Ok(result) => {
                warn!(url = %url, status = result.status, "写真の取得に失敗");
                downloaded.failed.push(url.clone());
                continue;
            }
            Err(e) => {
                warn!(url = %url, error = %e, "写真の取得に失敗");
                downloaded.failed.push(url.clone());
                continue;
            }
        };

        let prepared = tokio::task::spawn_blocking(move || prepare_image(&bytes, max_edge, quality))
            .await
            .map_err(|e| ListingAiError::Image(e.to_string()))
            .and_then(|r| r);
        match prepared {
            Ok(image) => downloaded.photos.push(Photo {
                index,
                url: url.clone(),
                image,
            }),
            Err(e) => {
                warn!(url = %url, error = %e, "写真の整形に失敗");
                downloaded.failed.push(url.clone());
            }
        }
    }

    downloaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb(color));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).expect("PNG生成失敗");
        out.into_inner()
    }

    #[test]
    fn test_prepare_image_downscales() {
        let prepared = prepare_image(&png(1600, 400, [200, 10, 10]), 800, 75).expect("整形失敗");
        let decoded = image::load_from_memory(&prepared.data).expect("JPEGとして読めるべき");
        assert_eq!(decoded.width(), 800);
        assert_eq!(decoded.height(), 200);
        assert_eq!(prepared.mime_type, "image/jpeg");
    }

    #[test]
    fn test_small_image_keeps_size() {
        let prepared = prepare_image(&png(64, 48, [0, 0, 255]), 800, 75).expect("整形失敗");
        let decoded = image::load_from_memory(&prepared.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (64, 48));
    }

    #[test]
    fn test_identical_input_same_digest() {
        let a = prepare_image(&png(32, 32, [1, 2, 3]), 800, 75).unwrap();
        let b = prepare_image(&png(32, 32, [1, 2, 3]), 800, 75).unwrap();
        let c = prepare_image(&png(32, 32, [250, 2, 3]), 800, 75).unwrap();
        assert_eq!(a.digest, b.digest);
        assert_ne!(a.digest, c.digest);
    }

    #[test]
    fn test_invalid_bytes() {
        assert!(matches!(prepare_image(b"not an image", 800, 75), Err(ListingAiError::Image(_))));
    }
}
