//! Generated media for E2E testing

use image::{ImageFormat, Rgb, RgbImage};
use std::io::Cursor;

/// A media file to upload, with the outcome the import should reach.
#[derive(Debug, Clone)]
pub struct MediaFixture {
    pub file_name: &'static str,
    pub should_import: bool,
    pub description: &'static str,
}

pub const BATCH_FIXTURES: &[MediaFixture] = &[
    MediaFixture {
        file_name: "first_pitch.jpg",
        should_import: true,
        description: "Plain JPEG still",
    },
    MediaFixture {
        file_name: "dugout.png",
        should_import: true,
        description: "PNG still",
    },
    MediaFixture {
        file_name: "lineup.txt",
        should_import: false,
        description: "Unsupported format, fails as malformed",
    },
];

/// Encode a small gradient so the image transcoder has real pixels to scale.
pub fn encoded_image(file_name: &str) -> Vec<u8> {
    let img = RgbImage::from_fn(640, 480, |x, y| Rgb([(x % 256) as u8, (y % 256) as u8, 96]));
    let format = ImageFormat::from_path(file_name).unwrap_or(ImageFormat::Jpeg);
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("Failed to encode fixture image");
    out.into_inner()
}

pub fn fixture_bytes(fixture: &MediaFixture) -> Vec<u8> {
    if fixture.should_import {
        encoded_image(fixture.file_name)
    } else {
        b"Leadoff: #7".to_vec()
    }
}
