//! Upload and artifact fixtures.

#![allow(dead_code)]

use std::io::Cursor;

use serde_json::{json, Value};

use atlas::Upload;

/// A small, decodable PNG.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::new();
    image::RgbImage::from_pixel(width, height, image::Rgb([90, 120, 200]))
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .expect("Failed to encode PNG fixture");
    out
}

/// `count` PNG uploads named `view-<n>.png`.
pub fn png_uploads(count: usize) -> Vec<Upload> {
    (0..count)
        .map(|i| Upload::from_bytes(&format!("view-{}.png", i), png_bytes(8, 6)))
        .collect()
}

/// `count` uploads of `size` filler bytes each, with a JPEG file name.
pub fn sized_uploads(count: usize, size: usize) -> Vec<Upload> {
    (0..count)
        .map(|i| Upload::from_bytes(&format!("shot-{}.jpg", i), vec![0xAB; size]))
        .collect()
}

fn pad4(mut data: Vec<u8>, fill: u8) -> Vec<u8> {
    while data.len() % 4 != 0 {
        data.push(fill);
    }
    data
}

/// A binary glTF container holding only `gltf` as its JSON chunk.
pub fn glb_from_json(gltf: &Value) -> Vec<u8> {
    let json = pad4(serde_json::to_vec(gltf).expect("Failed to encode glTF"), b' ');
    let total = 12 + 8 + json.len();

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(b"glTF");
    out.extend_from_slice(&2u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&0x4E4F_534Au32.to_le_bytes());
    out.extend_from_slice(&json);
    out
}

/// One triangle spanning a 2 x 1 x 0 box.
pub fn minimal_glb() -> Vec<u8> {
    glb_from_json(&json!({
        "asset": {"version": "2.0"},
        "accessors": [
            {"count": 3, "min": [0.0, 0.0, 0.0], "max": [2.0, 1.0, 0.0]}
        ],
        "meshes": [{"primitives": [{"attributes": {"POSITION": 0}}]}]
    }))
}
