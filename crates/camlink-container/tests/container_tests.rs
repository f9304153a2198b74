//! Integration tests for camlink-container
//!
//! Fixtures are assembled in-test; nothing is read from the repository.

use camlink_container::digest::sha256_hex;
use camlink_container::marker::{MARKER, SIGNATURE_LEN};
use camlink_container::{ContainerError, ImageType, MarkerContainer};

fn container(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut header = serde_json::Map::new();
    let mut payload = Vec::new();
    for (name, data) in files {
        header.insert(
            name.to_string(),
            serde_json::json!({
                "offset": payload.len(),
                "size": data.len(),
                "sha256": sha256_hex(data),
            }),
        );
        payload.extend_from_slice(data);
    }
    let mut buf = serde_json::to_vec(&serde_json::Value::Object(header)).unwrap();
    buf.extend_from_slice(MARKER);
    buf.extend(std::iter::repeat(b'0').take(SIGNATURE_LEN));
    buf.extend_from_slice(&payload);
    buf
}

fn image_set() -> Vec<(&'static str, Vec<u8>)> {
    ImageType::ALL
        .iter()
        .enumerate()
        .map(|(i, ty)| (ty.as_str(), vec![i as u8; 100 + i * 37]))
        .collect()
}

#[test]
fn test_every_image_matches_declared_digest() {
    let files = image_set();
    let parsed = MarkerContainer::parse(container(&files)).unwrap();

    for ty in ImageType::ALL {
        let image = parsed.image(ty).unwrap();
        let declared = &parsed.entry(ty.as_str()).unwrap().sha256;
        assert_eq!(&sha256_hex(&image.data), declared);
        assert!(!image.signed);
    }
}

#[test]
fn test_any_marker_corruption_fails_construction() {
    let buf = container(&image_set());
    let marker_pos = buf
        .windows(MARKER.len())
        .position(|w| w == MARKER)
        .unwrap();

    for i in 0..MARKER.len() {
        let mut corrupted = buf.clone();
        corrupted[marker_pos + i] ^= 0x20;
        assert!(!MarkerContainer::contains(&corrupted));
        assert!(matches!(
            MarkerContainer::parse(corrupted),
            Err(ContainerError::MarkerNotFound)
        ));
    }
}

#[test]
fn test_payload_bit_flip_is_detected_per_image() {
    let files = image_set();
    let mut buf = container(&files);
    // Flip the last payload byte, which belongs to the last image
    let last = buf.len() - 1;
    buf[last] ^= 0x01;

    let parsed = MarkerContainer::parse(buf).unwrap();
    assert!(parsed.image(ImageType::Fsbl).is_ok());
    let err = parsed.image(ImageType::App).unwrap_err();
    assert!(err.is_integrity());
}
