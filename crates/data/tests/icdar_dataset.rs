use std::fs;

use east_data::{DataError, DetectionDataset, IcdarDataset, InMemoryDataset};
use image::{Rgb, RgbImage};
use tempfile::tempdir;

fn write_image(path: &std::path::Path, width: u32, height: u32) {
    let mut image = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));
    for y in 8..24 {
        for x in 8..40 {
            image.put_pixel(x, y, Rgb([255, 255, 255]));
        }
    }
    image.save(path).expect("write image");
}

#[test]
fn loads_resized_sample_with_label_maps() {
    let tmp = tempdir().expect("tempdir");
    let images = tmp.path().join("images");
    let gts = tmp.path().join("gt");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&gts).unwrap();

    write_image(&images.join("img_1.png"), 64, 32);
    fs::write(
        gts.join("gt_img_1.txt"),
        "8,8,40,8,40,24,8,24,hello\n48,0,63,0,63,8,48,8,###\n",
    )
    .unwrap();

    let dataset = IcdarDataset::open(&images, &gts, 32).expect("open dataset");
    assert_eq!(dataset.len(), 1);

    let sample = dataset.get(0).expect("sample");
    assert_eq!(sample.image.shape, [3, 32, 32]);
    assert_eq!(sample.score_map.shape, [1, 8, 8]);
    assert_eq!(sample.geometry_map.shape, [5, 8, 8]);
    assert_eq!(sample.ignore_mask.shape, [1, 8, 8]);

    assert!(sample.image.data.iter().all(|v| (-1.0..=1.0).contains(v)));
    assert!(sample.score_map.data.iter().sum::<f32>() > 0.0);
    assert!(sample.ignore_mask.data.iter().sum::<f32>() > 0.0);
}

#[test]
fn accepts_plain_stem_ground_truth_names() {
    let tmp = tempdir().expect("tempdir");
    write_image(&tmp.path().join("a.png"), 48, 48);
    fs::write(tmp.path().join("a.txt"), "8,8,40,8,40,24,8,24,x\n").unwrap();

    let dataset = IcdarDataset::open(tmp.path(), tmp.path(), 16).expect("open dataset");
    assert_eq!(dataset.len(), 1);
    assert_eq!(dataset.get(0).unwrap().score_map.shape, [1, 4, 4]);
}

#[test]
fn missing_ground_truth_is_reported_at_open() {
    let tmp = tempdir().expect("tempdir");
    let images = tmp.path().join("images");
    let gts = tmp.path().join("gt");
    fs::create_dir_all(&images).unwrap();
    fs::create_dir_all(&gts).unwrap();
    write_image(&images.join("img_7.png"), 32, 32);

    let err = IcdarDataset::open(&images, &gts, 32).unwrap_err();
    assert!(matches!(err, DataError::MissingGroundTruth(_)));
}

#[test]
fn input_size_must_be_multiple_of_stride() {
    let tmp = tempdir().expect("tempdir");
    let err = IcdarDataset::open(tmp.path(), tmp.path(), 30).unwrap_err();
    assert!(matches!(err, DataError::InvalidConfig(_)));
}

#[test]
fn synthetic_samples_have_positive_regions() {
    let dataset = InMemoryDataset::synthetic(5, 16).expect("synthetic");
    assert_eq!(dataset.len(), 5);
    for index in 0..dataset.len() {
        let sample = dataset.get(index).unwrap();
        assert!(sample.score_map.data.iter().sum::<f32>() >= 1.0);
    }
    assert_ne!(dataset.get(0).unwrap(), dataset.get(1).unwrap());
    assert!(matches!(
        dataset.get(5),
        Err(DataError::IndexOutOfRange { index: 5, len: 5 })
    ));
}
