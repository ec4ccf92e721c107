use crate::{annotation::TextRegion, sample::MapBuffer, GEOMETRY_CHANNELS, OUTPUT_STRIDE};

#[derive(Debug, Clone, PartialEq)]
pub struct LabelMaps {
    pub score_map: MapBuffer,
    pub geometry_map: MapBuffer,
    pub ignore_mask: MapBuffer,
}

/// Rasterises regions (in image pixels) into quarter-resolution label maps.
///
/// A map cell belongs to a region when its centre, projected back to image
/// space, lies inside the quadrilateral. Geometry channels hold the distances
/// from that centre to the region's top, bottom, left and right bounds, and a
/// zero angle. Regions later in the list overwrite earlier ones.
pub fn rasterize(regions: &[TextRegion], image_height: usize, image_width: usize) -> LabelMaps {
    let height = image_height / OUTPUT_STRIDE;
    let width = image_width / OUTPUT_STRIDE;
    let stride = OUTPUT_STRIDE as f32;

    let mut score_map = MapBuffer::zeros([1, height, width]);
    let mut geometry_map = MapBuffer::zeros([GEOMETRY_CHANNELS, height, width]);
    let mut ignore_mask = MapBuffer::zeros([1, height, width]);

    for region in regions {
        let (x_min, y_min, x_max, y_max) = region.bounds();
        let Some((row_start, row_end)) = cell_span(y_min, y_max, stride, height) else {
            continue;
        };
        let Some((col_start, col_end)) = cell_span(x_min, x_max, stride, width) else {
            continue;
        };

        for row in row_start..row_end {
            let py = (row as f32 + 0.5) * stride;
            for col in col_start..col_end {
                let px = (col as f32 + 0.5) * stride;
                if !region.contains(px, py) {
                    continue;
                }
                if region.ignored {
                    ignore_mask.set(0, row, col, 1.0);
                    continue;
                }
                score_map.set(0, row, col, 1.0);
                geometry_map.set(0, row, col, (py - y_min).max(0.0));
                geometry_map.set(1, row, col, (y_max - py).max(0.0));
                geometry_map.set(2, row, col, (px - x_min).max(0.0));
                geometry_map.set(3, row, col, (x_max - px).max(0.0));
                geometry_map.set(4, row, col, 0.0);
            }
        }
    }

    LabelMaps {
        score_map,
        geometry_map,
        ignore_mask,
    }
}

fn cell_span(low: f32, high: f32, stride: f32, cells: usize) -> Option<(usize, usize)> {
    if cells == 0 || high < 0.0 {
        return None;
    }
    let start = (low / stride).floor().max(0.0) as usize;
    let end = ((high / stride).ceil().max(0.0) as usize).min(cells);
    (start < end).then_some((start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rectangle(x0: f32, y0: f32, x1: f32, y1: f32, ignored: bool) -> TextRegion {
        TextRegion {
            vertices: [(x0, y0), (x1, y0), (x1, y1), (x0, y1)],
            ignored,
        }
    }

    #[test]
    fn marks_cells_whose_centre_is_inside() {
        let maps = rasterize(&[rectangle(4.0, 4.0, 12.0, 8.0, false)], 16, 16);

        assert_eq!(maps.score_map.shape, [1, 4, 4]);
        assert_eq!(maps.geometry_map.shape, [5, 4, 4]);
        // Centres at 6 and 10 along x, 6 along y.
        assert_eq!(maps.score_map.get(0, 1, 1), 1.0);
        assert_eq!(maps.score_map.get(0, 1, 2), 1.0);
        assert_eq!(maps.score_map.get(0, 0, 1), 0.0);
        assert_eq!(maps.score_map.data.iter().sum::<f32>(), 2.0);

        assert_eq!(maps.geometry_map.get(0, 1, 1), 2.0);
        assert_eq!(maps.geometry_map.get(1, 1, 1), 2.0);
        assert_eq!(maps.geometry_map.get(2, 1, 1), 2.0);
        assert_eq!(maps.geometry_map.get(3, 1, 1), 6.0);
        assert_eq!(maps.geometry_map.get(4, 1, 1), 0.0);
    }

    #[test]
    fn ignored_regions_only_touch_the_mask() {
        let maps = rasterize(&[rectangle(0.0, 0.0, 16.0, 16.0, true)], 16, 16);

        assert_eq!(maps.ignore_mask.data.iter().sum::<f32>(), 16.0);
        assert!(maps.score_map.data.iter().all(|v| *v == 0.0));
        assert!(maps.geometry_map.data.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn regions_outside_the_image_are_skipped() {
        let maps = rasterize(&[rectangle(40.0, 40.0, 60.0, 60.0, false)], 16, 16);
        assert!(maps.score_map.data.iter().all(|v| *v == 0.0));
    }
}
