use std::{fs, path::Path};

use crate::error::{io_error, DataError, Result};

/// Transcription marking a region the detector should neither learn nor be penalised on.
pub const IGNORE_TRANSCRIPTION: &str = "###";

/// Quadrilateral text region in pixel coordinates, vertices clockwise from top-left.
#[derive(Debug, Clone, PartialEq)]
pub struct TextRegion {
    pub vertices: [(f32, f32); 4],
    pub ignored: bool,
}

impl TextRegion {
    pub fn scaled(&self, scale_x: f32, scale_y: f32) -> Self {
        let mut vertices = self.vertices;
        for (x, y) in vertices.iter_mut() {
            *x *= scale_x;
            *y *= scale_y;
        }
        Self {
            vertices,
            ignored: self.ignored,
        }
    }

    /// Axis-aligned bounds as `(x_min, y_min, x_max, y_max)`.
    pub fn bounds(&self) -> (f32, f32, f32, f32) {
        self.vertices.iter().fold(
            (f32::MAX, f32::MAX, f32::MIN, f32::MIN),
            |(x_min, y_min, x_max, y_max), &(x, y)| {
                (x_min.min(x), y_min.min(y), x_max.max(x), y_max.max(y))
            },
        )
    }

    /// Even-odd point-in-polygon test.
    pub fn contains(&self, x: f32, y: f32) -> bool {
        let mut inside = false;
        let mut j = self.vertices.len() - 1;
        for i in 0..self.vertices.len() {
            let (xi, yi) = self.vertices[i];
            let (xj, yj) = self.vertices[j];
            if (yi > y) != (yj > y) && x < (xj - xi) * (y - yi) / (yj - yi) + xi {
                inside = !inside;
            }
            j = i;
        }
        inside
    }
}

pub fn read_annotations(path: &Path) -> Result<Vec<TextRegion>> {
    let contents = fs::read_to_string(path).map_err(io_error(path))?;
    parse_annotations(path, &contents)
}

/// Parses ICDAR 2015 lines `x1,y1,x2,y2,x3,y3,x4,y4,transcription`.
pub fn parse_annotations(path: &Path, contents: &str) -> Result<Vec<TextRegion>> {
    let mut regions = Vec::new();
    for (index, raw) in contents.lines().enumerate() {
        let line = raw.trim_start_matches('\u{feff}').trim();
        if line.is_empty() {
            continue;
        }

        // Transcriptions may contain commas.
        let fields: Vec<&str> = line.splitn(9, ',').collect();
        if fields.len() < 8 {
            return Err(DataError::Annotation {
                path: path.to_path_buf(),
                line: index + 1,
                reason: format!("expected 8 coordinates, found {}", fields.len()),
            });
        }

        let mut coords = [0f32; 8];
        for (slot, field) in coords.iter_mut().zip(&fields[..8]) {
            *slot = field.trim().parse().map_err(|_| DataError::Annotation {
                path: path.to_path_buf(),
                line: index + 1,
                reason: format!("invalid coordinate '{}'", field.trim()),
            })?;
        }

        let ignored = fields
            .get(8)
            .map(|text| text.trim() == IGNORE_TRANSCRIPTION)
            .unwrap_or(false);

        regions.push(TextRegion {
            vertices: [
                (coords[0], coords[1]),
                (coords[2], coords[3]),
                (coords[4], coords[5]),
                (coords[6], coords[7]),
            ],
            ignored,
        });
    }
    Ok(regions)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_regions_with_bom_and_commas_in_text() {
        let contents = "\u{feff}377,117,463,117,465,130,378,130,Genaxis Theatre\n\
                        493,115,519,115,519,131,493,131,[06]\n\
                        \n\
                        374,155,409,155,409,170,374,170,###\n\
                        10,10,20,10,20,20,10,20,a,b\n";
        let regions = parse_annotations(Path::new("gt_img_1.txt"), contents).unwrap();

        assert_eq!(regions.len(), 4);
        assert_eq!(regions[0].vertices[0], (377.0, 117.0));
        assert!(!regions[0].ignored);
        assert!(regions[2].ignored);
        assert!(!regions[3].ignored);
    }

    #[test]
    fn rejects_short_lines() {
        let err = parse_annotations(Path::new("gt.txt"), "1,2,3,4\n").unwrap_err();
        assert!(matches!(err, DataError::Annotation { line: 1, .. }));
    }

    #[test]
    fn rejects_non_numeric_coordinates() {
        let err = parse_annotations(Path::new("gt.txt"), "1,2,x,4,5,6,7,8,t\n").unwrap_err();
        assert!(matches!(err, DataError::Annotation { .. }));
    }

    #[test]
    fn containment_and_bounds() {
        let region = TextRegion {
            vertices: [(2.0, 2.0), (10.0, 2.0), (10.0, 6.0), (2.0, 6.0)],
            ignored: false,
        };
        assert_eq!(region.bounds(), (2.0, 2.0, 10.0, 6.0));
        assert!(region.contains(5.0, 4.0));
        assert!(!region.contains(11.0, 4.0));
        assert!(!region.contains(5.0, 7.0));

        let scaled = region.scaled(0.5, 2.0);
        assert_eq!(scaled.bounds(), (1.0, 4.0, 5.0, 12.0));
    }
}
