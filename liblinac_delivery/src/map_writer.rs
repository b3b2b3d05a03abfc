use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::error::MapWriterError;
use super::gantry_selector::GantryMaps;
use super::metersetmap::MetersetGrid;

/// This is the version of the output format
const FORMAT_VERSION: &str = "1.0";

/// One meterset map as stored on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetersetMapRecord {
    pub version: String,
    pub mlc: Vec<f64>,
    pub jaw: Vec<f64>,
    /// Rows follow jaw, columns follow mlc
    pub metersetmap: Vec<Vec<f64>>,
    pub gantry_angle: Option<f64>,
    pub normalisation: Option<f64>,
}

impl MetersetMapRecord {
    pub fn to_array(&self) -> Result<Array2<f64>, ndarray::ShapeError> {
        let n_rows = self.metersetmap.len();
        let n_cols = self.metersetmap.first().map(|row| row.len()).unwrap_or(0);
        let flat: Vec<f64> = self.metersetmap.iter().flatten().copied().collect();
        Array2::from_shape_vec((n_rows, n_cols), flat)
    }
}

/// Writes meterset maps and their axes as YAML files into a directory
#[derive(Debug)]
pub struct MetersetMapWriter {
    directory: PathBuf,
}

impl MetersetMapWriter {
    pub fn new(directory: &Path) -> Result<Self, MapWriterError> {
        std::fs::create_dir_all(directory)?;
        Ok(Self {
            directory: directory.to_path_buf(),
        })
    }

    fn write_record(&self, name: &str, record: &MetersetMapRecord) -> Result<PathBuf, MapWriterError> {
        let path = self.directory.join(format!("{name}.yml"));
        std::fs::write(&path, serde_yaml::to_string(record)?)?;
        spdlog::info!("Wrote meterset map to {}", path.to_string_lossy());
        Ok(path)
    }

    /// Write a full delivery map
    pub fn write_map(
        &self,
        name: &str,
        grid: &MetersetGrid,
        map: &Array2<f64>,
    ) -> Result<PathBuf, MapWriterError> {
        let record = MetersetMapRecord {
            version: format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION),
            mlc: grid.mlc.clone(),
            jaw: grid.jaw.clone(),
            metersetmap: map.outer_iter().map(|row| row.to_vec()).collect(),
            gantry_angle: None,
            normalisation: None,
        };
        self.write_record(name, &record)
    }

    /// Write one file per gantry angle, named {name}_gantry_{angle}
    pub fn write_gantry_maps(
        &self,
        name: &str,
        grid: &MetersetGrid,
        maps: &GantryMaps,
    ) -> Result<Vec<PathBuf>, MapWriterError> {
        maps.angles
            .iter()
            .zip(maps.maps.iter())
            .map(|(angle, map)| {
                let record = MetersetMapRecord {
                    version: format!("{}:{}", env!("CARGO_PKG_NAME"), FORMAT_VERSION),
                    mlc: grid.mlc.clone(),
                    jaw: grid.jaw.clone(),
                    metersetmap: map.outer_iter().map(|row| row.to_vec()).collect(),
                    gantry_angle: Some(*angle),
                    normalisation: Some(maps.normalisation),
                };
                self.write_record(&format!("{name}_gantry_{angle}"), &record)
            })
            .collect()
    }
}

/// Read a map written by MetersetMapWriter
pub fn read_map_file(path: &Path) -> Result<MetersetMapRecord, MapWriterError> {
    let yaml_str = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&yaml_str)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_write_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetersetMapWriter::new(&dir.path().join("maps")).unwrap();
        let grid = MetersetGrid {
            mlc: vec![-0.5, 0.5, 1.5],
            jaw: vec![-1.0, 1.0],
        };
        let map = array![[0.0, 1.5, 2.0], [3.0, 0.25, 0.0]];

        let path = writer.write_map("field", &grid, &map).unwrap();
        assert_eq!(path.file_name().unwrap(), "field.yml");
        let record = read_map_file(&path).unwrap();
        assert_eq!(record.mlc, grid.mlc);
        assert_eq!(record.jaw, grid.jaw);
        assert_eq!(record.to_array().unwrap(), map);
        assert_eq!(record.gantry_angle, None);
    }

    #[test]
    fn test_write_gantry_maps() {
        let dir = tempfile::tempdir().unwrap();
        let writer = MetersetMapWriter::new(dir.path()).unwrap();
        let grid = MetersetGrid {
            mlc: vec![0.0],
            jaw: vec![0.0],
        };
        let maps = GantryMaps {
            angles: vec![0.0, 90.0],
            maps: vec![array![[1.0]], array![[2.0]]],
            normalisation: 1.5,
        };
        let paths = writer.write_gantry_maps("arc", &grid, &maps).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1].file_name().unwrap(), "arc_gantry_90.yml");
        let record = read_map_file(&paths[1]).unwrap();
        assert_eq!(record.gantry_angle, Some(90.0));
        assert_eq!(record.normalisation, Some(1.5));
        assert_eq!(record.metersetmap, vec![vec![2.0]]);
    }
}
