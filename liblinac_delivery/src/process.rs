use std::path::{Path, PathBuf};
use std::sync::mpsc::Sender;

use super::config::Config;
use super::delivery::Delivery;
use super::dicom_plan::delivery_from_dicom_file;
use super::error::{ProcessorError, TrfError};
use super::gantry_selector::metersetmaps_by_gantry;
use super::icom_extract::delivery_from_icom_file;
use super::icom_listener::IcomListener;
use super::listener_status::ListenerStatus;
use super::map_writer::MetersetMapWriter;
use super::metersetmap::{calc_metersetmap, get_grid};
use super::monaco::delivery_from_tel_file;
use super::trf_codes::TrfCodes;
use super::trf_file::TrfFile;

/// The kinds of record a Delivery can be extracted from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Monaco,
    Trf,
    Icom,
    Dicom,
}

impl SourceKind {
    pub fn parse(source: &str) -> Result<Self, ProcessorError> {
        match source.to_lowercase().as_str() {
            "monaco" | "tel" => Ok(Self::Monaco),
            "trf" | "logfile" => Ok(Self::Trf),
            "icom" => Ok(Self::Icom),
            "dicom" | "rtplan" => Ok(Self::Dicom),
            _ => Err(ProcessorError::UnknownSource(source.to_string())),
        }
    }
}

/// Read a Delivery from a file of the given kind
pub fn load_delivery(
    config: &Config,
    kind: SourceKind,
    path: &Path,
) -> Result<Delivery, ProcessorError> {
    let delivery = match kind {
        SourceKind::Monaco => delivery_from_tel_file(path)?,
        SourceKind::Trf => {
            let codes = TrfCodes::new(config.trf_codes_path.as_deref()).map_err(TrfError::from)?;
            TrfFile::from_path(path, &codes)?.delivery()?
        }
        SourceKind::Icom => delivery_from_icom_file(path)?,
        SourceKind::Dicom => delivery_from_dicom_file(path, None)?,
    };
    Ok(delivery)
}

fn output_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().replace('.', "_"))
        .unwrap_or_else(|| String::from("delivery"))
}

/// Extract a Delivery and write its meterset map, or one map per gantry angle.
///
/// Returns the paths written.
pub fn process_extract(
    config: &Config,
    source: &str,
    path: &Path,
    gantry_angles: Option<&[f64]>,
) -> Result<Vec<PathBuf>, ProcessorError> {
    let kind = SourceKind::parse(source)?;
    spdlog::info!("Extracting {kind:?} delivery from {}...", path.to_string_lossy());
    let delivery = load_delivery(config, kind, path)?;

    let map_config = config.metersetmap_config();
    let grid = get_grid(&map_config);
    let writer = MetersetMapWriter::new(&config.get_output_directory()?)?;
    let name = output_name(path);

    let written = match gantry_angles {
        Some(angles) => {
            let maps =
                metersetmaps_by_gantry(&delivery, angles, config.gantry_tolerance, &map_config)?;
            writer.write_gantry_maps(&name, &grid, &maps)?
        }
        None => {
            let map = calc_metersetmap(&delivery, &map_config)?;
            vec![writer.write_map(&name, &grid, &map)?]
        }
    };
    spdlog::info!("Done with {}.", path.to_string_lossy());
    Ok(written)
}

/// Record the iCom stream of a linac into dir until an error occurs,
/// or until max_flushes files have been written
pub fn process_listen(
    config: &Config,
    ip: &str,
    dir: &Path,
    tx: &Sender<ListenerStatus>,
    max_flushes: Option<u64>,
) -> Result<(), ProcessorError> {
    let mut listener = IcomListener::new(config, ip, dir)?;
    spdlog::info!(
        "Listening to iCom at {ip}:{}, writing into {}",
        config.icom_port,
        dir.to_string_lossy()
    );
    let mut flushes = 0;
    loop {
        listener.next_flush(tx)?;
        flushes += 1;
        if max_flushes.is_some_and(|max| flushes >= max) {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map_writer::read_map_file;
    use crate::monaco::tests::tel_control_point;
    use crate::trf_header::tests::synthetic_header;
    use crate::trf_table::tests::set_value;

    fn config(output: &Path) -> Config {
        Config {
            output_path: Some(output.to_path_buf()),
            ..Config::default()
        }
    }

    #[test]
    fn test_source_kinds() {
        assert_eq!(SourceKind::parse("Monaco").unwrap(), SourceKind::Monaco);
        assert_eq!(SourceKind::parse("trf").unwrap(), SourceKind::Trf);
        assert_eq!(SourceKind::parse("icom").unwrap(), SourceKind::Icom);
        assert_eq!(SourceKind::parse("RTPLAN").unwrap(), SourceKind::Dicom);
        assert!(matches!(
            SourceKind::parse("rtdose"),
            Err(ProcessorError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_extract_monaco() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("tel.1");
        std::fs::write(&plan, tel_control_point(1.0, 1.0, "2,2", "0", 5.0, 4.0, 0.0)).unwrap();

        let written =
            process_extract(&config(&dir.path().join("out")), "monaco", &plan, None).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].file_name().unwrap(), "tel_1.yml");

        let record = read_map_file(&written[0]).unwrap();
        let map = record.to_array().unwrap();
        assert_eq!(map.shape(), &[record.jaw.len(), record.mlc.len()]);
        assert!((map.sum() - 400.0).abs() < 1e-6);
    }

    #[test]
    fn test_extract_trf_by_gantry() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = vec![0u8; 700 * 3];
        for row in 0..3 {
            set_value(&mut table, 700, row, 2, 4);
        }
        let mut bytes = synthetic_header("1-1/AP G0");
        bytes.extend_from_slice(&table);
        let log = dir.path().join("field.trf");
        std::fs::write(&log, bytes).unwrap();

        let angles = [0.0];
        let output = config(&dir.path().join("out"));
        let written = process_extract(&output, "trf", &log, Some(&angles[..])).unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].file_name().unwrap(), "field_trf_gantry_0.yml");
    }

    #[test]
    fn test_extract_needs_output() {
        let dir = tempfile::tempdir().unwrap();
        let plan = dir.path().join("tel.1");
        std::fs::write(&plan, tel_control_point(1.0, 1.0, "2,2", "0", 5.0, 4.0, 0.0)).unwrap();
        assert!(matches!(
            process_extract(&Config::default(), "monaco", &plan, None),
            Err(ProcessorError::ConfigError(_))
        ));
    }
}
