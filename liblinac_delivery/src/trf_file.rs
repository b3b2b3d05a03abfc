use std::path::Path;

use super::delivery::Delivery;
use super::error::TrfError;
use super::shared_file::read_shared;
use super::trf_codes::TrfCodes;
use super::trf_header::TrfHeader;
use super::trf_table::TrfTable;

/// A decoded Elekta trajectory log (.trf)
#[derive(Debug, Clone)]
pub struct TrfFile {
    pub header: TrfHeader,
    pub table: TrfTable,
}

impl TrfFile {
    pub fn from_bytes(bytes: &[u8], codes: &TrfCodes) -> Result<Self, TrfError> {
        let header = TrfHeader::decode(bytes)?;
        let table = TrfTable::decode(&bytes[header.length..], codes)?;
        spdlog::info!(
            "Decoded trajectory log for field {}/{} on {} ({} rows)",
            header.field_label,
            header.field_name,
            header.machine,
            table.len()
        );
        Ok(Self { header, table })
    }

    /// Read a log the linac may still be writing to
    pub fn from_path(path: &Path, codes: &TrfCodes) -> Result<Self, TrfError> {
        let bytes = read_shared(path)?;
        Self::from_bytes(&bytes, codes)
    }

    pub fn delivery(&self) -> Result<Delivery, TrfError> {
        self.table.delivery()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trf_header::tests::synthetic_header;
    use crate::trf_table::tests::set_value;

    fn log_bytes() -> Vec<u8> {
        let mut table = vec![0u8; 123900];
        for row in 0..177 {
            set_value(&mut table, 700, row, 2, 4);
            set_value(&mut table, 700, row, 0, 1);
        }
        let mut bytes = synthetic_header("1-1/AP G0");
        bytes.extend_from_slice(&table);
        bytes
    }

    #[test]
    fn test_decode_log() {
        let codes = TrfCodes::new(None).unwrap();
        let log = TrfFile::from_bytes(&log_bytes(), &codes).unwrap();
        assert_eq!(log.header.machine, "2619");
        assert_eq!(log.table.len(), 177);

        // Step dose stays at 0.1 MU so nothing accumulates
        let delivery = log.delivery().unwrap();
        assert_eq!(delivery.len(), 177);
        assert_eq!(delivery.total_mu(), 0.0);
        assert_eq!(delivery.num_leaf_pairs(), 80);
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("field.trf");
        std::fs::write(&path, log_bytes()).unwrap();
        let codes = TrfCodes::new(None).unwrap();
        let log = TrfFile::from_path(&path, &codes).unwrap();
        assert_eq!(log.header.field_name, "AP G0");

        assert!(matches!(
            TrfFile::from_path(&dir.path().join("missing.trf"), &codes),
            Err(TrfError::FileError(_))
        ));
    }
}
