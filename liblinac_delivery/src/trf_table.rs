use byteorder::{ByteOrder, LittleEndian};
use fxhash::FxHashMap;
use ndarray::{s, Array2, Array3, ArrayView1};

use super::constants::*;
use super::delivery::Delivery;
use super::error::TrfError;
use super::transforms::{clamped_cumulative, iec_to_bipolar, round_decimals};
use super::trf_codes::TrfCodes;

pub const DOSE_COLUMN: &str = "Step Dose/Actual Value (Mu)";
pub const LINAC_STATE_COLUMN: &str = "Linac State/Actual Value (None)";
pub const WEDGE_COLUMN: &str = "Wedge Position/Actual Value (None)";
pub const GANTRY_COLUMN: &str = "Step Gantry/Scaled Actual (deg)";
pub const COLLIMATOR_COLUMN: &str = "Step Collimator/Scaled Actual (deg)";
pub const X1_DIAPHRAGM_COLUMN: &str = "X1 Diaphragm/Scaled Actual (mm)";
pub const X2_DIAPHRAGM_COLUMN: &str = "X2 Diaphragm/Scaled Actual (mm)";

/// How the raw u16 of a column becomes its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Raw,
    Signed,
    SignedTenth,
    NegatedSignedTenth,
    LinacState,
    Wedge,
}

pub fn leaf_column(bank: &str, leaf: usize) -> String {
    format!("{bank} Leaf {leaf}/Scaled Actual (mm)")
}

fn base_columns() -> Vec<(String, ColumnKind)> {
    use ColumnKind::*;
    let mut columns: Vec<(String, ColumnKind)> = [
        (DOSE_COLUMN, SignedTenth),
        ("Step Dose/Raw Value (1/64th Mu)", Raw),
        (LINAC_STATE_COLUMN, LinacState),
        ("Control point/Actual Value (None)", Signed),
        (WEDGE_COLUMN, Wedge),
        (GANTRY_COLUMN, SignedTenth),
        ("Step Gantry/Positional Error (deg)", SignedTenth),
        (COLLIMATOR_COLUMN, SignedTenth),
        ("Step Collimator/Positional Error (deg)", SignedTenth),
        ("Table Isocentric/Scaled Actual (deg)", Signed),
        ("Table Isocentric/Positional Error (deg)", Signed),
        ("Segment/Actual Value (None)", Raw),
        ("Beam Timer/Actual Value (Sec)", Raw),
        ("PRF Pauses/Actual Value (None)", Raw),
        (X1_DIAPHRAGM_COLUMN, SignedTenth),
        ("X1 Diaphragm/Positional Error (mm)", SignedTenth),
        (X2_DIAPHRAGM_COLUMN, SignedTenth),
        ("X2 Diaphragm/Positional Error (mm)", SignedTenth),
        ("Y1 Diaphragm/Scaled Actual (mm)", SignedTenth),
        ("Y1 Diaphragm/Positional Error (mm)", SignedTenth),
        ("Y2 Diaphragm/Scaled Actual (mm)", SignedTenth),
        ("Y2 Diaphragm/Positional Error (mm)", SignedTenth),
        ("Table Height/Scaled Actual (mm)", SignedTenth),
        ("Table Height/Positional Error (mm)", SignedTenth),
        ("Table Lateral/Scaled Actual (mm)", SignedTenth),
        ("Table Lateral/Positional Error (mm)", SignedTenth),
        ("Table Longitudinal/Scaled Actual (mm)", SignedTenth),
        ("Table Longitudinal/Positional Error (mm)", SignedTenth),
        ("Dlg Y1/Scaled Actual (mm)", SignedTenth),
        ("Dlg Y2/Scaled Actual (mm)", SignedTenth),
    ]
    .iter()
    .map(|(name, kind)| (name.to_string(), *kind))
    .collect();

    // Y2 is the +x bank
    columns.extend((1..=LEAF_PAIRS).map(|n| (leaf_column("Y2", n), NegatedSignedTenth)));
    columns.extend((1..=LEAF_PAIRS).map(|n| (leaf_column("Y1", n), SignedTenth)));
    for bank in ["Y2", "Y1"] {
        columns.extend(
            (1..=LEAF_PAIRS).map(|n| (format!("{bank} Leaf {n}/Positional Error (mm)"), SignedTenth)),
        );
    }
    columns
}

/// Names and conversions of each column for a table with n_columns columns
fn column_layout(n_columns: usize) -> Result<Vec<(String, ColumnKind)>, TrfError> {
    if n_columns == TRF_BASE_COLUMNS {
        Ok(base_columns())
    } else if n_columns == TRF_BASE_COLUMNS + TRF_EXTRA_COLUMNS {
        let mut columns: Vec<(String, ColumnKind)> = (1..=TRF_EXTRA_COLUMNS)
            .map(|n| (format!("Integrity 4/Extra {n} (None)"), ColumnKind::Raw))
            .collect();
        columns.extend(base_columns());
        Ok(columns)
    } else {
        Err(TrfError::UnexpectedColumnCount(n_columns))
    }
}

/// Recover a negative value stored as u16
fn signed(value: u16) -> f64 {
    let value = u32::from(value);
    if value > TRF_SIGNED_THRESHOLD {
        (i64::from(value) - i64::from(TRF_SIGNED_OFFSET)) as f64
    } else {
        value as f64
    }
}

fn decode_rows(bytes: &[u8], row_width: usize) -> Result<Array2<u16>, TrfError> {
    let mut values = vec![0u16; bytes.len() / 2];
    LittleEndian::read_u16_into(bytes, &mut values);
    Ok(Array2::from_shape_vec(
        (bytes.len() / row_width, row_width / 2),
        values,
    )?)
}

/// Try every row width that fits the table. Exactly one must decode to known linac states.
fn select_encoding(bytes: &[u8], codes: &TrfCodes) -> Result<Array2<u16>, TrfError> {
    let candidates: Vec<&(usize, usize)> = TRF_ROW_LAYOUTS
        .iter()
        .filter(|(width, _)| !bytes.is_empty() && bytes.len() % width == 0)
        .collect();
    if candidates.is_empty() {
        return Err(TrfError::UnexpectedTableLength(bytes.len()));
    }

    let mut passing = Vec::new();
    for (width, state_column) in candidates {
        let rows = decode_rows(bytes, *width)?;
        if rows
            .column(*state_column)
            .iter()
            .all(|code| codes.is_linac_state(*code))
        {
            passing.push((*width, rows));
        }
    }

    match passing.len() {
        0 => Err(TrfError::NoValidEncoding(bytes.len())),
        1 => {
            let (width, rows) = passing.remove(0);
            spdlog::debug!(
                "Trajectory log table uses {width} byte rows ({} rows)",
                rows.nrows()
            );
            Ok(rows)
        }
        _ => Err(TrfError::AmbiguousEncoding(bytes.len())),
    }
}

fn map_codes<'a, F>(raw: ArrayView1<u16>, name: &str, lookup: F) -> Result<Vec<String>, TrfError>
where
    F: Fn(u16) -> Option<&'a str>,
{
    let mut unknown: Vec<u16> = raw
        .iter()
        .copied()
        .filter(|code| lookup(*code).is_none())
        .collect();
    if !unknown.is_empty() {
        unknown.sort_unstable();
        unknown.dedup();
        return Err(TrfError::UnknownCode {
            name: name.to_string(),
            codes: unknown,
        });
    }
    Ok(raw
        .iter()
        .map(|code| lookup(*code).unwrap_or_default().to_string())
        .collect())
}

/// The decoded table of a trajectory log, one row per sample
#[derive(Debug, Clone)]
pub struct TrfTable {
    names: Vec<String>,
    index: FxHashMap<String, usize>,
    time: Vec<f64>,
    values: Array2<f64>,
    linac_state: Vec<String>,
    wedge_position: Vec<String>,
}

impl TrfTable {
    pub fn decode(bytes: &[u8], codes: &TrfCodes) -> Result<Self, TrfError> {
        let raw = select_encoding(bytes, codes)?;
        let layout = column_layout(raw.ncols())?;

        let mut values = Array2::<f64>::zeros(raw.dim());
        let mut linac_state = Vec::new();
        let mut wedge_position = Vec::new();
        for (idx, (_, kind)) in layout.iter().enumerate() {
            let column = raw.column(idx);
            let mut target = values.column_mut(idx);
            match kind {
                ColumnKind::Raw => target.assign(&column.mapv(f64::from)),
                ColumnKind::Signed => target.assign(&column.mapv(signed)),
                ColumnKind::SignedTenth => target.assign(&column.mapv(|v| signed(v) / 10.0)),
                ColumnKind::NegatedSignedTenth => {
                    target.assign(&column.mapv(|v| -signed(v) / 10.0))
                }
                ColumnKind::LinacState => {
                    target.assign(&column.mapv(f64::from));
                    linac_state = map_codes(column, "linac state", |c| codes.linac_state(c))?;
                }
                ColumnKind::Wedge => {
                    target.assign(&column.mapv(f64::from));
                    wedge_position = map_codes(column, "wedge", |c| codes.wedge(c))?;
                }
            }
        }

        let time = (0..raw.nrows())
            .map(|row| round_decimals(row as f64 * codes.time_increment, TRF_TIME_DECIMALS))
            .collect();
        let names: Vec<String> = layout.into_iter().map(|(name, _)| name).collect();
        let index = names
            .iter()
            .enumerate()
            .map(|(idx, name)| (name.clone(), idx))
            .collect();

        Ok(Self {
            names,
            index,
            time,
            values,
            linac_state,
            wedge_position,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Seconds since the start of the log
    pub fn time(&self) -> &[f64] {
        &self.time
    }

    pub fn column(&self, name: &str) -> Result<ArrayView1<f64>, TrfError> {
        match self.index.get(name) {
            Some(idx) => Ok(self.values.column(*idx)),
            None => Err(TrfError::MissingColumn(name.to_string())),
        }
    }

    pub fn linac_state(&self) -> &[String] {
        &self.linac_state
    }

    pub fn wedge_position(&self) -> &[String] {
        &self.wedge_position
    }

    pub fn len(&self) -> usize {
        self.values.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the Delivery recorded by the log
    pub fn delivery(&self) -> Result<Delivery, TrfError> {
        let monitor_units = clamped_cumulative(&self.column(DOSE_COLUMN)?.to_vec());
        let gantry = iec_to_bipolar(&self.column(GANTRY_COLUMN)?.to_vec())?;
        let collimator = iec_to_bipolar(&self.column(COLLIMATOR_COLUMN)?.to_vec())?;

        let mut mlc = Array3::<f64>::zeros((self.len(), LEAF_PAIRS, 2));
        for leaf in 0..LEAF_PAIRS {
            mlc.slice_mut(s![.., leaf, 0])
                .assign(&self.column(&leaf_column("Y1", leaf + 1))?);
            mlc.slice_mut(s![.., leaf, 1])
                .assign(&self.column(&leaf_column("Y2", leaf + 1))?);
        }

        let mut jaw = Array2::<f64>::zeros((self.len(), 2));
        jaw.column_mut(0).assign(&self.column(X1_DIAPHRAGM_COLUMN)?);
        jaw.column_mut(1).assign(&self.column(X2_DIAPHRAGM_COLUMN)?);

        Ok(Delivery::new(monitor_units, gantry, collimator, mlc, jaw)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Write value into column of row for a table of row_width bytes
    pub(crate) fn set_value(table: &mut [u8], row_width: usize, row: usize, column: usize, value: u16) {
        let offset = row * row_width + 2 * column;
        LittleEndian::write_u16(&mut table[offset..offset + 2], value);
    }

    fn codes() -> TrfCodes {
        TrfCodes::new(None).unwrap()
    }

    #[test]
    fn test_legacy_width_selected() {
        // 123900 bytes is 177 rows of 700 or 175 rows of 708
        let mut table = vec![0u8; 123900];
        for row in 0..177 {
            set_value(&mut table, 700, row, 2, 3);
        }
        let decoded = TrfTable::decode(&table, &codes()).unwrap();
        assert_eq!(decoded.len(), 177);
        assert_eq!(decoded.names().len(), TRF_BASE_COLUMNS);
        assert_eq!(decoded.linac_state()[0], "Ready");
        assert_eq!(decoded.wedge_position()[176], "No Wedge");
        assert_eq!(decoded.time()[1], 0.04);
        assert_eq!(decoded.time()[176], 7.04);
    }

    #[test]
    fn test_ambiguous_width() {
        let table: Vec<u8> = [2u8, 0].repeat(123900 / 2);
        assert!(matches!(
            TrfTable::decode(&table, &codes()),
            Err(TrfError::AmbiguousEncoding(123900))
        ));
    }

    #[test]
    fn test_bad_lengths() {
        assert!(matches!(
            TrfTable::decode(&[0u8; 702], &codes()),
            Err(TrfError::UnexpectedTableLength(702))
        ));
        assert!(matches!(
            TrfTable::decode(&[], &codes()),
            Err(TrfError::UnexpectedTableLength(0))
        ));
        assert!(matches!(
            TrfTable::decode(&[0u8; 700], &codes()),
            Err(TrfError::NoValidEncoding(700))
        ));
        assert!(matches!(
            column_layout(351),
            Err(TrfError::UnexpectedColumnCount(351))
        ));
    }

    #[test]
    fn test_newer_width_has_extra_columns() {
        let mut table = vec![0u8; 708];
        set_value(&mut table, 708, 0, 6, 4);
        let decoded = TrfTable::decode(&table, &codes()).unwrap();
        assert_eq!(decoded.names().len(), 354);
        assert_eq!(decoded.names()[0], "Integrity 4/Extra 1 (None)");
        assert_eq!(decoded.names()[6], LINAC_STATE_COLUMN);
        assert_eq!(decoded.linac_state(), &["Radiation On"]);
    }

    #[test]
    fn test_unknown_wedge_code() {
        let mut table = vec![0u8; 700];
        set_value(&mut table, 700, 0, 2, 4);
        set_value(&mut table, 700, 0, 4, 7);
        match TrfTable::decode(&table, &codes()) {
            Err(TrfError::UnknownCode { name, codes }) => {
                assert_eq!(name, "wedge");
                assert_eq!(codes, vec![7]);
            }
            _ => panic!(),
        }
    }

    #[test]
    fn test_signed_and_scaled_columns() {
        let mut table = vec![0u8; 1400];
        for row in 0..2 {
            set_value(&mut table, 700, row, 2, 4);
        }
        set_value(&mut table, 700, 1, 0, 25);
        set_value(&mut table, 700, 1, 3, 65535);
        set_value(&mut table, 700, 1, 5, 65436);
        set_value(&mut table, 700, 1, 14, 150);
        set_value(&mut table, 700, 1, 16, 160);
        set_value(&mut table, 700, 1, 30, 50);
        set_value(&mut table, 700, 1, 110, 60);
        set_value(&mut table, 700, 1, 190, 65526);

        let decoded = TrfTable::decode(&table, &codes()).unwrap();
        assert_eq!(decoded.column(DOSE_COLUMN).unwrap()[1], 2.5);
        assert_eq!(
            decoded.column("Control point/Actual Value (None)").unwrap()[1],
            -1.0
        );
        assert_eq!(decoded.column(GANTRY_COLUMN).unwrap()[1], -10.0);
        assert_eq!(decoded.column(&leaf_column("Y2", 1)).unwrap()[1], -5.0);
        assert_eq!(decoded.column(&leaf_column("Y1", 1)).unwrap()[1], 6.0);
        assert_eq!(
            decoded.column("Y2 Leaf 1/Positional Error (mm)").unwrap()[1],
            -1.0
        );
        assert!(matches!(
            decoded.column("Couch Pitch"),
            Err(TrfError::MissingColumn(_))
        ));

        let delivery = decoded.delivery().unwrap();
        assert_eq!(delivery.monitor_units(), &[0.0, 2.5]);
        assert_eq!(delivery.gantry(), &[0.0, -10.0]);
        assert_eq!(delivery.mlc()[[1, 0, 0]], 6.0);
        assert_eq!(delivery.mlc()[[1, 0, 1]], -5.0);
        assert_eq!(delivery.jaw()[[1, 0]], 15.0);
        assert_eq!(delivery.jaw()[[1, 1]], 16.0);
    }
}
